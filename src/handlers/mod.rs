//! HTTP handlers for the DropVault API.

pub mod blobs;
pub mod files;
