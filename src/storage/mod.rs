//! Blob store backends.
//!
//! The [`backend::BlobStore`] trait abstracts over where object bytes
//! live.  Implementations are an in-process store for development and a
//! presigning client for AWS S3.

pub mod aws;
pub mod backend;
pub mod memory;
