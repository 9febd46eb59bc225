//! Metadata storage layer.
//!
//! The metadata store keeps track of uploaded files and their chunks.
//! The [`store::MetadataStore`] trait defines the interface;
//! [`memory::MemoryMetadataStore`] is the default implementation and
//! [`dynamodb::DynamoDbMetadataStore`] the production one.

pub mod dynamodb;
pub mod memory;
pub mod store;
