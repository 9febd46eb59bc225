//! DropVault library -- multipart upload coordinator.
//!
//! This crate decides how a file reaches object storage (one presigned
//! PUT, or a multipart session with one presigned grant per chunk),
//! tracks per-chunk progress, and finalizes the merge.  Object bytes never
//! pass through the service except when the in-process blob store is
//! used for development.

use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metadata;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod upload;
pub mod validation;

use crate::auth::IdentityProvider;
use crate::config::Config;
use crate::metadata::store::MetadataStore;
use crate::storage::backend::BlobStore;
use crate::storage::memory::MemoryBlobStore;
use crate::upload::UploadService;

/// Shared application state passed to all handlers via `axum::extract::State`.
///
/// The metadata and blob stores are injected here and owned by
/// [`UploadService`]; no handler reaches a store directly.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Set when the in-process blob store is active; serves `/blobs`.
    pub local_blobs: Option<Arc<MemoryBlobStore>>,
    /// Bearer-token verification.
    pub identity: Arc<dyn IdentityProvider>,
    /// The upload coordinator.
    pub uploads: UploadService,
}

impl AppState {
    pub fn new(
        config: Config,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        local_blobs: Option<Arc<MemoryBlobStore>>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let uploads = UploadService::new(metadata, blobs, &config.upload);
        Self {
            config,
            local_blobs,
            identity,
            uploads,
        }
    }
}
