//! Multipart upload coordinator.
//!
//! [`UploadService`] owns the two store handles and the grant issuer.  Its
//! operations are split by concern:
//!
//! - [`planner`]: single vs. multipart decision, session allocation and
//!   the initial metadata write
//! - [`chunks`]: per-chunk outcome reports and grant reissue
//! - [`completion`]: completeness, finalize and abort
//! - [`files`]: owner-scoped queries, download grants and deletion
//!
//! Handlers are stateless; no per-upload lock is taken here.  Correctness
//! rests on the stores' per-item atomic writes.

pub mod chunks;
pub mod completion;
pub mod files;
pub mod grants;
pub mod plan;
pub mod planner;

use std::sync::Arc;
use std::time::Duration;

use crate::config::UploadConfig;
use crate::errors::UploadError;
use crate::metadata::store::{FileMetadata, MetadataStore};
use crate::storage::backend::BlobStore;

use self::grants::AccessGrantIssuer;
use self::plan::PlanLimits;

pub struct UploadService {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    grants: AccessGrantIssuer,
    limits: PlanLimits,
    max_file_size: u64,
}

impl UploadService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        config: &UploadConfig,
    ) -> Self {
        let grants = AccessGrantIssuer::new(
            Arc::clone(&blobs),
            Duration::from_secs(config.grant_ttl_secs),
        );
        Self {
            metadata,
            blobs,
            grants,
            limits: PlanLimits::from(config),
            max_file_size: config.max_file_size,
        }
    }

    /// Load a file record and check that `owner_id` owns it.
    ///
    /// Another owner's file answers `NotFound`, so ids cannot be enumerated.
    async fn load_owned(&self, owner_id: &str, file_id: &str) -> Result<FileMetadata, UploadError> {
        match self.metadata.get_file(file_id).await? {
            Some(record) if record.owner_id == owner_id => Ok(record),
            _ => Err(UploadError::not_found("File")),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the coordinator tests.

    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use super::UploadService;
    use crate::config::UploadConfig;
    use crate::metadata::memory::MemoryMetadataStore;
    use crate::metadata::store::{ChunkStatus, FileChunk, FileMetadata, MetadataStore};
    use crate::storage::backend::{BlobStore, CompleteOutcome};
    use crate::storage::memory::MemoryBlobStore;

    pub const GIB: u64 = 1024 * 1024 * 1024;
    pub const OWNER: &str = "u-alice";

    /// A [`MemoryBlobStore`] whose calls can be made to fail on demand.
    pub struct FlakyBlobStore {
        pub inner: MemoryBlobStore,
        pub fail_create: AtomicBool,
        pub fail_complete: AtomicBool,
        pub fail_delete: AtomicBool,
        /// Merge through the inner store, checking part bytes and etags.
        /// Off by default since most tests never upload any bytes.
        pub strict_merge: AtomicBool,
        /// Answer every merge with `AlreadyCompleted`, as S3 does once a
        /// session is gone for any reason.
        pub report_merged: AtomicBool,
        pub complete_calls: AtomicUsize,
    }

    impl FlakyBlobStore {
        pub fn new() -> Self {
            Self {
                inner: MemoryBlobStore::new("http://blobs.test", "test-key"),
                fail_create: AtomicBool::new(false),
                fail_complete: AtomicBool::new(false),
                fail_delete: AtomicBool::new(false),
                strict_merge: AtomicBool::new(false),
                report_merged: AtomicBool::new(false),
                complete_calls: AtomicUsize::new(0),
            }
        }

        fn check(flag: &AtomicBool, op: &str) -> anyhow::Result<()> {
            if flag.load(Ordering::SeqCst) {
                anyhow::bail!("injected {op} failure");
            }
            Ok(())
        }
    }

    impl BlobStore for FlakyBlobStore {
        fn put_object_grant(
            &self,
            key: &str,
            ttl: Duration,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
            self.inner.put_object_grant(key, ttl)
        }

        fn get_object_grant(
            &self,
            key: &str,
            ttl: Duration,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
            self.inner.get_object_grant(key, ttl)
        }

        fn create_multipart_session(
            &self,
            key: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
            let key = key.to_string();
            Box::pin(async move {
                Self::check(&self.fail_create, "create")?;
                self.inner.create_multipart_session(&key).await
            })
        }

        fn put_part_grant(
            &self,
            key: &str,
            session_id: &str,
            part_number: u32,
            ttl: Duration,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
            self.inner.put_part_grant(key, session_id, part_number, ttl)
        }

        fn complete_multipart_session(
            &self,
            key: &str,
            session_id: &str,
            parts: Vec<(u32, String)>,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<CompleteOutcome>> + Send + '_>> {
            let key = key.to_string();
            let session_id = session_id.to_string();
            Box::pin(async move {
                self.complete_calls.fetch_add(1, Ordering::SeqCst);
                Self::check(&self.fail_complete, "complete")?;
                if self.report_merged.load(Ordering::SeqCst) {
                    return Ok(CompleteOutcome::AlreadyCompleted);
                }
                if !self.strict_merge.load(Ordering::SeqCst) {
                    return Ok(CompleteOutcome::Completed);
                }
                self.inner
                    .complete_multipart_session(&key, &session_id, parts)
                    .await
            })
        }

        fn abort_multipart_session(
            &self,
            key: &str,
            session_id: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            self.inner.abort_multipart_session(key, session_id)
        }

        fn object_exists(
            &self,
            key: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
            self.inner.object_exists(key)
        }

        fn delete_object(
            &self,
            key: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            let key = key.to_string();
            Box::pin(async move {
                Self::check(&self.fail_delete, "delete")?;
                self.inner.delete_object(&key).await
            })
        }
    }

    /// A [`MemoryMetadataStore`] whose file writes can be made to fail.
    pub struct FlakyMetadataStore {
        pub inner: MemoryMetadataStore,
        pub fail_put_file_if_absent: AtomicBool,
        pub fail_put_file: AtomicBool,
    }

    impl FlakyMetadataStore {
        pub fn new() -> Self {
            Self {
                inner: MemoryMetadataStore::new(),
                fail_put_file_if_absent: AtomicBool::new(false),
                fail_put_file: AtomicBool::new(false),
            }
        }
    }

    impl MetadataStore for FlakyMetadataStore {
        fn put_file_if_absent(
            &self,
            record: FileMetadata,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async move {
                FlakyBlobStore::check(&self.fail_put_file_if_absent, "put_file_if_absent")?;
                self.inner.put_file_if_absent(record).await
            })
        }

        fn get_file(
            &self,
            file_id: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileMetadata>>> + Send + '_>> {
            self.inner.get_file(file_id)
        }

        fn put_file(
            &self,
            record: FileMetadata,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async move {
                FlakyBlobStore::check(&self.fail_put_file, "put_file")?;
                self.inner.put_file(record).await
            })
        }

        fn delete_file(
            &self,
            file_id: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            self.inner.delete_file(file_id)
        }

        fn list_files_by_owner(
            &self,
            owner_id: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<FileMetadata>>> + Send + '_>> {
            self.inner.list_files_by_owner(owner_id)
        }

        fn put_chunk(
            &self,
            chunk: FileChunk,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            self.inner.put_chunk(chunk)
        }

        fn get_chunk(
            &self,
            file_id: &str,
            chunk_number: u32,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileChunk>>> + Send + '_>> {
            self.inner.get_chunk(file_id, chunk_number)
        }

        fn list_chunks(
            &self,
            file_id: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<FileChunk>>> + Send + '_>> {
            self.inner.list_chunks(file_id)
        }

        fn update_chunk_status(
            &self,
            file_id: &str,
            chunk_number: u32,
            status: ChunkStatus,
            checksum: Option<String>,
            uploaded_at: Option<DateTime<Utc>>,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
            self.inner
                .update_chunk_status(file_id, chunk_number, status, checksum, uploaded_at)
        }
    }

    pub struct Fixture {
        pub service: UploadService,
        pub metadata: Arc<FlakyMetadataStore>,
        pub blobs: Arc<FlakyBlobStore>,
    }

    /// Service with production limits: 5 GiB threshold and chunk size.
    pub fn fixture() -> Fixture {
        fixture_with(UploadConfig::default())
    }

    /// Service with tiny limits, so real bytes can flow through the
    /// in-memory blob store.
    pub fn small_fixture() -> Fixture {
        let fx = fixture_with(UploadConfig {
            multipart_threshold: 8,
            chunk_size: 4,
            max_file_size: 1024,
            max_parts: 100,
            grant_ttl_secs: 900,
        });
        fx.blobs.strict_merge.store(true, Ordering::SeqCst);
        fx
    }

    pub fn fixture_with(config: UploadConfig) -> Fixture {
        let metadata = Arc::new(FlakyMetadataStore::new());
        let blobs = Arc::new(FlakyBlobStore::new());
        let service = UploadService::new(metadata.clone(), blobs.clone(), &config);
        Fixture {
            service,
            metadata,
            blobs,
        }
    }
}
