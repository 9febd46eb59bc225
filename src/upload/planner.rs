//! Upload planning.
//!
//! Turns a validated upload request into a persisted `FileMetadata`
//! record plus the grants the client needs.  Storage is allocated
//! before metadata is written; a metadata failure after allocation is
//! logged and counted as an orphan, never rolled back.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, error, info};

use super::grants::Grant;
use super::plan::{decide, ChunkPlan, UploadDecision};
use super::UploadService;
use crate::errors::UploadError;
use crate::metadata::store::{
    FileChunk, FileExists, FileMetadata, MultipartPlan, UploadStatus, UploadType,
};
use crate::metrics::{ORPHANED_ALLOCATIONS_TOTAL, UPLOAD_PLANS_TOTAL};
use crate::validation::UploadUrlRequest;

/// Write grant for one chunk of a multipart upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkGrant {
    pub chunk_number: u32,
    pub url: String,
    pub expires_at: DateTime<Utc>,
    /// Bytes the client must send for this chunk.
    pub size: u64,
}

/// Answer to `POST /files/upload-url`.
///
/// Single uploads carry `url`/`expiresAt`; multipart uploads carry the
/// chunk layout and one grant per chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPlan {
    pub file_id: String,
    pub upload_type: UploadType,
    #[serde(flatten)]
    pub grant: Option<Grant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkGrant>>,
}

impl UploadService {
    /// Plan an upload for `owner_id`.
    ///
    /// Validation runs before any store call.  On success exactly one
    /// file record exists and, for multipart, one pending chunk row per
    /// part.
    pub async fn plan(
        &self,
        owner_id: &str,
        request: UploadUrlRequest,
    ) -> Result<UploadPlan, UploadError> {
        let upload = request.validate_upload(self.max_file_size)?;
        let decision = decide(upload.size, &self.limits)?;

        let file_id = uuid::Uuid::new_v4().to_string();
        let storage_key = format!("{file_id}-{}", upload.filename);

        let mut record = FileMetadata {
            file_id: file_id.clone(),
            filename: upload.filename,
            content_type: upload.content_type,
            total_size: upload.size.unwrap_or(0),
            upload_type: UploadType::Single,
            status: UploadStatus::Uploading,
            storage_key,
            multipart: None,
            owner_id: owner_id.to_string(),
            created_at: Utc::now(),
            completed_at: None,
        };

        let plan = match decision {
            UploadDecision::Single => self.plan_single(&record).await?,
            UploadDecision::Multipart(layout) => self.plan_multipart(&mut record, layout).await?,
        };

        counter!(UPLOAD_PLANS_TOTAL, "upload_type" => record.upload_type.as_str()).increment(1);
        info!(
            file_id = %record.file_id,
            owner = %record.owner_id,
            upload_type = record.upload_type.as_str(),
            total_chunks = record.total_chunks(),
            "Planned upload"
        );
        Ok(plan)
    }

    async fn plan_single(&self, record: &FileMetadata) -> Result<UploadPlan, UploadError> {
        let grant = self.grants.grant_write(&record.storage_key).await?;
        self.create_record(record.clone()).await?;

        Ok(UploadPlan {
            file_id: record.file_id.clone(),
            upload_type: UploadType::Single,
            grant: Some(grant),
            chunk_size: None,
            total_chunks: None,
            chunks: None,
        })
    }

    async fn plan_multipart(
        &self,
        record: &mut FileMetadata,
        layout: ChunkPlan,
    ) -> Result<UploadPlan, UploadError> {
        let session_id = self
            .blobs
            .create_multipart_session(&record.storage_key)
            .await?;
        debug!(
            file_id = %record.file_id,
            session_id = %session_id,
            "Opened multipart session"
        );

        let mut grants = Vec::with_capacity(layout.total_chunks as usize);
        for (chunk_number, size) in layout.chunks() {
            let grant = self
                .grants
                .grant_write_part(&record.storage_key, &session_id, chunk_number)
                .await
                .map_err(|e| orphaned(record, &session_id, e))?;
            grants.push(ChunkGrant {
                chunk_number,
                url: grant.url,
                expires_at: grant.expires_at,
                size,
            });
        }

        record.upload_type = UploadType::Multipart;
        record.multipart = Some(MultipartPlan {
            storage_upload_id: session_id.clone(),
            chunk_size: layout.chunk_size,
            total_chunks: layout.total_chunks,
        });

        match self.create_record(record.clone()).await {
            Ok(()) => {}
            Err(UploadError::StorageUnavailable(e)) => return Err(orphaned(record, &session_id, e)),
            Err(other) => return Err(other),
        }

        for (chunk_number, size) in layout.chunks() {
            self.metadata
                .put_chunk(FileChunk::pending(&record.file_id, chunk_number, size))
                .await
                .map_err(|e| orphaned(record, &session_id, e))?;
        }

        Ok(UploadPlan {
            file_id: record.file_id.clone(),
            upload_type: UploadType::Multipart,
            grant: None,
            chunk_size: Some(layout.chunk_size),
            total_chunks: Some(layout.total_chunks),
            chunks: Some(grants),
        })
    }

    async fn create_record(&self, record: FileMetadata) -> Result<(), UploadError> {
        let file_id = record.file_id.clone();
        self.metadata
            .put_file_if_absent(record)
            .await
            .map_err(|e| {
                if e.downcast_ref::<FileExists>().is_some() {
                    UploadError::conflict(format!("file {file_id} already exists"))
                } else {
                    UploadError::StorageUnavailable(e)
                }
            })
    }
}

/// Report storage allocated for `record` that has no complete metadata.
fn orphaned(record: &FileMetadata, session_id: &str, cause: anyhow::Error) -> UploadError {
    error!(
        file_id = %record.file_id,
        storage_key = %record.storage_key,
        session_id = %session_id,
        "Multipart session orphaned after failure: {cause:#}"
    );
    counter!(ORPHANED_ALLOCATIONS_TOTAL).increment(1);
    UploadError::StorageUnavailable(cause)
}

#[cfg(test)]
mod tests {
    use crate::metadata::store::{ChunkStatus, MetadataStore, UploadStatus, UploadType};
    use crate::upload::testing::{fixture, GIB, OWNER};
    use crate::validation::UploadUrlRequest;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::atomic::Ordering;

    fn request(filename: &str, size: Option<i64>) -> UploadUrlRequest {
        UploadUrlRequest {
            filename: filename.to_string(),
            size,
            content_type: None,
        }
    }

    #[tokio::test]
    async fn test_plan_small_file_is_single() {
        let fx = fixture();
        let plan = fx.service.plan(OWNER, request("note.txt", Some(100))).await.unwrap();

        assert_eq!(plan.upload_type, UploadType::Single);
        let grant = plan.grant.expect("single upload carries a grant");
        assert!(grant.url.contains("op=put"));
        assert!(plan.chunks.is_none());

        let record = fx.metadata.get_file(&plan.file_id).await.unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Uploading);
        assert_eq!(record.upload_type, UploadType::Single);
        assert_eq!(record.storage_key, format!("{}-note.txt", plan.file_id));
        assert_eq!(record.content_type, "application/octet-stream");
        assert_eq!(record.total_size, 100);
        assert!(record.multipart.is_none());
        assert!(fx.metadata.list_chunks(&plan.file_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_without_size_is_single() {
        let fx = fixture();
        let plan = fx.service.plan(OWNER, request("blob.bin", None)).await.unwrap();
        assert_eq!(plan.upload_type, UploadType::Single);
        let record = fx.metadata.get_file(&plan.file_id).await.unwrap().unwrap();
        assert_eq!(record.total_size, 0);
    }

    #[tokio::test]
    async fn test_plan_twelve_gib_video() {
        let fx = fixture();
        let plan = fx
            .service
            .plan(OWNER, request("video.mp4", Some(12 * GIB as i64)))
            .await
            .unwrap();

        assert_eq!(plan.upload_type, UploadType::Multipart);
        assert_eq!(plan.total_chunks, Some(3));
        assert_eq!(plan.chunk_size, Some(5 * GIB));
        let chunks = plan.chunks.unwrap();
        let sizes: Vec<u64> = chunks.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![5 * GIB, 5 * GIB, 2 * GIB]);
        assert!(chunks[2].url.contains("partNumber=3"));

        let record = fx.metadata.get_file(&plan.file_id).await.unwrap().unwrap();
        let multipart = record.multipart.unwrap();
        assert_eq!(multipart.total_chunks, 3);
        assert!(!multipart.storage_upload_id.is_empty());

        let rows = fx.metadata.list_chunks(&plan.file_id).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|c| c.status == ChunkStatus::Pending));
        assert_eq!(rows[2].expected_size, 2 * GIB);
    }

    #[tokio::test]
    async fn test_validation_precedes_store_calls() {
        let fx = fixture();
        fx.blobs.fail_create.store(true, Ordering::SeqCst);

        let err = fx
            .service
            .plan(OWNER, request("bad/name.mp4", Some(12 * GIB as i64)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = fx
            .service
            .plan(OWNER, request("huge.iso", Some(51 * GIB as i64)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(fx.metadata.list_files_by_owner(OWNER).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_keeps_declared_content_type() {
        let fx = fixture();
        let request = UploadUrlRequest {
            filename: "clip.mp4".to_string(),
            size: Some(12 * GIB as i64),
            content_type: Some("video/mp4".to_string()),
        };
        let plan = fx.service.plan(OWNER, request).await.unwrap();
        assert_eq!(plan.upload_type, UploadType::Multipart);

        let record = fx.metadata.get_file(&plan.file_id).await.unwrap().unwrap();
        assert_eq!(record.content_type, "video/mp4");
    }

    #[test]
    fn test_metadata_failure_after_session_is_orphaned() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let fx = fixture();
        fx.metadata.fail_put_file_if_absent.store(true, Ordering::SeqCst);

        let err = metrics::with_local_recorder(&recorder, || {
            tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
                .block_on(fx.service.plan(OWNER, request("video.mp4", Some(6 * GIB as i64))))
                .unwrap_err()
        });

        assert_eq!(err.code(), "STORAGE_UNAVAILABLE");
        assert!(handle
            .render()
            .contains("dropvault_orphaned_allocations_total 1"));

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let files = rt
            .block_on(fx.metadata.list_files_by_owner(OWNER))
            .unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_single_plan_metadata_failure() {
        let fx = fixture();
        fx.metadata.fail_put_file_if_absent.store(true, Ordering::SeqCst);

        let err = fx
            .service
            .plan(OWNER, request("note.txt", Some(100)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_UNAVAILABLE");
        assert!(fx.metadata.list_files_by_owner(OWNER).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_failure_persists_nothing() {
        let fx = fixture();
        fx.blobs.fail_create.store(true, Ordering::SeqCst);

        let err = fx
            .service
            .plan(OWNER, request("video.mp4", Some(6 * GIB as i64)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORAGE_UNAVAILABLE");
        assert!(fx.metadata.list_files_by_owner(OWNER).await.unwrap().is_empty());
    }
}
