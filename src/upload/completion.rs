//! Completion coordination.
//!
//! Completeness is derived from the chunk rows on every call.  Only an
//! explicit `finalize` merges the parts and moves the file to
//! `completed`; a complete set of chunk reports changes nothing on its
//! own.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

use super::UploadService;
use crate::errors::UploadError;
use crate::metadata::store::{ChunkStatus, FileChunk, FileMetadata, UploadStatus};
use crate::metrics::{ABORTS_TOTAL, FINALIZATIONS_TOTAL};
use crate::storage::backend::CompleteOutcome;

/// Snapshot of a file's chunk rows.
#[derive(Debug, Clone)]
pub struct Completeness {
    pub is_complete: bool,
    /// Sorted by chunk number.
    pub chunks: Vec<FileChunk>,
}

impl Completeness {
    pub fn uploaded_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Uploaded)
            .count()
    }
}

/// Answer to `POST /files/{id}/complete`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finalized {
    pub file_id: String,
    pub total_chunks: u32,
    pub completed_at: DateTime<Utc>,
}

/// Every one of `total_chunks` rows exists and is uploaded.
fn is_complete(total_chunks: u32, chunks: &[FileChunk]) -> bool {
    total_chunks > 0
        && chunks.len() == total_chunks as usize
        && chunks.iter().all(|c| c.status == ChunkStatus::Uploaded)
}

impl UploadService {
    /// Whether every chunk of `file_id` is uploaded, with the rows.
    pub async fn check_complete(&self, file_id: &str) -> Result<Completeness, UploadError> {
        let record = self
            .metadata
            .get_file(file_id)
            .await?
            .ok_or_else(|| UploadError::not_found("File"))?;
        self.completeness(&record).await
    }

    pub(crate) async fn completeness(
        &self,
        record: &FileMetadata,
    ) -> Result<Completeness, UploadError> {
        let chunks = self.metadata.list_chunks(&record.file_id).await?;
        Ok(Completeness {
            is_complete: is_complete(record.total_chunks(), &chunks),
            chunks,
        })
    }

    /// Merge the uploaded parts and mark the file completed.
    ///
    /// Finalizing a completed file succeeds again without touching the
    /// blob store.  If the merge fails the file stays `uploading`.
    pub async fn finalize(&self, owner_id: &str, file_id: &str) -> Result<Finalized, UploadError> {
        let mut record = self.load_owned(owner_id, file_id).await?;
        let Some(multipart) = record.multipart.clone() else {
            return Err(UploadError::conflict(
                "single uploads are complete once the object is written",
            ));
        };

        match record.status {
            UploadStatus::Completed => {
                counter!(FINALIZATIONS_TOTAL, "outcome" => "repeat").increment(1);
                return Ok(Finalized {
                    file_id: record.file_id,
                    total_chunks: multipart.total_chunks,
                    completed_at: record.completed_at.unwrap_or(record.created_at),
                });
            }
            UploadStatus::Failed => {
                return Err(UploadError::conflict("upload was aborted"));
            }
            UploadStatus::Uploading => {}
        }

        let completeness = self.completeness(&record).await?;
        if !completeness.is_complete {
            counter!(FINALIZATIONS_TOTAL, "outcome" => "incomplete").increment(1);
            return Err(UploadError::conflict(format!(
                "{} of {} chunks uploaded",
                completeness.uploaded_chunks(),
                multipart.total_chunks
            )));
        }

        let parts: Vec<(u32, String)> = completeness
            .chunks
            .into_iter()
            .map(|c| (c.chunk_number, c.checksum.unwrap_or_default()))
            .collect();

        let outcome = match self
            .blobs
            .complete_multipart_session(&record.storage_key, &multipart.storage_upload_id, parts)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                counter!(FINALIZATIONS_TOTAL, "outcome" => "merge_failed").increment(1);
                return Err(e.into());
            }
        };
        if outcome == CompleteOutcome::AlreadyCompleted {
            warn!(file_id = %file_id, "Multipart session was already merged");
            if !self.blobs.object_exists(&record.storage_key).await? {
                counter!(FINALIZATIONS_TOTAL, "outcome" => "session_lost").increment(1);
                return Err(UploadError::conflict(
                    "multipart session no longer exists; abort and upload again",
                ));
            }
        }

        let completed_at = Utc::now();
        record.status = UploadStatus::Completed;
        record.completed_at = Some(completed_at);
        self.metadata.put_file(record).await?;

        counter!(FINALIZATIONS_TOTAL, "outcome" => "completed").increment(1);
        info!(
            file_id = %file_id,
            total_chunks = multipart.total_chunks,
            "Finalized multipart upload"
        );
        Ok(Finalized {
            file_id: file_id.to_string(),
            total_chunks: multipart.total_chunks,
            completed_at,
        })
    }

    /// Abandon an in-progress multipart upload.
    ///
    /// The blob store session is discarded first; the file is marked
    /// `failed` only once that succeeds.  Aborting twice is harmless.
    pub async fn abort(&self, owner_id: &str, file_id: &str) -> Result<FileMetadata, UploadError> {
        let mut record = self.load_owned(owner_id, file_id).await?;
        let Some(multipart) = record.multipart.clone() else {
            return Err(UploadError::conflict("single uploads cannot be aborted"));
        };

        match record.status {
            UploadStatus::Failed => return Ok(record),
            UploadStatus::Completed => {
                return Err(UploadError::conflict("upload is already completed"));
            }
            UploadStatus::Uploading => {}
        }

        self.blobs
            .abort_multipart_session(&record.storage_key, &multipart.storage_upload_id)
            .await?;
        record.status = UploadStatus::Failed;
        self.metadata.put_file(record.clone()).await?;

        counter!(ABORTS_TOTAL).increment(1);
        info!(file_id = %file_id, "Aborted multipart upload");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::MetadataStore;
    use crate::storage::backend::BlobStore;
    use crate::upload::chunks::ChunkOutcome;
    use crate::upload::testing::{fixture, small_fixture, Fixture, GIB, OWNER};
    use crate::validation::UploadUrlRequest;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;

    async fn plan(fx: &Fixture, filename: &str, size: u64) -> String {
        let request = UploadUrlRequest {
            filename: filename.to_string(),
            size: Some(size as i64),
            content_type: None,
        };
        fx.service.plan(OWNER, request).await.unwrap().file_id
    }

    async fn upload(fx: &Fixture, file_id: &str, n: u32) {
        fx.service
            .report_chunk(OWNER, file_id, n, ChunkOutcome::Uploaded, Some(format!("etag-{n}")))
            .await
            .unwrap();
    }

    #[test]
    fn test_is_complete_rules() {
        let mut chunks: Vec<FileChunk> = (1..=3)
            .map(|n| FileChunk::pending("f", n, 10))
            .collect();
        assert!(!is_complete(3, &chunks));
        for c in chunks.iter_mut() {
            c.status = ChunkStatus::Uploaded;
        }
        assert!(is_complete(3, &chunks));
        assert!(!is_complete(4, &chunks));
        assert!(!is_complete(0, &[]));
        chunks[1].status = ChunkStatus::Failed;
        assert!(!is_complete(3, &chunks));
    }

    #[tokio::test]
    async fn test_video_scenario() {
        let fx = fixture();
        let file_id = plan(&fx, "video.mp4", 12 * GIB).await;

        upload(&fx, &file_id, 1).await;
        upload(&fx, &file_id, 2).await;
        assert!(!fx.service.check_complete(&file_id).await.unwrap().is_complete);

        upload(&fx, &file_id, 3).await;
        let completeness = fx.service.check_complete(&file_id).await.unwrap();
        assert!(completeness.is_complete);
        assert_eq!(completeness.uploaded_chunks(), 3);

        // Completeness alone never finalizes.
        let record = fx.metadata.get_file(&file_id).await.unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Uploading);
        assert_eq!(fx.blobs.complete_calls.load(Ordering::SeqCst), 0);

        let done = fx.service.finalize(OWNER, &file_id).await.unwrap();
        assert_eq!(done.total_chunks, 3);
        let record = fx.metadata.get_file(&file_id).await.unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Completed);
        assert_eq!(record.completed_at, Some(done.completed_at));
    }

    #[tokio::test]
    async fn test_finalize_twice_is_idempotent() {
        let fx = fixture();
        let file_id = plan(&fx, "video.mp4", 6 * GIB).await;
        upload(&fx, &file_id, 1).await;
        upload(&fx, &file_id, 2).await;

        let first = fx.service.finalize(OWNER, &file_id).await.unwrap();
        let second = fx.service.finalize(OWNER, &file_id).await.unwrap();
        assert_eq!(first.completed_at, second.completed_at);
        assert_eq!(fx.blobs.complete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finalize_incomplete_conflicts() {
        let fx = fixture();
        let file_id = plan(&fx, "video.mp4", 12 * GIB).await;
        upload(&fx, &file_id, 1).await;

        let err = fx.service.finalize(OWNER, &file_id).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        assert!(err.to_string().contains("1 of 3"));
    }

    #[tokio::test]
    async fn test_merge_failure_keeps_uploading() {
        let fx = fixture();
        let file_id = plan(&fx, "video.mp4", 6 * GIB).await;
        upload(&fx, &file_id, 1).await;
        upload(&fx, &file_id, 2).await;
        fx.blobs.fail_complete.store(true, Ordering::SeqCst);

        let err = fx.service.finalize(OWNER, &file_id).await.unwrap_err();
        assert_eq!(err.code(), "STORAGE_UNAVAILABLE");
        let record = fx.metadata.get_file(&file_id).await.unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Uploading);
        assert!(record.completed_at.is_none());

        fx.blobs.fail_complete.store(false, Ordering::SeqCst);
        fx.service.finalize(OWNER, &file_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_finalize_single_conflicts() {
        let fx = fixture();
        let file_id = plan(&fx, "note.txt", 100).await;
        let err = fx.service.finalize(OWNER, &file_id).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_bytes_are_merged_in_order() {
        let fx = small_fixture();
        let file_id = plan(&fx, "data.bin", 10).await;
        let record = fx.metadata.get_file(&file_id).await.unwrap().unwrap();
        let session = record.multipart.as_ref().unwrap().storage_upload_id.clone();

        let payloads = [&b"abcd"[..], &b"efgh"[..], &b"ij"[..]];
        for (i, payload) in payloads.iter().enumerate() {
            let n = i as u32 + 1;
            let etag = fx
                .blobs
                .inner
                .accept_part(&session, n, Bytes::copy_from_slice(payload))
                .await
                .unwrap();
            fx.service
                .report_chunk(OWNER, &file_id, n, ChunkOutcome::Uploaded, Some(etag))
                .await
                .unwrap();
        }

        fx.service.finalize(OWNER, &file_id).await.unwrap();
        let merged = fx.blobs.inner.read_object(&record.storage_key).await.unwrap();
        assert_eq!(&merged[..], b"abcdefghij");
    }

    /// Plan a 10-byte file on the small fixture and upload its three parts.
    async fn upload_small(fx: &Fixture) -> (String, FileMetadata) {
        let file_id = plan(fx, "data.bin", 10).await;
        let record = fx.metadata.get_file(&file_id).await.unwrap().unwrap();
        let session = record.multipart.as_ref().unwrap().storage_upload_id.clone();
        for (i, payload) in [&b"abcd"[..], &b"efgh"[..], &b"ij"[..]].iter().enumerate() {
            let n = i as u32 + 1;
            let etag = fx
                .blobs
                .inner
                .accept_part(&session, n, Bytes::copy_from_slice(payload))
                .await
                .unwrap();
            fx.service
                .report_chunk(OWNER, &file_id, n, ChunkOutcome::Uploaded, Some(etag))
                .await
                .unwrap();
        }
        (file_id, record)
    }

    #[tokio::test]
    async fn test_finalize_retry_after_metadata_failure() {
        let fx = small_fixture();
        let (file_id, record) = upload_small(&fx).await;
        fx.metadata.fail_put_file.store(true, Ordering::SeqCst);

        let err = fx.service.finalize(OWNER, &file_id).await.unwrap_err();
        assert_eq!(err.code(), "STORAGE_UNAVAILABLE");
        // Merged upstream, but the record still says uploading.
        assert!(fx.blobs.inner.read_object(&record.storage_key).await.is_some());
        let stored = fx.metadata.get_file(&file_id).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Uploading);

        fx.metadata.fail_put_file.store(false, Ordering::SeqCst);
        fx.service.finalize(OWNER, &file_id).await.unwrap();
        let stored = fx.metadata.get_file(&file_id).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Completed);
        assert_eq!(fx.blobs.complete_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_finalize_after_session_lost_upstream() {
        let fx = small_fixture();
        let (file_id, record) = upload_small(&fx).await;
        let session = record.multipart.as_ref().unwrap().storage_upload_id.clone();
        fx.blobs
            .inner
            .abort_multipart_session(&record.storage_key, &session)
            .await
            .unwrap();

        assert!(fx.service.finalize(OWNER, &file_id).await.is_err());
        let stored = fx.metadata.get_file(&file_id).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Uploading);
        assert!(fx.blobs.inner.read_object(&record.storage_key).await.is_none());
    }

    #[tokio::test]
    async fn test_already_merged_without_object_conflicts() {
        let fx = small_fixture();
        let (file_id, record) = upload_small(&fx).await;
        fx.blobs.report_merged.store(true, Ordering::SeqCst);

        let err = fx.service.finalize(OWNER, &file_id).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        let stored = fx.metadata.get_file(&file_id).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Uploading);
        assert!(stored.completed_at.is_none());
        assert!(fx.blobs.inner.read_object(&record.storage_key).await.is_none());
    }

    #[tokio::test]
    async fn test_abort() {
        let fx = fixture();
        let file_id = plan(&fx, "video.mp4", 6 * GIB).await;

        let record = fx.service.abort(OWNER, &file_id).await.unwrap();
        assert_eq!(record.status, UploadStatus::Failed);
        // Second abort is a no-op.
        fx.service.abort(OWNER, &file_id).await.unwrap();

        let err = fx.service.finalize(OWNER, &file_id).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        let err = fx
            .service
            .report_chunk(OWNER, &file_id, 1, ChunkOutcome::Uploaded, Some("e".into()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_abort_completed_conflicts() {
        let fx = fixture();
        let file_id = plan(&fx, "video.mp4", 5 * GIB).await;
        upload(&fx, &file_id, 1).await;
        fx.service.finalize(OWNER, &file_id).await.unwrap();

        let err = fx.service.abort(OWNER, &file_id).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }
}
