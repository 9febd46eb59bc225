//! Owner-scoped file queries, download grants and deletion.

use metrics::counter;
use serde::Serialize;
use tracing::info;

use super::grants::Grant;
use super::UploadService;
use crate::errors::UploadError;
use crate::metadata::store::{FileChunk, FileMetadata, UploadStatus, UploadType};
use crate::metrics::DELETIONS_TOTAL;

/// Answer to `GET /files/{id}/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub file_id: String,
    pub status: UploadStatus,
    pub upload_complete: bool,
    pub total_chunks: u32,
    pub uploaded_chunks: usize,
    pub chunks: Vec<FileChunk>,
}

impl UploadService {
    pub async fn get_file(&self, owner_id: &str, file_id: &str) -> Result<FileMetadata, UploadError> {
        self.load_owned(owner_id, file_id).await
    }

    /// The caller's files, newest first.
    pub async fn list_files(&self, owner_id: &str) -> Result<Vec<FileMetadata>, UploadError> {
        let mut files = self.metadata.list_files_by_owner(owner_id).await?;
        files.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(files)
    }

    pub async fn progress(&self, owner_id: &str, file_id: &str) -> Result<UploadProgress, UploadError> {
        let record = self.load_owned(owner_id, file_id).await?;
        let completeness = self.completeness(&record).await?;
        Ok(UploadProgress {
            file_id: record.file_id.clone(),
            status: record.status,
            upload_complete: completeness.is_complete,
            total_chunks: record.total_chunks(),
            uploaded_chunks: completeness.uploaded_chunks(),
            chunks: completeness.chunks,
        })
    }

    /// Read grant for the object backing `file_id`.
    ///
    /// Multipart uploads are readable only once finalized.
    pub async fn download_grant(&self, owner_id: &str, file_id: &str) -> Result<Grant, UploadError> {
        let record = self.load_owned(owner_id, file_id).await?;
        let readable = match record.upload_type {
            UploadType::Single => record.status != UploadStatus::Failed,
            UploadType::Multipart => record.status == UploadStatus::Completed,
        };
        if !readable {
            return Err(UploadError::conflict(format!(
                "file is {} and cannot be downloaded",
                record.status.as_str()
            )));
        }
        Ok(self.grants.grant_read(&record.storage_key).await?)
    }

    /// Delete the stored object, then the metadata record.
    ///
    /// If the blob store fails the record is left untouched.  Chunk rows
    /// are kept.
    pub async fn delete(&self, owner_id: &str, file_id: &str) -> Result<(), UploadError> {
        let record = self.load_owned(owner_id, file_id).await?;
        self.blobs.delete_object(&record.storage_key).await?;
        self.metadata.delete_file(file_id).await?;

        counter!(DELETIONS_TOTAL).increment(1);
        info!(file_id = %file_id, storage_key = %record.storage_key, "Deleted file");
        Ok(())
    }
}
