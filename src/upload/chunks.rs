//! Chunk state tracking.
//!
//! Clients report each part's outcome after uploading it through its
//! grant.  Reports overwrite the stored status unconditionally, so the
//! last report for a chunk wins and repeating a report is harmless.

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::planner::ChunkGrant;
use super::UploadService;
use crate::errors::UploadError;
use crate::metadata::store::{ChunkStatus, FileChunk, FileMetadata};
use crate::metrics::CHUNK_REPORTS_TOTAL;

/// Outcome a client may report for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkOutcome {
    Uploaded,
    Failed,
}

impl From<ChunkOutcome> for ChunkStatus {
    fn from(outcome: ChunkOutcome) -> Self {
        match outcome {
            ChunkOutcome::Uploaded => ChunkStatus::Uploaded,
            ChunkOutcome::Failed => ChunkStatus::Failed,
        }
    }
}

/// Answer to a chunk report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReport {
    pub chunk_number: u32,
    pub status: ChunkStatus,
    /// Whether every chunk is now uploaded.  Never finalizes by itself.
    pub upload_complete: bool,
    pub total_chunks: u32,
}

impl UploadService {
    /// Record the outcome of one chunk.
    ///
    /// `uploaded` needs the blob store's checksum for the part; `failed`
    /// clears any checksum recorded earlier.
    pub async fn report_chunk(
        &self,
        owner_id: &str,
        file_id: &str,
        chunk_number: u32,
        outcome: ChunkOutcome,
        checksum: Option<String>,
    ) -> Result<ChunkReport, UploadError> {
        let checksum = checksum.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
        if outcome == ChunkOutcome::Uploaded && checksum.is_none() {
            return Err(UploadError::validation(
                "CHECKSUM_REQUIRED",
                "checksum",
                "An uploaded chunk must carry the checksum returned by the blob store",
            ));
        }

        let record = self.load_owned(owner_id, file_id).await?;
        ensure_uploading(&record)?;

        let status = ChunkStatus::from(outcome);
        let (checksum, uploaded_at) = match outcome {
            ChunkOutcome::Uploaded => (checksum, Some(Utc::now())),
            ChunkOutcome::Failed => (None, None),
        };

        let updated = self
            .metadata
            .update_chunk_status(file_id, chunk_number, status, checksum, uploaded_at)
            .await?;
        if !updated {
            return Err(UploadError::not_found(format!("Chunk {chunk_number}")));
        }

        counter!(CHUNK_REPORTS_TOTAL, "status" => status.as_str()).increment(1);
        debug!(
            file_id = %file_id,
            chunk_number,
            status = status.as_str(),
            "Chunk reported"
        );

        let completeness = self.completeness(&record).await?;
        Ok(ChunkReport {
            chunk_number,
            status,
            upload_complete: completeness.is_complete,
            total_chunks: record.total_chunks(),
        })
    }

    /// Mint a fresh grant for a chunk that has not been uploaded yet.
    ///
    /// The chunk row is rewritten as pending, superseding any failed
    /// report.
    pub async fn reissue_grant(
        &self,
        owner_id: &str,
        file_id: &str,
        chunk_number: u32,
    ) -> Result<ChunkGrant, UploadError> {
        let record = self.load_owned(owner_id, file_id).await?;
        ensure_uploading(&record)?;
        let Some(multipart) = record.multipart.as_ref() else {
            return Err(UploadError::conflict("single uploads have no chunks"));
        };

        let chunk = self
            .metadata
            .get_chunk(file_id, chunk_number)
            .await?
            .ok_or_else(|| UploadError::not_found(format!("Chunk {chunk_number}")))?;
        if chunk.status == ChunkStatus::Uploaded {
            return Err(UploadError::conflict(format!(
                "chunk {chunk_number} is already uploaded"
            )));
        }

        let grant = self
            .grants
            .grant_write_part(&record.storage_key, &multipart.storage_upload_id, chunk_number)
            .await?;
        self.metadata
            .put_chunk(FileChunk::pending(file_id, chunk_number, chunk.expected_size))
            .await?;

        info!(file_id = %file_id, chunk_number, "Reissued chunk grant");
        Ok(ChunkGrant {
            chunk_number,
            url: grant.url,
            expires_at: grant.expires_at,
            size: chunk.expected_size,
        })
    }
}

fn ensure_uploading(record: &FileMetadata) -> Result<(), UploadError> {
    if record.status.is_terminal() {
        return Err(UploadError::conflict(format!(
            "upload is already {}",
            record.status.as_str()
        )));
    }
    Ok(())
}
