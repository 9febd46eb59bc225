//! Abstract metadata store trait.
//!
//! Any metadata backend must implement [`MetadataStore`].  The trait
//! uses `async_trait`-style methods (manual desugaring with pinned
//! futures) so it can be used with both the in-process store and
//! DynamoDB.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

// ── Enumerations ───────────────────────────────────────────────────

/// How the object's bytes reach the blob store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadType {
    Single,
    Multipart,
}

/// Lifecycle of a [`FileMetadata`] record.
///
/// `Uploading` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Completed,
    Failed,
}

/// Delivery state of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploaded,
    Failed,
}

impl UploadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadType::Single => "single",
            UploadType::Multipart => "multipart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(UploadType::Single),
            "multipart" => Some(UploadType::Multipart),
            _ => None,
        }
    }
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(UploadStatus::Uploading),
            "completed" => Some(UploadStatus::Completed),
            "failed" => Some(UploadStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadStatus::Uploading)
    }
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Uploaded => "uploaded",
            ChunkStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChunkStatus::Pending),
            "uploaded" => Some(ChunkStatus::Uploaded),
            "failed" => Some(ChunkStatus::Failed),
            _ => None,
        }
    }
}

// ── Record types ───────────────────────────────────────────────────

/// Multipart-only planning fields.
///
/// Grouped so that they are present together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartPlan {
    /// Blob store session handle for the in-progress transfer.
    pub storage_upload_id: String,
    /// Size of every chunk except possibly the last.
    pub chunk_size: u64,
    /// Number of chunks fixed at plan time.
    pub total_chunks: u32,
}

/// One logical uploaded object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Opaque identifier generated at plan time.
    pub file_id: String,
    /// Client-supplied file name.
    pub filename: String,
    /// MIME type declared by the client.
    pub content_type: String,
    /// Declared size in bytes (0 when unknown).
    pub total_size: u64,
    /// Single or multipart.
    pub upload_type: UploadType,
    /// Current lifecycle state.
    pub status: UploadStatus,
    /// Location of the backing object; never changes after planning.
    pub storage_key: String,
    /// Present iff `upload_type` is multipart.
    #[serde(flatten)]
    pub multipart: Option<MultipartPlan>,
    /// Uploading principal.
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl FileMetadata {
    pub fn total_chunks(&self) -> u32 {
        self.multipart.as_ref().map_or(0, |m| m.total_chunks)
    }
}

/// One part of a multipart upload, keyed by `(file_id, chunk_number)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: String,
    /// 1-indexed; equals the blob store's part number.
    pub chunk_number: u32,
    /// Bytes the client is expected to send for this part.
    pub expected_size: u64,
    pub status: ChunkStatus,
    /// Part checksum (ETag) reported by the blob store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl FileChunk {
    /// A chunk as created at plan time.
    pub fn pending(file_id: &str, chunk_number: u32, expected_size: u64) -> Self {
        Self {
            file_id: file_id.to_string(),
            chunk_number,
            expected_size,
            status: ChunkStatus::Pending,
            checksum: None,
            uploaded_at: None,
        }
    }
}

/// Returned by [`MetadataStore::put_file_if_absent`] when the id is taken.
#[derive(Debug, thiserror::Error)]
#[error("file record {0} already exists")]
pub struct FileExists(pub String);

// ── Trait ──────────────────────────────────────────────────────────

/// Async metadata store interface.
///
/// All methods return pinned, boxed futures so the trait is object-safe
/// and can be used behind `Arc<dyn MetadataStore>`.
pub trait MetadataStore: Send + Sync + 'static {
    // ── Files ───────────────────────────────────────────────────────

    /// Create a file record. Fails with [`FileExists`] if the id is taken.
    fn put_file_if_absent(
        &self,
        record: FileMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Get a file record by id.
    fn get_file(
        &self,
        file_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileMetadata>>> + Send + '_>>;

    /// Unconditionally overwrite a file record.
    fn put_file(
        &self,
        record: FileMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Delete a file record. Deleting a missing record is not an error.
    fn delete_file(
        &self,
        file_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// All files owned by `owner_id`, in no particular order.
    fn list_files_by_owner(
        &self,
        owner_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<FileMetadata>>> + Send + '_>>;

    // ── Chunks ──────────────────────────────────────────────────────

    /// Unconditionally write a chunk record.
    fn put_chunk(
        &self,
        chunk: FileChunk,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Get a single chunk record.
    fn get_chunk(
        &self,
        file_id: &str,
        chunk_number: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileChunk>>> + Send + '_>>;

    /// All chunks of a file, sorted by chunk number.
    fn list_chunks(
        &self,
        file_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<FileChunk>>> + Send + '_>>;

    /// Overwrite status, checksum and upload time of an existing chunk.
    ///
    /// Returns `false` if no such chunk exists; never creates one.
    fn update_chunk_status(
        &self,
        file_id: &str,
        chunk_number: u32,
        status: ChunkStatus,
        checksum: Option<String>,
        uploaded_at: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;
}
