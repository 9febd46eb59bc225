//! In-memory metadata store.
//!
//! Stores all metadata in memory with no persistence. Useful for testing
//! and ephemeral deployments. Uses `RwLock<HashMap>` for thread-safe access.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use super::store::{ChunkStatus, FileChunk, FileExists, FileMetadata, MetadataStore};

type FileKey = String;
type ChunkKey = (String, u32);

#[derive(Debug, Default)]
struct Inner {
    files: HashMap<FileKey, FileMetadata>,
    chunks: HashMap<ChunkKey, FileChunk>,
}

pub struct MemoryMetadataStore {
    inner: RwLock<Inner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn put_file_if_absent(
        &self,
        record: FileMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            if inner.files.contains_key(&record.file_id) {
                return Err(FileExists(record.file_id).into());
            }
            inner.files.insert(record.file_id.clone(), record);
            Ok(())
        })
    }

    fn get_file(
        &self,
        file_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileMetadata>>> + Send + '_>> {
        let file_id = file_id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner.files.get(&file_id).cloned())
        })
    }

    fn put_file(
        &self,
        record: FileMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            inner.files.insert(record.file_id.clone(), record);
            Ok(())
        })
    }

    fn delete_file(
        &self,
        file_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let file_id = file_id.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            inner.files.remove(&file_id);
            Ok(())
        })
    }

    fn list_files_by_owner(
        &self,
        owner_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<FileMetadata>>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner
                .files
                .values()
                .filter(|f| f.owner_id == owner_id)
                .cloned()
                .collect())
        })
    }

    fn put_chunk(
        &self,
        chunk: FileChunk,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            inner
                .chunks
                .insert((chunk.file_id.clone(), chunk.chunk_number), chunk);
            Ok(())
        })
    }

    fn get_chunk(
        &self,
        file_id: &str,
        chunk_number: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileChunk>>> + Send + '_>> {
        let key = (file_id.to_string(), chunk_number);
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner.chunks.get(&key).cloned())
        })
    }

    fn list_chunks(
        &self,
        file_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<FileChunk>>> + Send + '_>> {
        let file_id = file_id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            let mut chunks: Vec<FileChunk> = inner
                .chunks
                .values()
                .filter(|c| c.file_id == file_id)
                .cloned()
                .collect();
            chunks.sort_by_key(|c| c.chunk_number);
            Ok(chunks)
        })
    }

    fn update_chunk_status(
        &self,
        file_id: &str,
        chunk_number: u32,
        status: ChunkStatus,
        checksum: Option<String>,
        uploaded_at: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = (file_id.to_string(), chunk_number);
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            match inner.chunks.get_mut(&key) {
                Some(chunk) => {
                    chunk.status = status;
                    chunk.checksum = checksum;
                    chunk.uploaded_at = uploaded_at;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }
}
