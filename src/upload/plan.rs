//! Single vs. multipart decision and chunk arithmetic.
//!
//! Pure functions; nothing here touches a store.

use crate::config::UploadConfig;
use crate::errors::UploadError;

/// Limits that drive the decision, taken from [`UploadConfig`].
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub multipart_threshold: u64,
    pub chunk_size: u64,
    pub max_parts: u32,
}

impl From<&UploadConfig> for PlanLimits {
    fn from(config: &UploadConfig) -> Self {
        Self {
            multipart_threshold: config.multipart_threshold,
            chunk_size: config.chunk_size,
            max_parts: config.max_parts,
        }
    }
}

/// How a multipart upload is cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

impl ChunkPlan {
    /// Size of the final chunk; always in `1..=chunk_size`.
    pub fn last_chunk_size(&self) -> u64 {
        self.total_size - (self.total_chunks as u64 - 1) * self.chunk_size
    }

    /// Expected size of chunk `chunk_number` (1-indexed).
    pub fn chunk_len(&self, chunk_number: u32) -> u64 {
        if chunk_number == self.total_chunks {
            self.last_chunk_size()
        } else {
            self.chunk_size
        }
    }

    /// `(chunk_number, expected_size)` for every chunk, in order.
    pub fn chunks(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        (1..=self.total_chunks).map(move |n| (n, self.chunk_len(n)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadDecision {
    Single,
    Multipart(ChunkPlan),
}

/// Decide how a declared size is uploaded.
///
/// An absent size, or one below the threshold, is a single-shot upload.
pub fn decide(declared_size: Option<u64>, limits: &PlanLimits) -> Result<UploadDecision, UploadError> {
    let size = match declared_size {
        Some(size) if size >= limits.multipart_threshold => size,
        _ => return Ok(UploadDecision::Single),
    };

    let total_chunks = size.div_ceil(limits.chunk_size);
    if total_chunks > limits.max_parts as u64 {
        return Err(UploadError::validation(
            "TOO_MANY_PARTS",
            "size",
            format!(
                "file would need {total_chunks} parts, the limit is {}",
                limits.max_parts
            ),
        ));
    }

    Ok(UploadDecision::Multipart(ChunkPlan {
        total_size: size,
        chunk_size: limits.chunk_size,
        total_chunks: total_chunks as u32,
    }))
}
