//! Access-grant issuer.
//!
//! Wraps a [`BlobStore`] and stamps every presigned URL with its expiry.
//! Grants are stateless: the service keeps no record of them and cannot
//! revoke one before it expires.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::storage::backend::BlobStore;

/// A time-bounded URL scoped to one operation on one key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AccessGrantIssuer {
    blobs: Arc<dyn BlobStore>,
    ttl: Duration,
}

impl AccessGrantIssuer {
    pub fn new(blobs: Arc<dyn BlobStore>, ttl: Duration) -> Self {
        Self { blobs, ttl }
    }

    fn stamp(&self, url: String, issued_at: DateTime<Utc>) -> Grant {
        Grant {
            url,
            expires_at: issued_at + chrono::Duration::seconds(self.ttl.as_secs() as i64),
        }
    }

    /// PUT of the whole object at `key`.
    pub async fn grant_write(&self, key: &str) -> anyhow::Result<Grant> {
        let issued_at = Utc::now();
        let url = self.blobs.put_object_grant(key, self.ttl).await?;
        Ok(self.stamp(url, issued_at))
    }

    /// PUT of part `part_number` of the multipart session `session_id`.
    pub async fn grant_write_part(
        &self,
        key: &str,
        session_id: &str,
        part_number: u32,
    ) -> anyhow::Result<Grant> {
        let issued_at = Utc::now();
        let url = self
            .blobs
            .put_part_grant(key, session_id, part_number, self.ttl)
            .await?;
        Ok(self.stamp(url, issued_at))
    }

    /// GET of the whole object at `key`.
    ///
    /// Callers pass the metadata record's storage key, never a key taken
    /// from the request.
    pub async fn grant_read(&self, key: &str) -> anyhow::Result<Grant> {
        let issued_at = Utc::now();
        let url = self.blobs.get_object_grant(key, self.ttl).await?;
        Ok(self.stamp(url, issued_at))
    }
}
