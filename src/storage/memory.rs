//! In-process blob store.
//!
//! Objects and multipart sessions are held in `tokio::sync::RwLock<HashMap<...>>`
//! maps.  Grants are URLs under `base_url` carrying an HMAC-SHA256
//! signature over the operation, key, session, part and expiry, so the
//! `/blobs` routes can accept uploads without any per-grant state.
//!
//! Meant for development and tests; nothing survives a restart.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::backend::{BlobStore, CompleteOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Characters escaped in a key path segment; `/` is kept.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// What a verified grant allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantScope {
    PutObject {
        key: String,
    },
    PutPart {
        key: String,
        session_id: String,
        part_number: u32,
    },
    GetObject {
        key: String,
    },
}

#[derive(Debug, Default)]
struct Session {
    key: String,
    /// part_number -> (data, etag)
    parts: BTreeMap<u32, (Bytes, String)>,
}

/// In-process blob store with signed grant URLs.
pub struct MemoryBlobStore {
    base_url: String,
    signing_key: Vec<u8>,
    /// storage_key -> (data, etag)
    objects: tokio::sync::RwLock<HashMap<String, (Bytes, String)>>,
    /// session_id -> open session
    sessions: tokio::sync::RwLock<HashMap<String, Session>>,
    /// Session ids merged by `complete_multipart_session`.
    merged: tokio::sync::RwLock<HashSet<String>>,
}

impl MemoryBlobStore {
    pub fn new(base_url: &str, signing_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            signing_key: signing_key.as_bytes().to_vec(),
            objects: tokio::sync::RwLock::new(HashMap::new()),
            sessions: tokio::sync::RwLock::new(HashMap::new()),
            merged: tokio::sync::RwLock::new(HashSet::new()),
        }
    }

    fn compute_md5(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    fn signature(&self, op: &str, key: &str, session_id: &str, part: u32, expires: i64) -> Vec<u8> {
        let canonical = format!("{op}\n{key}\n{session_id}\n{part}\n{expires}");
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .expect("HMAC can take key of any size");
        mac.update(canonical.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn mint(&self, op: &str, key: &str, session_id: Option<&str>, part: u32, ttl: Duration) -> String {
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        let sig = hex::encode(self.signature(op, key, session_id.unwrap_or(""), part, expires));
        let path = utf8_percent_encode(key, KEY_ENCODE_SET);

        let mut url = format!("{}/{}?op={op}&expires={expires}", self.base_url, path);
        if let Some(session_id) = session_id {
            url.push_str(&format!(
                "&uploadId={}&partNumber={part}",
                utf8_percent_encode(session_id, NON_ALPHANUMERIC)
            ));
        }
        url.push_str(&format!("&sig={sig}"));
        url
    }

    /// Check a grant's signature and expiry against the requested key.
    ///
    /// `key` is the decoded path after `base_url`; `query` holds the
    /// decoded query parameters.
    pub fn verify_grant(
        &self,
        key: &str,
        query: &HashMap<String, String>,
    ) -> anyhow::Result<GrantScope> {
        let field = |name: &str| {
            query
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| anyhow::anyhow!("grant is missing {name}"))
        };

        let op = field("op")?;
        let expires: i64 = field("expires")?
            .parse()
            .map_err(|_| anyhow::anyhow!("grant expiry is not a timestamp"))?;
        let provided = hex::decode(field("sig")?)
            .map_err(|_| anyhow::anyhow!("grant signature is not hex"))?;

        let session_id = query.get("uploadId").map(String::as_str).unwrap_or("");
        let part: u32 = match query.get("partNumber") {
            Some(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("grant part number is invalid"))?,
            None => 0,
        };

        let expected = self.signature(op, key, session_id, part, expires);
        if !bool::from(expected.ct_eq(&provided)) {
            anyhow::bail!("grant signature mismatch");
        }
        if chrono::Utc::now().timestamp() > expires {
            anyhow::bail!("grant expired");
        }

        match op {
            "put" => Ok(GrantScope::PutObject {
                key: key.to_string(),
            }),
            "get" => Ok(GrantScope::GetObject {
                key: key.to_string(),
            }),
            "part" => Ok(GrantScope::PutPart {
                key: key.to_string(),
                session_id: session_id.to_string(),
                part_number: part,
            }),
            other => anyhow::bail!("unknown grant operation {other}"),
        }
    }

    /// Split a grant URL minted by this store into `(key, query)`.
    pub fn parse_grant_url(&self, url: &str) -> anyhow::Result<(String, HashMap<String, String>)> {
        let rest = url
            .strip_prefix(&self.base_url)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| anyhow::anyhow!("url was not minted by this store"))?;
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));

        let key = percent_decode_str(path).decode_utf8()?.into_owned();
        let mut params = HashMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(
                percent_decode_str(k).decode_utf8_lossy().into_owned(),
                percent_decode_str(v).decode_utf8_lossy().into_owned(),
            );
        }
        Ok((key, params))
    }

    /// Store a whole object uploaded under a `PutObject` grant.
    pub async fn accept_object(&self, key: &str, data: Bytes) -> String {
        let etag = format!("\"{}\"", Self::compute_md5(&data));
        let mut objects = self.objects.write().await;
        objects.insert(key.to_string(), (data, etag.clone()));
        etag
    }

    /// Store one part uploaded under a `PutPart` grant, returning its ETag.
    pub async fn accept_part(
        &self,
        session_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> anyhow::Result<String> {
        let etag = format!("\"{}\"", Self::compute_md5(&data));
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow::anyhow!("no such upload {session_id}"))?;
        session.parts.insert(part_number, (data, etag.clone()));
        Ok(etag)
    }

    /// Read an object's bytes.
    pub async fn read_object(&self, key: &str) -> Option<Bytes> {
        let objects = self.objects.read().await;
        objects.get(key).map(|(data, _)| data.clone())
    }

    /// Apply a client upload through a grant URL, as the `/blobs` route does.
    pub async fn upload_with_grant(&self, url: &str, data: Bytes) -> anyhow::Result<String> {
        let (key, query) = self.parse_grant_url(url)?;
        match self.verify_grant(&key, &query)? {
            GrantScope::PutObject { key } => Ok(self.accept_object(&key, data).await),
            GrantScope::PutPart {
                session_id,
                part_number,
                ..
            } => self.accept_part(&session_id, part_number, data).await,
            GrantScope::GetObject { .. } => anyhow::bail!("grant does not allow writes"),
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn put_object_grant(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let url = self.mint("put", key, None, 0, ttl);
        Box::pin(async move { Ok(url) })
    }

    fn get_object_grant(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let url = self.mint("get", key, None, 0, ttl);
        Box::pin(async move { Ok(url) })
    }

    fn create_multipart_session(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let session_id = uuid::Uuid::new_v4().simple().to_string();
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                session_id.clone(),
                Session {
                    key,
                    parts: BTreeMap::new(),
                },
            );
            Ok(session_id)
        })
    }

    fn put_part_grant(
        &self,
        key: &str,
        session_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let url = self.mint("part", key, Some(session_id), part_number, ttl);
        Box::pin(async move { Ok(url) })
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
            if self.merged.read().await.contains(&session_id) {
                if !self.objects.read().await.contains_key(&key) {
                    anyhow::bail!("upload {session_id} was merged but {key} no longer exists");
                }
                return Ok(CompleteOutcome::AlreadyCompleted);
            }

            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get(&session_id)
                .ok_or_else(|| anyhow::anyhow!("no such upload {session_id}"))?;
            if session.key != key {
                anyhow::bail!("upload {session_id} belongs to a different key");
            }

            let mut assembled = Vec::new();
            for (part_number, etag) in &parts {
                let (data, stored_etag) = session
                    .parts
                    .get(part_number)
                    .ok_or_else(|| anyhow::anyhow!("part {part_number} was never uploaded"))?;
                if stored_etag.trim_matches('"') != etag.trim_matches('"') {
                    anyhow::bail!("part {part_number} etag mismatch");
                }
                assembled.extend_from_slice(data);
            }

            debug!(
                "memory complete_multipart_session: key={} parts={} bytes={}",
                key,
                parts.len(),
                assembled.len()
            );

            sessions.remove(&session_id);
            drop(sessions);

            let data = Bytes::from(assembled);
            let etag = format!("\"{}-{}\"", Self::compute_md5(&data), parts.len());
            self.objects.write().await.insert(key, (data, etag));
            self.merged.write().await.insert(session_id);
            Ok(CompleteOutcome::Completed)
        })
    }

    fn abort_multipart_session(
        &self,
        _key: &str,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            self.sessions.write().await.remove(&session_id);
            Ok(())
        })
    }

    fn object_exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.objects.read().await.contains_key(&key)) })
    }

    fn delete_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.objects.write().await.remove(&key);
            Ok(())
        })
    }
}
