//! Abstract blob store trait.
//!
//! The service never proxies object bytes.  A [`BlobStore`] only mints
//! presigned URLs that clients use against the store directly, and
//! drives the control-plane calls of a multipart session.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Result of asking the store to merge a multipart session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// The parts were merged by this call.
    Completed,
    /// The session was already merged by an earlier call and the object
    /// exists at its key.
    AlreadyCompleted,
}

/// Async blob store contract.
pub trait BlobStore: Send + Sync + 'static {
    /// Presigned URL for a single PUT of the whole object at `key`.
    fn put_object_grant(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Presigned URL for a GET of the whole object at `key`.
    fn get_object_grant(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Open a multipart session for `key`, returning the session id.
    fn create_multipart_session(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Presigned URL for a PUT of part `part_number` within `session_id`.
    fn put_part_grant(
        &self,
        key: &str,
        session_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Merge the given `(part_number, etag)` pairs, in order, into the
    /// final object at `key`.
    fn complete_multipart_session(
        &self,
        key: &str,
        session_id: &str,
        parts: Vec<(u32, String)>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CompleteOutcome>> + Send + '_>>;

    /// Discard a multipart session and any parts already received.
    fn abort_multipart_session(
        &self,
        key: &str,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Whether an object exists at `key`.
    fn object_exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Delete the object at `key`. Deleting a missing object succeeds.
    fn delete_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}
