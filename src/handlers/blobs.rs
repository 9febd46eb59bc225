//! Grant receiver for the in-process blob store.
//!
//! When `storage.backend = memory`, grant URLs point at `/blobs/{key}`.
//! These routes check the grant signature and expiry, then store or
//! return the bytes.  They are not mounted for the AWS backend.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::debug;

use crate::errors::UploadError;
use crate::storage::memory::{GrantScope, MemoryBlobStore};
use crate::AppState;

fn local_store(state: &AppState) -> Result<&Arc<MemoryBlobStore>, UploadError> {
    state
        .local_blobs
        .as_ref()
        .ok_or_else(|| UploadError::not_found("Blob endpoint"))
}

fn rejected(e: anyhow::Error) -> UploadError {
    debug!("Blob grant rejected: {e:#}");
    UploadError::Unauthorized {
        message: "Grant is invalid or has expired".to_string(),
    }
}

/// `PUT /blobs/{key}` -- Upload an object or a part under a write grant.
///
/// Answers with the part's `ETag`, which the client reports back as the
/// chunk checksum.
pub async fn put_blob(
    state: Arc<AppState>,
    key: &str,
    query: &HashMap<String, String>,
    body: Bytes,
) -> Result<Response, UploadError> {
    let store = local_store(&state)?;
    let etag = match store.verify_grant(key, query).map_err(rejected)? {
        GrantScope::PutObject { key } => store.accept_object(&key, body).await,
        GrantScope::PutPart {
            session_id,
            part_number,
            ..
        } => store
            .accept_part(&session_id, part_number, body)
            .await
            .map_err(|_| UploadError::not_found("Upload session"))?,
        GrantScope::GetObject { .. } => {
            return Err(UploadError::Unauthorized {
                message: "Grant does not allow writes".to_string(),
            })
        }
    };

    let mut response = StatusCode::OK.into_response();
    if let Ok(value) = HeaderValue::from_str(&etag) {
        response.headers_mut().insert("etag", value);
    }
    Ok(response)
}

/// `GET /blobs/{key}` -- Download an object under a read grant.
pub async fn get_blob(
    state: Arc<AppState>,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, UploadError> {
    let store = local_store(&state)?;
    match store.verify_grant(key, query).map_err(rejected)? {
        GrantScope::GetObject { key } => {
            let data = store
                .read_object(&key)
                .await
                .ok_or_else(|| UploadError::not_found("Object"))?;
            Ok((
                StatusCode::OK,
                [("content-type", "application/octet-stream")],
                data,
            )
                .into_response())
        }
        _ => Err(UploadError::Unauthorized {
            message: "Grant does not allow reads".to_string(),
        }),
    }
}
