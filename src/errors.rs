//! Upload coordinator error types.
//!
//! Every variant maps to a machine-readable code and an HTTP status.  The
//! enum implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(UploadError::NotFound { .. })`; the response body is the
//! JSON error envelope carrying a correlation id.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Generate a correlation id of the form `req-` + 16 hex characters.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    format!("req-{}", hex::encode(bytes))
}

/// Failure modes surfaced by the coordinator and the HTTP layer.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The request was rejected before any store call.
    #[error("{message}")]
    Validation {
        /// Detail code, e.g. `INVALID_FILENAME`.
        code: &'static str,
        message: String,
        field: Option<&'static str>,
    },

    /// Unknown file or chunk.
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// The request contradicts the upload's current state.
    #[error("{message}")]
    Conflict { message: String },

    /// Missing or invalid credentials.
    #[error("{message}")]
    Unauthorized { message: String },

    /// A blob store or metadata store call failed. Retryable.
    #[error("A storage service is temporarily unavailable, please retry.")]
    StorageUnavailable(#[from] anyhow::Error),
}

impl UploadError {
    pub fn validation(code: &'static str, field: &'static str, message: impl Into<String>) -> Self {
        UploadError::Validation {
            code,
            message: message.into(),
            field: Some(field),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        UploadError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        UploadError::Conflict {
            message: message.into(),
        }
    }

    /// Return the machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::Validation { .. } => "VALIDATION_ERROR",
            UploadError::NotFound { .. } => "NOT_FOUND",
            UploadError::Conflict { .. } => "CONFLICT",
            UploadError::Unauthorized { .. } => "UNAUTHORIZED",
            UploadError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::Validation { .. } => StatusCode::BAD_REQUEST,
            UploadError::NotFound { .. } => StatusCode::NOT_FOUND,
            UploadError::Conflict { .. } => StatusCode::CONFLICT,
            UploadError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            UploadError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorEnvelope {
    success: bool,
    error: ErrorBody,
    request_id: String,
    timestamp: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();

        // The underlying cause stays in the log, keyed by the request id.
        if let UploadError::StorageUnavailable(ref cause) = self {
            error!(request_id = %request_id, "storage call failed: {cause:#}");
        }

        let (detail, field) = match &self {
            UploadError::Validation { code, field, .. } => (Some(*code), *field),
            _ => (None, None),
        };

        let envelope = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
                detail,
                field,
            },
            request_id: request_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, [("x-request-id", request_id)], Json(envelope)).into_response()
    }
}
