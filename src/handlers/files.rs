//! File upload API handlers.
//!
//! Each handler receives the authenticated [`Principal`] and delegates to
//! the [`UploadService`](crate::upload::UploadService).  Request bodies
//! arrive as raw bytes and are parsed here so that malformed JSON is
//! reported with the same error envelope as every other failure.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::errors::UploadError;
use crate::metadata::store::FileMetadata;
use crate::upload::chunks::ChunkOutcome;
use crate::validation::UploadUrlRequest;
use crate::AppState;

// -- Request bodies -----------------------------------------------------------

/// Body of `POST /files/{fileId}/chunks/{n}/complete`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkCompleteRequest {
    #[serde(default)]
    status: String,
    #[serde(default, alias = "etag", alias = "ETag")]
    checksum: Option<String>,
}

#[derive(Debug, Serialize)]
struct FileList {
    files: Vec<FileMetadata>,
}

// -- Helpers ------------------------------------------------------------------

/// Parse a JSON request body.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, UploadError> {
    if body.is_empty() {
        return Err(UploadError::validation(
            "MALFORMED_JSON",
            "body",
            "Request body is required",
        ));
    }
    serde_json::from_slice(body).map_err(|e| {
        UploadError::validation("MALFORMED_JSON", "body", format!("Invalid JSON body: {e}"))
    })
}

/// Parse a 1-indexed chunk number taken from the path.
fn parse_chunk_number(raw: &str) -> Result<u32, UploadError> {
    match raw.parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(UploadError::validation(
            "INVALID_CHUNK_NUMBER",
            "chunkNumber",
            "Chunk number must be a positive integer",
        )),
    }
}

fn parse_outcome(status: &str) -> Result<ChunkOutcome, UploadError> {
    match status {
        "uploaded" => Ok(ChunkOutcome::Uploaded),
        "failed" => Ok(ChunkOutcome::Failed),
        _ => Err(UploadError::validation(
            "INVALID_STATUS",
            "status",
            "Status must be 'uploaded' or 'failed'",
        )),
    }
}

// -- Handlers -----------------------------------------------------------------

/// `POST /files/upload-url` -- Plan an upload and issue its grants.
#[utoipa::path(
    post,
    path = "/files/upload-url",
    tag = "Files",
    operation_id = "CreateUploadUrl",
    responses(
        (status = 201, description = "Upload planned; grants issued"),
        (status = 400, description = "Invalid filename, size or content type"),
        (status = 503, description = "Blob or metadata store unavailable")
    )
)]
pub async fn create_upload_url(
    state: Arc<AppState>,
    principal: &Principal,
    body: &[u8],
) -> Result<Response, UploadError> {
    let request: UploadUrlRequest = parse_body(body)?;
    let plan = state.uploads.plan(&principal.user_id, request).await?;
    Ok((StatusCode::CREATED, Json(plan)).into_response())
}

/// `POST /files/{fileId}/chunks/{n}/complete` -- Report a chunk outcome.
#[utoipa::path(
    post,
    path = "/files/{fileId}/chunks/{chunkNumber}/complete",
    tag = "Chunks",
    operation_id = "ReportChunk",
    params(
        ("fileId" = String, Path, description = "File id"),
        ("chunkNumber" = u32, Path, description = "1-indexed chunk number"),
    ),
    responses(
        (status = 200, description = "Chunk status recorded"),
        (status = 400, description = "Missing checksum or bad status"),
        (status = 404, description = "File or chunk not found"),
        (status = 409, description = "Upload is no longer in progress")
    )
)]
pub async fn report_chunk(
    state: Arc<AppState>,
    principal: &Principal,
    file_id: &str,
    chunk_number: &str,
    body: &[u8],
) -> Result<Response, UploadError> {
    let chunk_number = parse_chunk_number(chunk_number)?;
    let request: ChunkCompleteRequest = parse_body(body)?;
    let outcome = parse_outcome(&request.status)?;

    let report = state
        .uploads
        .report_chunk(
            &principal.user_id,
            file_id,
            chunk_number,
            outcome,
            request.checksum,
        )
        .await?;
    Ok(Json(report).into_response())
}

/// `POST /files/{fileId}/chunks/{n}/url` -- Reissue a chunk's write grant.
#[utoipa::path(
    post,
    path = "/files/{fileId}/chunks/{chunkNumber}/url",
    tag = "Chunks",
    operation_id = "ReissueChunkUrl",
    params(
        ("fileId" = String, Path, description = "File id"),
        ("chunkNumber" = u32, Path, description = "1-indexed chunk number"),
    ),
    responses(
        (status = 200, description = "Fresh chunk grant"),
        (status = 404, description = "File or chunk not found"),
        (status = 409, description = "Chunk already uploaded or upload finished")
    )
)]
pub async fn reissue_chunk_url(
    state: Arc<AppState>,
    principal: &Principal,
    file_id: &str,
    chunk_number: &str,
) -> Result<Response, UploadError> {
    let chunk_number = parse_chunk_number(chunk_number)?;
    let grant = state
        .uploads
        .reissue_grant(&principal.user_id, file_id, chunk_number)
        .await?;
    Ok(Json(grant).into_response())
}

/// `POST /files/{fileId}/complete` -- Finalize a multipart upload.
#[utoipa::path(
    post,
    path = "/files/{fileId}/complete",
    tag = "Files",
    operation_id = "CompleteUpload",
    params(("fileId" = String, Path, description = "File id")),
    responses(
        (status = 200, description = "Upload completed"),
        (status = 404, description = "File not found"),
        (status = 409, description = "Chunks missing, upload aborted or not multipart"),
        (status = 503, description = "Merge failed; retry")
    )
)]
pub async fn complete_upload(
    state: Arc<AppState>,
    principal: &Principal,
    file_id: &str,
) -> Result<Response, UploadError> {
    let done = state.uploads.finalize(&principal.user_id, file_id).await?;
    Ok(Json(done).into_response())
}

/// `POST /files/{fileId}/abort` -- Abandon a multipart upload.
#[utoipa::path(
    post,
    path = "/files/{fileId}/abort",
    tag = "Files",
    operation_id = "AbortUpload",
    params(("fileId" = String, Path, description = "File id")),
    responses(
        (status = 200, description = "Upload aborted"),
        (status = 404, description = "File not found"),
        (status = 409, description = "Upload completed or not multipart")
    )
)]
pub async fn abort_upload(
    state: Arc<AppState>,
    principal: &Principal,
    file_id: &str,
) -> Result<Response, UploadError> {
    let record = state.uploads.abort(&principal.user_id, file_id).await?;
    Ok(Json(record).into_response())
}

/// `GET /files/{fileId}/download-url` -- Issue a read grant.
#[utoipa::path(
    get,
    path = "/files/{fileId}/download-url",
    tag = "Files",
    operation_id = "CreateDownloadUrl",
    params(("fileId" = String, Path, description = "File id")),
    responses(
        (status = 200, description = "Read grant"),
        (status = 404, description = "File not found"),
        (status = 409, description = "Upload not completed")
    )
)]
pub async fn download_url(
    state: Arc<AppState>,
    principal: &Principal,
    file_id: &str,
) -> Result<Response, UploadError> {
    let grant = state
        .uploads
        .download_grant(&principal.user_id, file_id)
        .await?;
    Ok(Json(grant).into_response())
}

/// `GET /files/{fileId}` -- File metadata.
#[utoipa::path(
    get,
    path = "/files/{fileId}",
    tag = "Files",
    operation_id = "GetFile",
    params(("fileId" = String, Path, description = "File id")),
    responses(
        (status = 200, description = "File metadata"),
        (status = 404, description = "File not found")
    )
)]
pub async fn get_file(
    state: Arc<AppState>,
    principal: &Principal,
    file_id: &str,
) -> Result<Response, UploadError> {
    let record = state.uploads.get_file(&principal.user_id, file_id).await?;
    Ok(Json(record).into_response())
}

/// `GET /files/{fileId}/status` -- Upload progress.
#[utoipa::path(
    get,
    path = "/files/{fileId}/status",
    tag = "Files",
    operation_id = "GetUploadStatus",
    params(("fileId" = String, Path, description = "File id")),
    responses(
        (status = 200, description = "Chunk progress"),
        (status = 404, description = "File not found")
    )
)]
pub async fn upload_status(
    state: Arc<AppState>,
    principal: &Principal,
    file_id: &str,
) -> Result<Response, UploadError> {
    let progress = state.uploads.progress(&principal.user_id, file_id).await?;
    Ok(Json(progress).into_response())
}

/// `GET /files` -- The caller's files, newest first.
#[utoipa::path(
    get,
    path = "/files",
    tag = "Files",
    operation_id = "ListFiles",
    responses((status = 200, description = "File list"))
)]
pub async fn list_files(
    state: Arc<AppState>,
    principal: &Principal,
) -> Result<Response, UploadError> {
    let files = state.uploads.list_files(&principal.user_id).await?;
    Ok(Json(FileList { files }).into_response())
}

/// `DELETE /files/{fileId}` -- Delete the object and its metadata.
#[utoipa::path(
    delete,
    path = "/files/{fileId}",
    tag = "Files",
    operation_id = "DeleteFile",
    params(("fileId" = String, Path, description = "File id")),
    responses(
        (status = 204, description = "File deleted"),
        (status = 404, description = "File not found"),
        (status = 503, description = "Blob store unavailable; metadata kept")
    )
)]
pub async fn delete_file(
    state: Arc<AppState>,
    principal: &Principal,
    file_id: &str,
) -> Result<Response, UploadError> {
    state.uploads.delete(&principal.user_id, file_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
