//! Axum router construction and route mapping.
//!
//! The [`app`] function wires every DropVault endpoint to its handler and
//! returns a ready-to-serve [`axum::Router`].

use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Path, RawQuery, State},
    http::{HeaderValue, Method, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;
use utoipa::OpenApi;

use crate::auth::{bearer_token, Principal};
use crate::errors::{generate_request_id, UploadError};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the DropVault upload API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "DropVault Upload API",
        version = "0.1.0",
        description = "Multipart upload coordinator: plans uploads, issues presigned grants and tracks chunk progress"
    ),
    paths(
        // Health check
        health_check,
        // Files
        crate::handlers::files::create_upload_url,
        crate::handlers::files::complete_upload,
        crate::handlers::files::abort_upload,
        crate::handlers::files::download_url,
        crate::handlers::files::get_file,
        crate::handlers::files::upload_status,
        crate::handlers::files::list_files,
        crate::handlers::files::delete_file,
        // Chunks
        crate::handlers::files::report_chunk,
        crate::handlers::files::reissue_chunk_url,
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Files", description = "Upload planning, completion and file queries"),
        (name = "Chunks", description = "Per-chunk reports and grants"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all DropVault routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any)
        .expose_headers([
            axum::http::header::ETAG,
            axum::http::HeaderName::from_static("x-request-id"),
        ]);

    let mut router = Router::new()
        .route("/openapi.json", get(openapi_json))
        .route("/files", get(handle_list_files))
        .route("/files/upload-url", post(handle_create_upload_url))
        .route(
            "/files/:file_id",
            get(handle_get_file).delete(handle_delete_file),
        )
        .route("/files/:file_id/status", get(handle_upload_status))
        .route("/files/:file_id/download-url", get(handle_download_url))
        .route("/files/:file_id/complete", post(handle_complete_upload))
        .route("/files/:file_id/abort", post(handle_abort_upload))
        .route(
            "/files/:file_id/chunks/:chunk_number/complete",
            post(handle_report_chunk),
        )
        .route(
            "/files/:file_id/chunks/:chunk_number/url",
            post(handle_reissue_chunk_url),
        );

    if state.config.observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }
    if state.local_blobs.is_some() {
        // Chunk bodies sent to /blobs can be large; JSON routes keep
        // axum's default limit.
        router = router.route(
            "/blobs/*key",
            put(handle_put_blob)
                .get(handle_get_blob)
                .layer(DefaultBodyLimit::disable()),
        );
    }

    router
        // Application state shared across all handlers.
        .with_state(state.clone())
        // Layer ordering: inner layers run first, outer layers wrap them.
        // auth_middleware is innermost (closest to handlers, after routing).
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        // common_headers_middleware is next (adds x-request-id and Date).
        .layer(middleware::from_fn(common_headers_middleware))
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<axum::body::Body>| {
                    let method = req.method();
                    let uri = req.uri();
                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
}

// -- Common headers middleware -----------------------------------------------

/// Adds common response headers to every response:
/// - `x-request-id`: correlation id (kept if the error envelope set one)
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `DropVault`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("DropVault"));

    response
}

// -- Auth middleware ---------------------------------------------------------

/// Paths that bypass authentication.
const AUTH_SKIP_PATHS: &[&str] = &["/health", "/metrics", "/openapi.json"];

/// Bearer-token authentication middleware.
///
/// Resolves the caller through the configured identity provider and
/// stores the [`Principal`] as a request extension.  `/blobs/` requests
/// carry a signed grant instead and are checked by their handler.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, UploadError> {
    let path = req.uri().path();

    if req.method() == Method::OPTIONS
        || AUTH_SKIP_PATHS.iter().any(|skip| path == *skip)
        || path.starts_with("/blobs/")
    {
        return Ok(next.run(req).await);
    }

    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    let principal = state.identity.verify(bearer_token(header))?;
    debug!("Authenticated {} ({})", principal.username, principal.user_id);

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

// -- Infrastructure endpoints ------------------------------------------------

/// `GET /health` -- Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /openapi.json` -- The generated OpenAPI document.
async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// -- Query parsing ------------------------------------------------------------

/// Parse a raw query string into a map, percent-decoding keys and values.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            map.insert(
                percent_encoding::percent_decode_str(k)
                    .decode_utf8_lossy()
                    .into_owned(),
                percent_encoding::percent_decode_str(v)
                    .decode_utf8_lossy()
                    .into_owned(),
            );
        }
    }
    map
}

// -- Route handlers -------------------------------------------------------------

type Caller = Extension<Principal>;

async fn handle_create_upload_url(
    State(state): State<Arc<AppState>>,
    Extension(principal): Caller,
    body: Bytes,
) -> Result<Response, UploadError> {
    crate::handlers::files::create_upload_url(state, &principal, &body).await
}

async fn handle_list_files(
    State(state): State<Arc<AppState>>,
    Extension(principal): Caller,
) -> Result<Response, UploadError> {
    crate::handlers::files::list_files(state, &principal).await
}

async fn handle_get_file(
    State(state): State<Arc<AppState>>,
    Extension(principal): Caller,
    Path(file_id): Path<String>,
) -> Result<Response, UploadError> {
    crate::handlers::files::get_file(state, &principal, &file_id).await
}

async fn handle_delete_file(
    State(state): State<Arc<AppState>>,
    Extension(principal): Caller,
    Path(file_id): Path<String>,
) -> Result<Response, UploadError> {
    crate::handlers::files::delete_file(state, &principal, &file_id).await
}

async fn handle_upload_status(
    State(state): State<Arc<AppState>>,
    Extension(principal): Caller,
    Path(file_id): Path<String>,
) -> Result<Response, UploadError> {
    crate::handlers::files::upload_status(state, &principal, &file_id).await
}

async fn handle_download_url(
    State(state): State<Arc<AppState>>,
    Extension(principal): Caller,
    Path(file_id): Path<String>,
) -> Result<Response, UploadError> {
    crate::handlers::files::download_url(state, &principal, &file_id).await
}

async fn handle_complete_upload(
    State(state): State<Arc<AppState>>,
    Extension(principal): Caller,
    Path(file_id): Path<String>,
) -> Result<Response, UploadError> {
    crate::handlers::files::complete_upload(state, &principal, &file_id).await
}

async fn handle_abort_upload(
    State(state): State<Arc<AppState>>,
    Extension(principal): Caller,
    Path(file_id): Path<String>,
) -> Result<Response, UploadError> {
    crate::handlers::files::abort_upload(state, &principal, &file_id).await
}

async fn handle_report_chunk(
    State(state): State<Arc<AppState>>,
    Extension(principal): Caller,
    Path((file_id, chunk_number)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, UploadError> {
    crate::handlers::files::report_chunk(state, &principal, &file_id, &chunk_number, &body).await
}

async fn handle_reissue_chunk_url(
    State(state): State<Arc<AppState>>,
    Extension(principal): Caller,
    Path((file_id, chunk_number)): Path<(String, String)>,
) -> Result<Response, UploadError> {
    crate::handlers::files::reissue_chunk_url(state, &principal, &file_id, &chunk_number).await
}

async fn handle_put_blob(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Result<Response, UploadError> {
    let query = parse_query(raw_query);
    crate::handlers::blobs::put_blob(state, &key, &query, body).await
}

async fn handle_get_blob(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, UploadError> {
    let query = parse_query(raw_query);
    crate::handlers::blobs::get_blob(state, &key, &query).await
}

// -- Tests --------------------------------------------------------------------
