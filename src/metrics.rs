//! Prometheus metrics for DropVault.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "dropvault_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "dropvault_http_request_duration_seconds";

/// Upload plans issued (counter). Labels: upload_type.
pub const UPLOAD_PLANS_TOTAL: &str = "dropvault_upload_plans_total";

/// Chunk outcome reports (counter). Labels: status.
pub const CHUNK_REPORTS_TOTAL: &str = "dropvault_chunk_reports_total";

/// Finalize calls (counter). Labels: outcome.
pub const FINALIZATIONS_TOTAL: &str = "dropvault_finalizations_total";

/// Aborted multipart uploads (counter).
pub const ABORTS_TOTAL: &str = "dropvault_aborts_total";

/// Deleted files (counter).
pub const DELETIONS_TOTAL: &str = "dropvault_deletions_total";

/// Storage allocations left without metadata after a failure (counter).
pub const ORPHANED_ALLOCATIONS_TOTAL: &str = "dropvault_orphaned_allocations_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(UPLOAD_PLANS_TOTAL, "Upload plans issued by upload type");
    describe_counter!(CHUNK_REPORTS_TOTAL, "Chunk outcome reports by status");
    describe_counter!(FINALIZATIONS_TOTAL, "Multipart finalize calls by outcome");
    describe_counter!(ABORTS_TOTAL, "Aborted multipart uploads");
    describe_counter!(DELETIONS_TOTAL, "Deleted files");
    describe_counter!(
        ORPHANED_ALLOCATIONS_TOTAL,
        "Blob store allocations with no metadata record"
    );
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    // Do not instrument the metrics endpoint itself.
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// This prevents high-cardinality labels from file ids and blob keys.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/files/upload-url` -> `/files/upload-url`
/// - `/files/3f2a...` -> `/files/{id}`
/// - `/files/3f2a.../chunks/2/complete` -> `/files/{id}/chunks/{n}/complete`
/// - `/blobs/any/key` -> `/blobs/{key}`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/openapi.json" | "/metrics" | "/files" | "/files/upload-url" => {
            path.to_string()
        }
        _ => {
            let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
            match segments.as_slice() {
                ["files", _] => "/files/{id}".to_string(),
                ["files", _, action] => format!("/files/{{id}}/{action}"),
                ["files", _, "chunks", _, action] => format!("/files/{{id}}/chunks/{{n}}/{action}"),
                ["blobs", ..] => "/blobs/{key}".to_string(),
                _ => "/{other}".to_string(),
            }
        }
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

// -- Tests --------------------------------------------------------------------
