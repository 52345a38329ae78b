//! Prometheus metrics for depositstore.
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
pub const HTTP_REQUESTS_TOTAL: &str = "depositstore_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "depositstore_http_request_duration_seconds";

/// Chunks staged (counter). Labels: mode (chunked, single).
pub const CHUNKS_RECEIVED_TOTAL: &str = "depositstore_chunks_received_total";

/// Payload bytes staged (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "depositstore_bytes_received_total";

/// Files assembled and published (counter). Labels: mode (chunked, single).
pub const FILES_ASSEMBLED_TOTAL: &str = "depositstore_files_assembled_total";

/// Merges rejected because the output size did not match (counter).
pub const ASSEMBLY_FAILURES_TOTAL: &str = "depositstore_assembly_failures_total";

/// Duplicate final chunks answered from a remembered assembly (counter).
pub const DUPLICATE_FINAL_CHUNKS_TOTAL: &str = "depositstore_duplicate_final_chunks_total";

/// Fetch/delete requests rejected for escaping the submission (counter).
pub const PATH_TRAVERSAL_REJECTED_TOTAL: &str = "depositstore_path_traversal_rejected_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests).
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(CHUNKS_RECEIVED_TOTAL, "Total chunks staged");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total payload bytes staged");
    describe_counter!(FILES_ASSEMBLED_TOTAL, "Total files assembled");
    describe_counter!(
        ASSEMBLY_FAILURES_TOTAL,
        "Merges rejected because of a size mismatch"
    );
    describe_counter!(
        DUPLICATE_FINAL_CHUNKS_TOTAL,
        "Repeated final chunks answered from a completed assembly"
    );
    describe_counter!(
        PATH_TRAVERSAL_REJECTED_TOTAL,
        "Requests rejected for resolving outside their submission"
    );
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

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
/// This prevents high-cardinality labels from unique submission ids.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/upload/abc-123` -> `/upload/{submission_id}`
/// - `/uploads/abc-123` -> `/uploads/{submission_id}`
/// - `/anything/else` -> `/other`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/openapi.json" | "/metrics" => path.to_string(),
        _ => {
            let trimmed = path.trim_start_matches('/');
            match trimmed.split_once('/') {
                Some((route @ ("upload" | "delete" | "get_file" | "uploads"), _)) => {
                    format!("/{route}/{{submission_id}}")
                }
                _ => "/other".to_string(),
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
        None => (StatusCode::NOT_FOUND, "metrics are disabled").into_response(),
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_fixed_routes() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/openapi.json"), "/openapi.json");
    }

    #[test]
    fn test_normalize_path_submission_routes() {
        assert_eq!(normalize_path("/upload/abc-123"), "/upload/{submission_id}");
        assert_eq!(normalize_path("/delete/abc-123"), "/delete/{submission_id}");
        assert_eq!(normalize_path("/get_file/xyz"), "/get_file/{submission_id}");
        assert_eq!(normalize_path("/uploads/xyz"), "/uploads/{submission_id}");
    }

    #[test]
    fn test_normalize_path_unknown() {
        assert_eq!(normalize_path("/random"), "/other");
        assert_eq!(normalize_path("/foo/bar/baz"), "/other");
    }
}
