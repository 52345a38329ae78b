//! Axum router construction.
//!
//! The [`app`] function wires every endpoint to its handler and returns a
//! ready-to-serve [`axum::Router`].

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::errors::generate_request_id;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Multipart framing allowance on top of the chunk payload limit.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the depositstore upload API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "depositstore Upload API",
        version = "0.1.0",
        description = "Chunked upload reception and reassembly for deposit submissions"
    ),
    paths(
        health_check,
        crate::handlers::upload::upload_chunk,
        crate::handlers::upload::delete_file,
        crate::handlers::upload::get_file,
        crate::handlers::upload::list_uploads,
        crate::handlers::upload::purge_submission,
    ),
    components(schemas(
        crate::session::UploadStatus,
        crate::session::StoredFileView,
    )),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Upload", description = "Chunked upload, fetch and delete"),
    )
)]
pub struct ApiDoc;

/// Build the axum [`Router`] with all routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state
        .config
        .server
        .max_chunk_size
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/openapi.json", get(openapi_json))
        .route(
            "/upload/:submission_id",
            post(crate::handlers::upload::upload_chunk),
        )
        .route(
            "/delete/:submission_id",
            post(crate::handlers::upload::delete_file),
        )
        .route(
            "/get_file/:submission_id",
            get(crate::handlers::upload::get_file),
        )
        .route(
            "/uploads/:submission_id",
            get(crate::handlers::upload::list_uploads)
                .delete(crate::handlers::upload::purge_submission),
        )
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-request-id` (unless an error response already set one), `Date`
/// and `Server` to every response.
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
    headers.insert("server", HeaderValue::from_static("depositstore"));

    response
}

// -- Infrastructure endpoints ------------------------------------------------

/// `GET /health` -- liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses((status = 200, description = "Service is healthy"))
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /openapi.json` -- the generated OpenAPI document.
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::SubmissionUploadSession;
    use axum::body::{to_bytes, Body};
    use tower::ServiceExt;

    const BOUNDARY: &str = "depositstore-test-boundary";

    fn test_app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = Config::default();
        config.storage.upload_root = dir.path().to_path_buf();
        config.server.max_chunk_size = 1024;
        let session = SubmissionUploadSession::from_config(&config).expect("session");
        let state = Arc::new(AppState {
            config,
            session: Arc::new(session),
        });
        (dir, app(state))
    }

    fn multipart_body(fields: &[(&str, &str)], file: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(file);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(submission: &str, fields: &[(&str, &str)], file: &[u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/upload/{submission}"))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(fields, file)))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn text_body(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_common_headers() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("server").unwrap(), "depositstore");
        assert!(response.headers().contains_key("x-request-id"));
        assert!(response.headers().contains_key("date"));
    }

    #[tokio::test]
    async fn test_openapi_lists_upload_route() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(Request::get("/openapi.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let doc = json_body(response).await;
        assert!(doc["paths"]["/upload/{submission_id}"].is_object());
    }

    #[tokio::test]
    async fn test_chunked_upload_fetch_and_delete() {
        let (_dir, app) = test_app();

        for (chunk, data) in [("2", "CC"), ("0", "AA")] {
            let response = app
                .clone()
                .oneshot(upload_request(
                    "abc-123",
                    &[("name", "report.pdf"), ("chunk", chunk), ("chunks", "3")],
                    data.as_bytes(),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(json_body(response).await["status"], "pending");
        }

        let response = app
            .clone()
            .oneshot(upload_request(
                "abc-123",
                &[("name", "report.pdf"), ("chunk", "1"), ("chunks", "3")],
                b"BB",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = json_body(response).await;
        assert_eq!(status["status"], "completed");
        assert_eq!(status["file"]["size"], 6);
        assert_eq!(status["file"]["name"], "report.pdf");
        let stored = status["file"]["unique_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/get_file/abc-123?filename={stored}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get("content-disposition")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("attachment"));
        assert_eq!(text_body(response).await, "AABBCC");

        let response = app
            .clone()
            .oneshot(Request::get("/uploads/abc-123").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed = json_body(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["size"], 6);

        let response = app
            .clone()
            .oneshot(
                Request::post("/delete/abc-123")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(format!("filename={stored}")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text_body(response).await, format!("File {stored} Deleted"));

        let response = app
            .oneshot(Request::get("/uploads/abc-123").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(json_body(response).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_404() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(
                Request::post("/delete/abc-123")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("filename=nope.txt"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["code"], "NotFound");
        assert_eq!(body["message"], "File nope.txt not found");
    }

    #[tokio::test]
    async fn test_missing_filename_is_json_invalid_argument() {
        let (_dir, app) = test_app();
        let requests = [
            Request::post("/delete/abc-123")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::empty())
                .unwrap(),
            Request::post("/delete/abc-123")
                .body(Body::from("filename=a.txt"))
                .unwrap(),
            Request::get("/get_file/abc-123").body(Body::empty()).unwrap(),
            Request::get("/get_file/abc-123?filename=").body(Body::empty()).unwrap(),
        ];
        for request in requests {
            let target = format!("{} {}", request.method(), request.uri());
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{target}");
            assert!(response.headers().contains_key("x-request-id"), "{target}");
            let body = json_body(response).await;
            assert_eq!(body["code"], "InvalidArgument", "{target}");
            assert!(body["request_id"].is_string(), "{target}");
        }
    }

    #[tokio::test]
    async fn test_fetch_traversal_is_rejected() {
        let (_dir, app) = test_app();
        let response = app
            .clone()
            .oneshot(upload_request("abc-123", &[("name", "a.txt")], b"x"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/get_file/abc-123?filename=../../etc/passwd")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["code"], "PathTraversalRejected");
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_fields() {
        let (_dir, app) = test_app();
        let response = app
            .clone()
            .oneshot(upload_request(
                "abc-123",
                &[("name", "a.txt"), ("chunk", "x"), ("chunks", "2")],
                b"x",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "InvalidArgument");

        let response = app
            .oneshot(upload_request(
                "abc-123",
                &[("name", "a.txt"), ("chunk", "0")],
                b"x",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_rejected() {
        let (_dir, app) = test_app();
        let big = vec![b'x'; 1024 + MULTIPART_OVERHEAD + 1];
        let response = app
            .oneshot(upload_request("abc-123", &[("name", "big.bin")], &big))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_purge_submission() {
        let (dir, app) = test_app();
        let response = app
            .clone()
            .oneshot(upload_request("abc-123", &[("name", "a.txt")], b"x"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(dir.path().join("abc-123").exists());

        let response = app
            .oneshot(
                Request::delete("/uploads/abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!dir.path().join("abc-123").exists());
    }
}
