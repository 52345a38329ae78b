//! Upload error types.
//!
//! Every variant maps to a stable error code and an HTTP status.  The
//! enum implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(UploadError::NotFound { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors raised by the upload pipeline.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The submission id is malformed or would escape the upload root.
    #[error("Invalid submission id: {submission_id}")]
    InvalidSubmissionId { submission_id: String },

    /// A request field is missing or inconsistent.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// The request body exceeds the configured chunk size limit.
    #[error("Request body exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// The named file does not exist in the submission directory.
    #[error("File {name} not found")]
    NotFound { name: String },

    /// A requested path resolves outside the submission directory.
    #[error("Access to {name} is not permitted")]
    PathTraversalRejected { name: String },

    /// The assembled file does not have the size of its fragments.
    #[error("Assembly of {name} is corrupt: expected {expected} bytes, wrote {actual}; please restart the upload")]
    CorruptAssembly {
        name: String,
        expected: u64,
        actual: u64,
    },

    /// Filesystem failure while staging, merging or reading.
    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl UploadError {
    /// Wrap an I/O error with the submission/file it concerns.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        UploadError::Io {
            context: context.into(),
            source,
        }
    }

    /// Build an `InvalidArgument` from any message.
    pub fn invalid(message: impl Into<String>) -> Self {
        UploadError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Return the stable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::InvalidSubmissionId { .. } => "InvalidSubmissionId",
            UploadError::InvalidArgument { .. } => "InvalidArgument",
            UploadError::PayloadTooLarge { .. } => "PayloadTooLarge",
            UploadError::NotFound { .. } => "NotFound",
            UploadError::PathTraversalRejected { .. } => "PathTraversalRejected",
            UploadError::CorruptAssembly { .. } => "CorruptAssembly",
            UploadError::Io { .. } => "IOError",
            UploadError::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::InvalidSubmissionId { .. } => StatusCode::BAD_REQUEST,
            UploadError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            UploadError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::NotFound { .. } => StatusCode::NOT_FOUND,
            UploadError::PathTraversalRejected { .. } => StatusCode::FORBIDDEN,
            UploadError::CorruptAssembly { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            UploadError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(request_id = %request_id, error = ?self, "request failed");
        }

        // I/O details stay in the log; clients only see the code.
        let message = match &self {
            UploadError::Io { .. } => "Failed to access upload storage".to_string(),
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "code": self.code(),
            "message": message,
            "request_id": request_id,
        });

        (
            status,
            [
                ("content-type", "application/json".to_string()),
                ("x-request-id", request_id),
            ],
            body.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_is_16_uppercase_hex() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_not_found_message() {
        let err = UploadError::NotFound {
            name: "nope.txt".to_string(),
        };
        assert_eq!(err.to_string(), "File nope.txt not found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            UploadError::InvalidSubmissionId {
                submission_id: "/x".into()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            UploadError::PathTraversalRejected { name: "..".into() }.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            UploadError::CorruptAssembly {
                name: "a".into(),
                expected: 2,
                actual: 1
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            UploadError::PayloadTooLarge { limit: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            UploadError::io("x", std::io::Error::other("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_into_response_sets_request_id_header() {
        let resp = UploadError::NotFound {
            name: "a.txt".into(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.headers().contains_key("x-request-id"));
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
