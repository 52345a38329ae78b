//! HTTP request handlers.
//!
//! Handlers are grouped by resource. Each one delegates to the upload
//! session and converts its result into a response; errors convert through
//! [`UploadError`](crate::errors::UploadError)'s `IntoResponse`.

pub mod upload;
