//! depositstore library: chunked upload reception for deposit submissions.
//!
//! This crate stages uploaded chunks per submission, reassembles them into
//! files once every chunk has arrived, records a metadata sidecar for each
//! file, and serves fetch and delete requests confined to the submission's
//! directory.

use std::sync::Arc;

pub mod config;
pub mod errors;
pub mod handlers;
pub mod locks;
pub mod metrics;
pub mod server;
pub mod session;
pub mod storage;

use crate::config::Config;
use crate::session::SubmissionUploadSession;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Upload orchestration over the staging tree.
    pub session: Arc<SubmissionUploadSession>,
}
