//! Records produced by the staging and reassembly layers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::paths::SubmissionId;

/// Current sidecar schema version.
pub const SIDECAR_VERSION: u32 = 1;

/// One staged chunk of a logical file.
///
/// The declared total chunk count is a property of the request, not of
/// the fragment, so it is not recorded here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub submission_id: SubmissionId,
    /// Sanitized logical file name the fragment belongs to.
    pub safe_name: String,
    /// Zero-based chunk index parsed from the fragment name.
    pub index: u32,
    /// Location of the fragment.
    pub path: PathBuf,
    /// Size on disk when written or listed.
    pub size: u64,
}

/// A fully reassembled upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    /// Owning submission.
    pub submission_id: SubmissionId,
    /// Name as supplied by the client.
    pub original_name: String,
    /// Location of the assembled bytes (`<submission dir>/<unique_id>`).
    pub final_path: PathBuf,
    /// Size of the assembled file in bytes.
    pub size_bytes: u64,
    /// Stored file name, decoupled from the client-supplied name.
    pub unique_id: Uuid,
    /// Hex SHA-256 of the assembled content.
    pub sha256: String,
}

/// Persisted description of an [`AssembledFile`], read by the record builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadataSidecar {
    /// Schema version; readers refuse versions they do not know.
    pub version: u32,
    pub unique_id: Uuid,
    /// Original client-supplied name.
    pub name: String,
    /// Final path of the assembled file.
    pub file: PathBuf,
    /// Size in bytes.
    pub size: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

impl UploadMetadataSidecar {
    /// Describe `file` using the current schema version.
    pub fn for_file(file: &AssembledFile) -> Self {
        Self {
            version: SIDECAR_VERSION,
            unique_id: file.unique_id,
            name: file.original_name.clone(),
            file: file.final_path.clone(),
            size: file.size_bytes,
            sha256: file.sha256.clone(),
            created_at: Utc::now(),
        }
    }
}

/// An assembled file found in a submission directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub unique_id: Uuid,
    pub path: PathBuf,
    pub size: u64,
}
