//! Naming rules for the upload tree.
//!
//! Every path under the upload root is built from one of the names
//! produced here: a validated [`SubmissionId`], a sanitized file name, a
//! fragment name `<safe>_<index>`, a completed file name `<uuid>`, or a
//! sidecar name `metadata_<uuid><safe>`.

use std::fmt;
use std::path::{Component, Path};

use uuid::Uuid;

use crate::errors::UploadError;

/// Longest submission id accepted (one directory name component).
const MAX_SUBMISSION_ID_LEN: usize = 255;

/// Longest sanitized file name. Leaves room for the `_<index>` suffix and
/// the `metadata_<uuid>` prefix within common 255-byte name limits.
const MAX_SAFE_NAME_LEN: usize = 200;

/// Prefix of sidecar file names.
pub const SIDECAR_PREFIX: &str = "metadata_";

/// Prefix of in-flight temp files. Never matches any other naming rule.
pub const TEMP_PREFIX: &str = ".tmp-";

/// A submission identifier that is safe to use as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubmissionId(String);

impl SubmissionId {
    /// Validate a raw submission id.
    ///
    /// Rejects empty ids, `.` and `..`, anything containing a path
    /// separator or control character, and ids too long for a file name.
    pub fn parse(raw: &str) -> Result<Self, UploadError> {
        let invalid = || UploadError::InvalidSubmissionId {
            submission_id: raw.to_string(),
        };

        if raw.is_empty() || raw.len() > MAX_SUBMISSION_ID_LEN {
            return Err(invalid());
        }
        if raw == "." || raw == ".." {
            return Err(invalid());
        }
        if raw
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(invalid());
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reduce a client-supplied file name to a canonical safe form.
///
/// Path separators become spaces, whitespace runs collapse to `_`, only
/// ASCII alphanumerics plus `.`, `_` and `-` survive, and leading or
/// trailing `.`/`_` are stripped. A name with nothing left is rejected.
pub fn sanitize_filename(name: &str) -> Result<String, UploadError> {
    let spaced: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let filtered: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let trimmed = filtered.trim_matches(|c| c == '.' || c == '_');

    if trimmed.is_empty() {
        return Err(UploadError::invalid(format!(
            "File name {name:?} has no usable characters"
        )));
    }

    let mut safe = trimmed.to_string();
    if safe.len() > MAX_SAFE_NAME_LEN {
        // Only ASCII remains, so any byte index is a char boundary.
        safe.truncate(MAX_SAFE_NAME_LEN);
    }
    Ok(safe)
}

/// File name of chunk `index` of `safe_name`.
pub fn fragment_name(safe_name: &str, index: u32) -> String {
    format!("{safe_name}_{index}")
}

/// If `file_name` is a fragment of `safe_name`, return its index.
///
/// Only `<safe_name>_<digits>` matches, so `report_1_0` is never taken for
/// a fragment of `report`.
pub fn parse_fragment_index(file_name: &str, safe_name: &str) -> Option<u32> {
    let suffix = file_name
        .strip_prefix(safe_name)?
        .strip_prefix('_')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// File name of the sidecar for `unique_id`.
pub fn sidecar_name(unique_id: &Uuid, safe_name: &str) -> String {
    format!("{SIDECAR_PREFIX}{}{safe_name}", unique_id.hyphenated())
}

/// If `file_name` is a sidecar, return the id of the file it describes.
pub fn parse_sidecar_id(file_name: &str) -> Option<Uuid> {
    let rest = file_name.strip_prefix(SIDECAR_PREFIX)?;
    let id = rest.get(..36)?;
    Uuid::parse_str(id).ok()
}

/// If `file_name` is a completed file, return its id.
pub fn parse_completed_id(file_name: &str) -> Option<Uuid> {
    if file_name.len() != 36 {
        return None;
    }
    Uuid::parse_str(file_name).ok()
}

/// Check that a requested name only walks downward.
///
/// Absolute paths, drive prefixes, `..` and empty names are rejected
/// before any filesystem access.
pub fn check_relative_name(name: &str) -> Result<(), UploadError> {
    let rejected = || UploadError::PathTraversalRejected {
        name: name.to_string(),
    };

    if name.is_empty() || name.contains('\0') || name.starts_with('\\') {
        return Err(rejected());
    }
    let path = Path::new(name);
    if path.is_absolute() {
        return Err(rejected());
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(rejected());
            }
        }
    }
    // Backslash separators are literal on unix; treat `..\` as traversal anyway.
    if name.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(rejected());
    }
    Ok(())
}
