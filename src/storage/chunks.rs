//! Chunk staging on the local filesystem.
//!
//! Each submission owns one directory under the upload root. Fragments are
//! stored flat inside it as `<safe-name>_<index>`; assembled files and
//! sidecars share the same directory.
//!
//! All writes follow crash-only design: write to temp file, fsync, rename.
//! A fragment is therefore either wholly present or absent, and a re-sent
//! chunk replaces the previous bytes for its index.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::paths::{
    check_relative_name, fragment_name, parse_completed_id, parse_fragment_index, SubmissionId,
    TEMP_PREFIX,
};
use super::records::{ChunkRecord, CompletedFile};
use crate::errors::UploadError;

/// Stages chunks under a per-submission directory.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    /// Canonical upload root.
    root: PathBuf,
}

impl ChunkStore {
    /// Create a new `ChunkStore` rooted at `root`.
    ///
    /// The directory will be created if it does not exist and is stored in
    /// canonical form so containment checks compare like with like.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    /// The canonical upload root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one submission. Does not touch the filesystem.
    pub fn submission_dir(&self, submission_id: &SubmissionId) -> PathBuf {
        self.root.join(submission_id.as_str())
    }

    /// Create the upload root and the submission directory if absent.
    pub async fn ensure_submission_dir(
        &self,
        submission_id: &SubmissionId,
    ) -> Result<PathBuf, UploadError> {
        let dir = self.submission_dir(submission_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            UploadError::io(format!("creating directory for submission {submission_id}"), e)
        })?;
        Ok(dir)
    }

    /// Generate a temp file path inside `dir` for atomic writes.
    ///
    /// Temp files live next to their destination so the final rename never
    /// crosses a filesystem boundary.
    pub(crate) fn temp_path(dir: &Path) -> PathBuf {
        dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()))
    }

    /// Write `data` to `dest` via temp file, fsync and rename.
    pub(crate) async fn write_atomic(dest: &Path, data: &[u8]) -> std::io::Result<()> {
        let dir = dest
            .parent()
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "destination has no parent"))?;
        let tmp_path = Self::temp_path(dir);

        let result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?; // fsync
            drop(file);
            tokio::fs::rename(&tmp_path, dest).await
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result
    }

    /// Stage chunk `index` of `safe_name`, replacing any earlier write for
    /// the same index.
    pub async fn write_chunk(
        &self,
        submission_id: &SubmissionId,
        safe_name: &str,
        index: u32,
        data: &[u8],
    ) -> Result<ChunkRecord, UploadError> {
        let dir = self.ensure_submission_dir(submission_id).await?;
        let path = dir.join(fragment_name(safe_name, index));

        Self::write_atomic(&path, data).await.map_err(|e| {
            UploadError::io(
                format!("writing chunk {index} of {safe_name} for submission {submission_id}"),
                e,
            )
        })?;
        debug!(submission_id = %submission_id, file = %safe_name, chunk = index, bytes = data.len(), "chunk staged");

        Ok(ChunkRecord {
            submission_id: submission_id.clone(),
            safe_name: safe_name.to_string(),
            index,
            path,
            size: data.len() as u64,
        })
    }

    /// Stage a single-shot payload under a hidden temp name.
    ///
    /// The caller renames it to its final id; until then it matches no
    /// fragment, file or sidecar name.
    pub async fn stage_pending(
        &self,
        submission_id: &SubmissionId,
        data: &[u8],
    ) -> Result<PathBuf, UploadError> {
        let dir = self.ensure_submission_dir(submission_id).await?;
        let path = Self::temp_path(&dir);

        let write = async {
            let mut file = tokio::fs::File::create(&path).await?;
            file.write_all(data).await?;
            file.sync_all().await
        };
        if let Err(e) = write.await {
            self.remove_chunk(&path).await;
            return Err(UploadError::io(
                format!("staging upload for submission {submission_id}"),
                e,
            ));
        }
        Ok(path)
    }

    /// All staged fragments of `safe_name`, sorted by numeric index.
    pub async fn list_chunks(
        &self,
        submission_id: &SubmissionId,
        safe_name: &str,
    ) -> Result<Vec<ChunkRecord>, UploadError> {
        let dir = self.submission_dir(submission_id);
        let context = || format!("listing chunks of {safe_name} for submission {submission_id}");

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UploadError::io(context(), e)),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::io(context(), e))?
        {
            let file_name = entry.file_name();
            let Some(index) = file_name
                .to_str()
                .and_then(|name| parse_fragment_index(name, safe_name))
            else {
                continue;
            };
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Removed by a concurrent merge between listing and stat.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(UploadError::io(context(), e)),
            };
            if !metadata.is_file() {
                continue;
            }
            chunks.push(ChunkRecord {
                submission_id: submission_id.clone(),
                safe_name: safe_name.to_string(),
                index,
                path: entry.path(),
                size: metadata.len(),
            });
        }

        chunks.sort_by_key(|c| c.index);
        Ok(chunks)
    }

    /// Best-effort removal of one staged file. Failures are logged only.
    pub async fn remove_chunk(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove staged file"),
        }
    }

    /// Best-effort removal of many fragments.
    pub async fn remove_all(&self, chunks: &[ChunkRecord]) {
        for chunk in chunks {
            self.remove_chunk(&chunk.path).await;
        }
    }

    /// Resolve `name` inside the submission directory.
    ///
    /// The name must only walk downward, and the canonical resolved path
    /// (symlinks followed) must still lie inside the canonical submission
    /// directory. Returns `NotFound` if nothing exists at the path.
    pub async fn resolve_within(
        &self,
        submission_id: &SubmissionId,
        name: &str,
    ) -> Result<PathBuf, UploadError> {
        check_relative_name(name)?;

        let not_found = || UploadError::NotFound {
            name: name.to_string(),
        };

        let dir = match tokio::fs::canonicalize(self.submission_dir(submission_id)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => {
                return Err(UploadError::io(
                    format!("resolving directory of submission {submission_id}"),
                    e,
                ))
            }
        };

        let candidate = dir.join(name);
        let resolved = match tokio::fs::canonicalize(&candidate).await {
            Ok(path) => path,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => {
                return Err(UploadError::io(
                    format!("resolving {name} for submission {submission_id}"),
                    e,
                ))
            }
        };

        if !resolved.starts_with(&dir) || !resolved.starts_with(&self.root) || resolved == dir {
            return Err(UploadError::PathTraversalRejected {
                name: name.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Assembled files present in a submission directory.
    pub async fn list_completed(
        &self,
        submission_id: &SubmissionId,
    ) -> Result<Vec<CompletedFile>, UploadError> {
        let dir = self.submission_dir(submission_id);
        let context = || format!("listing files for submission {submission_id}");

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UploadError::io(context(), e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::io(context(), e))?
        {
            let Some(unique_id) = entry.file_name().to_str().and_then(parse_completed_id) else {
                continue;
            };
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| UploadError::io(context(), e))?;
            if metadata.is_file() {
                files.push(CompletedFile {
                    unique_id,
                    path: entry.path(),
                    size: metadata.len(),
                });
            }
        }
        files.sort_by_key(|f| f.unique_id);
        Ok(files)
    }

    /// Remove a whole submission directory. Returns whether it existed.
    pub async fn purge_submission(&self, submission_id: &SubmissionId) -> Result<bool, UploadError> {
        let dir = self.submission_dir(submission_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(UploadError::io(
                format!("purging submission {submission_id}"),
                e,
            )),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
