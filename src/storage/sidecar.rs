//! Upload metadata sidecars.
//!
//! Each assembled file gets a JSON document next to it named
//! `metadata_<unique_id><safe_name>`. The record builder enumerates these
//! to attach files to the bibliographic record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, warn};
use uuid::Uuid;

use super::chunks::ChunkStore;
use super::paths::{parse_sidecar_id, sanitize_filename, sidecar_name, SubmissionId};
use super::records::{AssembledFile, UploadMetadataSidecar, SIDECAR_VERSION};
use crate::errors::UploadError;

/// Persists and reads [`UploadMetadataSidecar`] records.
#[derive(Debug, Clone)]
pub struct MetadataSidecarWriter {
    store: Arc<ChunkStore>,
    /// Makes every write fail; shared by clones.
    #[cfg(test)]
    failing: Arc<std::sync::atomic::AtomicBool>,
}

impl MetadataSidecarWriter {
    pub fn new(store: Arc<ChunkStore>) -> Self {
        Self {
            store,
            #[cfg(test)]
            failing: Arc::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.failing
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Write the sidecar for `file`, returning its path.
    pub async fn write(&self, file: &AssembledFile) -> Result<PathBuf, UploadError> {
        let safe_name = sanitize_filename(&file.original_name)?;
        let dir = self.store.ensure_submission_dir(&file.submission_id).await?;
        let path = dir.join(sidecar_name(&file.unique_id, &safe_name));

        #[cfg(test)]
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(UploadError::io(
                format!("writing sidecar for {}", file.original_name),
                std::io::Error::other("sidecar writes disabled"),
            ));
        }

        let sidecar = UploadMetadataSidecar::for_file(file);
        let body = serde_json::to_vec_pretty(&sidecar)
            .context("serializing upload sidecar")
            .map_err(UploadError::InternalError)?;

        ChunkStore::write_atomic(&path, &body).await.map_err(|e| {
            UploadError::io(
                format!(
                    "writing sidecar for {} in submission {}",
                    file.original_name, file.submission_id
                ),
                e,
            )
        })?;
        debug!(submission_id = %file.submission_id, unique_id = %file.unique_id, "sidecar written");
        Ok(path)
    }

    /// Read one sidecar, refusing schema versions newer than this build.
    pub async fn read(&self, path: &Path) -> Result<UploadMetadataSidecar, UploadError> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| UploadError::io(format!("reading sidecar {}", path.display()), e))?;
        let sidecar: UploadMetadataSidecar = serde_json::from_slice(&body)
            .with_context(|| format!("parsing sidecar {}", path.display()))?;
        if sidecar.version > SIDECAR_VERSION {
            return Err(UploadError::InternalError(anyhow::anyhow!(
                "sidecar {} has unsupported version {}",
                path.display(),
                sidecar.version
            )));
        }
        Ok(sidecar)
    }

    /// All readable sidecars of a submission, ordered by creation time.
    ///
    /// Unreadable sidecars are logged and skipped so one damaged entry
    /// does not hide the rest.
    pub async fn list(
        &self,
        submission_id: &SubmissionId,
    ) -> Result<Vec<UploadMetadataSidecar>, UploadError> {
        let mut sidecars = Vec::new();
        for (_, path) in self.sidecar_paths(submission_id, None).await? {
            match self.read(&path).await {
                Ok(sidecar) => sidecars.push(sidecar),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable sidecar"),
            }
        }
        sidecars.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.unique_id.cmp(&b.unique_id))
        });
        Ok(sidecars)
    }

    /// Remove every sidecar describing `unique_id`. Best effort.
    pub async fn remove_for(&self, submission_id: &SubmissionId, unique_id: &Uuid) {
        match self.sidecar_paths(submission_id, Some(unique_id)).await {
            Ok(paths) => {
                for (_, path) in paths {
                    self.store.remove_chunk(&path).await;
                }
            }
            Err(e) => warn!(submission_id = %submission_id, error = %e, "failed to list sidecars"),
        }
    }

    async fn sidecar_paths(
        &self,
        submission_id: &SubmissionId,
        only: Option<&Uuid>,
    ) -> Result<Vec<(Uuid, PathBuf)>, UploadError> {
        let dir = self.store.submission_dir(submission_id);
        let context = || format!("listing sidecars for submission {submission_id}");

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UploadError::io(context(), e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::io(context(), e))?
        {
            let Some(id) = entry.file_name().to_str().and_then(parse_sidecar_id) else {
                continue;
            };
            if only.is_some_and(|wanted| *wanted != id) {
                continue;
            }
            paths.push((id, entry.path()));
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Arc<ChunkStore>, MetadataSidecarWriter) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = Arc::new(ChunkStore::new(dir.path()).expect("failed to create store"));
        let writer = MetadataSidecarWriter::new(store.clone());
        (dir, store, writer)
    }

    fn assembled(store: &ChunkStore, name: &str, size: u64) -> AssembledFile {
        let submission_id = SubmissionId::parse("abc-123").unwrap();
        let unique_id = Uuid::new_v4();
        AssembledFile {
            final_path: store.submission_dir(&submission_id).join(unique_id.to_string()),
            submission_id,
            original_name: name.to_string(),
            size_bytes: size,
            unique_id,
            sha256: "00".repeat(32),
        }
    }

    #[tokio::test]
    async fn test_write_and_read_sidecar() {
        let (_dir, store, writer) = setup();
        let file = assembled(&store, "report.pdf", 6);

        let path = writer.write(&file).await.unwrap();
        let expected_name = format!("metadata_{}report.pdf", file.unique_id);
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), expected_name);

        let sidecar = writer.read(&path).await.unwrap();
        assert_eq!(sidecar.version, SIDECAR_VERSION);
        assert_eq!(sidecar.name, "report.pdf");
        assert_eq!(sidecar.file, file.final_path);
        assert_eq!(sidecar.size, 6);
        assert_eq!(sidecar.unique_id, file.unique_id);
    }

    #[tokio::test]
    async fn test_sidecar_is_plain_json() {
        let (_dir, store, writer) = setup();
        let file = assembled(&store, "data set.csv", 42);
        let path = writer.write(&file).await.unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["name"], "data set.csv");
        assert_eq!(value["size"], 42);
    }

    #[tokio::test]
    async fn test_read_rejects_future_version() {
        let (_dir, store, writer) = setup();
        let file = assembled(&store, "a.txt", 1);
        let path = writer.write(&file).await.unwrap();

        let mut value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        value["version"] = serde_json::json!(SIDECAR_VERSION + 1);
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        assert!(writer.read(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let (_dir, store, writer) = setup();
        let first = assembled(&store, "one.txt", 1);
        let second = assembled(&store, "two.txt", 2);
        writer.write(&first).await.unwrap();
        writer.write(&second).await.unwrap();

        let dir = store.submission_dir(&first.submission_id);
        std::fs::write(dir.join(format!("metadata_{}broken", Uuid::new_v4())), b"{").unwrap();

        let listed = writer.list(&first.submission_id).await.unwrap();
        assert_eq!(listed.len(), 2);

        writer.remove_for(&first.submission_id, &first.unique_id).await;
        let listed = writer.list(&first.submission_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].unique_id, second.unique_id);
    }

    #[tokio::test]
    async fn test_list_missing_submission_is_empty() {
        let (_dir, _store, writer) = setup();
        let id = SubmissionId::parse("nobody").unwrap();
        assert!(writer.list(&id).await.unwrap().is_empty());
    }
}
