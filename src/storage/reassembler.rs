//! Completeness detection and chunk merging.
//!
//! A merge copies fragments in numeric index order into a hidden temp file,
//! checks the result against the fragment sizes recorded at listing time,
//! and only then renames it to its final `<unique_id>` name. Fragments are
//! deleted after the rename, so a crash at any point leaves either the
//! complete set of fragments or the complete file, never a partial file
//! under a final name.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use uuid::Uuid;

use super::chunks::ChunkStore;
use super::paths::SubmissionId;
use super::records::{AssembledFile, ChunkRecord};
use super::sidecar::MetadataSidecarWriter;
use crate::errors::UploadError;

/// Copy buffer size for merges.
const COPY_BUF_SIZE: usize = 64 * 1024;

/// True when `fragments` are exactly the indices `0..declared_total`.
///
/// `fragments` must be sorted by index, as returned by
/// [`ChunkStore::list_chunks`].
pub fn covers_all(fragments: &[ChunkRecord], declared_total: u32) -> bool {
    fragments.len() == declared_total as usize
        && fragments
            .iter()
            .enumerate()
            .all(|(position, chunk)| chunk.index as usize == position)
}

/// Result of a completeness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completeness {
    /// Every declared chunk is staged; fragments sorted by index.
    Complete(Vec<ChunkRecord>),
    /// Some chunks are missing. `received` counts staged indices below the
    /// declared total.
    Incomplete { received: u32 },
}

/// Decides completeness and merges staged chunks.
#[derive(Debug, Clone)]
pub struct Reassembler {
    store: Arc<ChunkStore>,
    sidecars: MetadataSidecarWriter,
}

impl Reassembler {
    pub fn new(store: Arc<ChunkStore>, sidecars: MetadataSidecarWriter) -> Self {
        Self { store, sidecars }
    }

    /// Whether every chunk `0..declared_total` of `safe_name` is staged.
    ///
    /// A declared total of zero means a single-shot upload, which is
    /// complete as soon as it is written.
    pub async fn is_complete(
        &self,
        submission_id: &SubmissionId,
        safe_name: &str,
        declared_total: u32,
    ) -> Result<bool, UploadError> {
        if declared_total == 0 {
            return Ok(true);
        }
        Ok(matches!(
            self.check(submission_id, safe_name, declared_total).await?,
            Completeness::Complete(_)
        ))
    }

    /// List the staged fragments of `safe_name` and classify them.
    pub async fn check(
        &self,
        submission_id: &SubmissionId,
        safe_name: &str,
        declared_total: u32,
    ) -> Result<Completeness, UploadError> {
        let fragments = self.store.list_chunks(submission_id, safe_name).await?;
        if covers_all(&fragments, declared_total) {
            return Ok(Completeness::Complete(fragments));
        }
        let received = fragments
            .iter()
            .filter(|c| c.index < declared_total)
            .count() as u32;
        Ok(Completeness::Incomplete { received })
    }

    /// Merge `fragments` into a new assembled file named by a fresh id.
    ///
    /// The file is published together with its sidecar; fragments are
    /// removed only once both exist. If the sidecar cannot be written the
    /// published file is withdrawn and the fragments stay, so a retried
    /// chunk merges again.
    ///
    /// On a size mismatch the temp file is removed, fragments are kept, and
    /// `CorruptAssembly` is returned so the client can restart the upload.
    pub async fn merge(
        &self,
        submission_id: &SubmissionId,
        original_name: &str,
        fragments: &[ChunkRecord],
    ) -> Result<AssembledFile, UploadError> {
        let mut ordered: Vec<&ChunkRecord> = fragments.iter().collect();
        ordered.sort_by_key(|c| c.index);

        let dir = self.store.ensure_submission_dir(submission_id).await?;
        let unique_id = Uuid::new_v4();
        let final_path = dir.join(unique_id.to_string());
        let tmp_path = ChunkStore::temp_path(&dir);
        let expected: u64 = ordered.iter().map(|c| c.size).sum();

        let (written, sha256) = match copy_fragments(&ordered, &tmp_path).await {
            Ok(copied) => copied,
            Err(e) => {
                self.store.remove_chunk(&tmp_path).await;
                return Err(UploadError::io(
                    format!("merging {original_name} for submission {submission_id}"),
                    e,
                ));
            }
        };

        let on_disk = match tokio::fs::metadata(&tmp_path).await {
            Ok(m) => m.len(),
            Err(e) => {
                self.store.remove_chunk(&tmp_path).await;
                return Err(UploadError::io(
                    format!("checking merged {original_name} for submission {submission_id}"),
                    e,
                ));
            }
        };

        if written != expected || on_disk != expected {
            warn!(
                submission_id = %submission_id,
                file = %original_name,
                expected,
                actual = on_disk,
                "assembled size does not match staged fragments"
            );
            self.store.remove_chunk(&tmp_path).await;
            return Err(UploadError::CorruptAssembly {
                name: original_name.to_string(),
                expected,
                actual: on_disk,
            });
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            self.store.remove_chunk(&tmp_path).await;
            return Err(UploadError::io(
                format!("publishing {original_name} for submission {submission_id}"),
                e,
            ));
        }

        let file = AssembledFile {
            submission_id: submission_id.clone(),
            original_name: original_name.to_string(),
            final_path,
            size_bytes: expected,
            unique_id,
            sha256,
        };
        self.describe_or_withdraw(&file).await?;

        let owned: Vec<ChunkRecord> = ordered.into_iter().cloned().collect();
        self.store.remove_all(&owned).await;

        info!(
            submission_id = %submission_id,
            file = %original_name,
            unique_id = %unique_id,
            chunks = owned.len(),
            bytes = expected,
            "upload assembled"
        );
        Ok(file)
    }

    /// Publish a single-shot staged payload under a fresh id.
    pub async fn promote(
        &self,
        submission_id: &SubmissionId,
        original_name: &str,
        staged: &Path,
    ) -> Result<AssembledFile, UploadError> {
        let context = || format!("publishing {original_name} for submission {submission_id}");
        let dir = self.store.ensure_submission_dir(submission_id).await?;
        let unique_id = Uuid::new_v4();
        let final_path = dir.join(unique_id.to_string());

        let sha256 = match hash_file(staged).await {
            Ok(hash) => hash,
            Err(e) => {
                self.store.remove_chunk(staged).await;
                return Err(UploadError::io(context(), e));
            }
        };
        if let Err(e) = tokio::fs::rename(staged, &final_path).await {
            self.store.remove_chunk(staged).await;
            return Err(UploadError::io(context(), e));
        }
        let size_bytes = match tokio::fs::metadata(&final_path).await {
            Ok(m) => m.len(),
            Err(e) => {
                self.store.remove_chunk(&final_path).await;
                return Err(UploadError::io(context(), e));
            }
        };

        let file = AssembledFile {
            submission_id: submission_id.clone(),
            original_name: original_name.to_string(),
            final_path,
            size_bytes,
            unique_id,
            sha256,
        };
        self.describe_or_withdraw(&file).await?;

        info!(
            submission_id = %submission_id,
            file = %original_name,
            unique_id = %unique_id,
            bytes = size_bytes,
            "single-shot upload stored"
        );
        Ok(file)
    }

    /// Write the sidecar of a freshly published file, removing the file
    /// again if that fails.
    async fn describe_or_withdraw(&self, file: &AssembledFile) -> Result<(), UploadError> {
        if let Err(e) = self.sidecars.write(file).await {
            warn!(
                submission_id = %file.submission_id,
                file = %file.original_name,
                unique_id = %file.unique_id,
                error = %e,
                "sidecar write failed, withdrawing assembled file"
            );
            self.store.remove_chunk(&file.final_path).await;
            return Err(e);
        }
        Ok(())
    }
}

/// Concatenate fragments into `dest`, returning bytes written and the
/// hex SHA-256 of the output.
async fn copy_fragments(fragments: &[&ChunkRecord], dest: &Path) -> std::io::Result<(u64, String)> {
    let mut output = tokio::fs::File::create(dest).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written: u64 = 0;

    for fragment in fragments {
        let mut input = tokio::fs::File::open(&fragment.path).await?;
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            output.write_all(&buf[..n]).await?;
            written += n as u64;
        }
    }

    output.flush().await?;
    output.sync_all().await?; // fsync
    Ok((written, hex::encode(hasher.finalize())))
}

/// Hex SHA-256 of a file's content.
async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut input = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ── Tests ───────────────────────────────────────────────────────────
