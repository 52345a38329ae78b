//! Per-submission upload orchestration.
//!
//! [`SubmissionUploadSession`] is the entry point the HTTP layer calls. It
//! validates identifiers, stages chunks, decides completeness after every
//! write, merges, and writes the metadata sidecar. Writes for the same
//! logical file are serialized by [`KeyedLocks`] so the write / check /
//! merge sequence never interleaves with another request for that file.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::UploadError;
use crate::locks::{KeyedLocks, ParkedChunk, RecentCompletion, UploadKey};
use crate::metrics::{
    ASSEMBLY_FAILURES_TOTAL, BYTES_RECEIVED_TOTAL, CHUNKS_RECEIVED_TOTAL,
    DUPLICATE_FINAL_CHUNKS_TOTAL, FILES_ASSEMBLED_TOTAL, PATH_TRAVERSAL_REJECTED_TOTAL,
};
use crate::storage::chunks::ChunkStore;
use crate::storage::paths::{parse_completed_id, sanitize_filename, SubmissionId, TEMP_PREFIX};
use crate::storage::reassembler::{Completeness, Reassembler};
use crate::storage::records::{AssembledFile, ChunkRecord, UploadMetadataSidecar};
use crate::storage::sidecar::MetadataSidecarWriter;

/// One upload request as received from the client.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    /// Client-supplied logical file name.
    pub name: String,
    /// Zero-based chunk index; absent for single-shot uploads.
    pub chunk: Option<u32>,
    /// Declared chunk count; absent or zero for single-shot uploads.
    pub chunks: Option<u32>,
    pub data: Bytes,
}

/// What an upload request achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The chunk is staged; more are needed.
    Pending {
        name: String,
        received: u32,
        total: u32,
    },
    /// The logical file is assembled and described by a sidecar.
    Completed(AssembledFile),
}

/// JSON view of an [`UploadOutcome`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq, utoipa::ToSchema)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UploadStatus {
    Pending {
        name: String,
        received: u32,
        total: u32,
    },
    Completed {
        file: StoredFileView,
    },
}

/// Client-facing summary of an assembled file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, utoipa::ToSchema)]
pub struct StoredFileView {
    /// Original client-supplied name.
    pub name: String,
    /// Stored name, used with fetch and delete.
    pub unique_id: String,
    pub size: u64,
    pub sha256: String,
}

impl From<&UploadOutcome> for UploadStatus {
    fn from(outcome: &UploadOutcome) -> Self {
        match outcome {
            UploadOutcome::Pending {
                name,
                received,
                total,
            } => UploadStatus::Pending {
                name: name.clone(),
                received: *received,
                total: *total,
            },
            UploadOutcome::Completed(file) => UploadStatus::Completed {
                file: StoredFileView {
                    name: file.original_name.clone(),
                    unique_id: file.unique_id.to_string(),
                    size: file.size_bytes,
                    sha256: file.sha256.clone(),
                },
            },
        }
    }
}

/// An open stored file ready to stream back to a client.
#[derive(Debug)]
pub struct FetchedFile {
    /// Stored name within the submission directory.
    pub name: String,
    pub size: u64,
    pub file: tokio::fs::File,
}

/// How a request maps onto the chunk protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadMode {
    Single,
    Chunked { index: u32, total: u32 },
}

fn upload_mode(chunk: Option<u32>, chunks: Option<u32>) -> Result<UploadMode, UploadError> {
    match (chunk, chunks) {
        (None, None) | (_, Some(0)) => Ok(UploadMode::Single),
        (Some(index), Some(total)) if index >= total => Err(UploadError::invalid(format!(
            "chunk {index} is out of range for {total} chunks"
        ))),
        (Some(index), Some(total)) => Ok(UploadMode::Chunked { index, total }),
        _ => Err(UploadError::invalid(
            "chunk and chunks must be supplied together",
        )),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Coordinates staging, reassembly and sidecar creation for all submissions.
#[derive(Debug)]
pub struct SubmissionUploadSession {
    store: Arc<ChunkStore>,
    reassembler: Reassembler,
    sidecars: MetadataSidecarWriter,
    locks: KeyedLocks,
}

impl SubmissionUploadSession {
    /// `completion_memory` bounds how long a finished assembly answers a
    /// repeated final chunk.
    pub fn new(store: Arc<ChunkStore>, completion_memory: Duration) -> Self {
        let sidecars = MetadataSidecarWriter::new(store.clone());
        Self {
            reassembler: Reassembler::new(store.clone(), sidecars.clone()),
            sidecars,
            locks: KeyedLocks::new(completion_memory),
            store,
        }
    }

    /// Build a session from configuration, creating the upload root.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = ChunkStore::new(&config.storage.upload_root)?;
        Ok(Self::new(
            Arc::new(store),
            Duration::from_secs(config.upload.completion_memory_secs),
        ))
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Accept one chunk (or a whole single-shot file) for a submission.
    pub async fn receive_chunk(
        &self,
        submission_id: &str,
        upload: ChunkUpload,
    ) -> Result<UploadOutcome, UploadError> {
        let submission_id = SubmissionId::parse(submission_id)?;
        let safe_name = sanitize_filename(&upload.name)?;

        match upload_mode(upload.chunk, upload.chunks)? {
            UploadMode::Single => self.receive_single(&submission_id, &upload).await,
            UploadMode::Chunked { index, total } => {
                self.receive_part(&submission_id, &safe_name, index, total, &upload)
                    .await
            }
        }
    }

    async fn receive_single(
        &self,
        submission_id: &SubmissionId,
        upload: &ChunkUpload,
    ) -> Result<UploadOutcome, UploadError> {
        let staged = self.store.stage_pending(submission_id, &upload.data).await?;
        counter!(CHUNKS_RECEIVED_TOTAL, "mode" => "single").increment(1);
        counter!(BYTES_RECEIVED_TOTAL).increment(upload.data.len() as u64);

        let file = self
            .reassembler
            .promote(submission_id, &upload.name, &staged)
            .await?;
        counter!(FILES_ASSEMBLED_TOTAL, "mode" => "single").increment(1);
        Ok(UploadOutcome::Completed(file))
    }

    async fn receive_part(
        &self,
        submission_id: &SubmissionId,
        safe_name: &str,
        index: u32,
        total: u32,
        upload: &ChunkUpload,
    ) -> Result<UploadOutcome, UploadError> {
        let key = UploadKey::new(submission_id, safe_name);
        let mut state = self.locks.acquire(&key).await;

        let is_final = index + 1 == total;
        let final_chunk_sha256 = if is_final {
            Some(sha256_hex(&upload.data))
        } else {
            None
        };

        if let Some(digest) = &final_chunk_sha256 {
            let repeated = match state.recent_within(self.locks.ttl()) {
                Some(recent)
                    if recent.total_chunks == total && recent.final_chunk_sha256 == *digest =>
                {
                    self.answer_from_completion(submission_id, safe_name, recent)
                        .await?
                }
                _ => None,
            };
            if let Some(file) = repeated {
                counter!(DUPLICATE_FINAL_CHUNKS_TOTAL).increment(1);
                info!(
                    submission_id = %submission_id,
                    file = %safe_name,
                    unique_id = %file.unique_id,
                    "repeated final chunk answered from completed assembly"
                );
                state.parked = Some(ParkedChunk {
                    index,
                    total_chunks: total,
                    data: upload.data.clone(),
                });
                return Ok(UploadOutcome::Completed(file));
            }
        } else {
            // A new transfer of this name has started. A final chunk that
            // arrived ahead of it was parked rather than staged.
            if let Some(parked) = state.take_parked(self.locks.ttl()) {
                if parked.total_chunks == total {
                    self.store
                        .write_chunk(submission_id, safe_name, parked.index, &parked.data)
                        .await?;
                    debug!(
                        submission_id = %submission_id,
                        file = %safe_name,
                        chunk = parked.index,
                        "staged parked final chunk for new transfer"
                    );
                }
            }
            state.forget();
        }

        let record = self
            .store
            .write_chunk(submission_id, safe_name, index, &upload.data)
            .await?;
        counter!(CHUNKS_RECEIVED_TOTAL, "mode" => "chunked").increment(1);
        counter!(BYTES_RECEIVED_TOTAL).increment(record.size);

        let fragments = match self.reassembler.check(submission_id, safe_name, total).await? {
            Completeness::Complete(fragments) => fragments,
            Completeness::Incomplete { received } => {
                debug!(
                    submission_id = %submission_id,
                    file = %safe_name,
                    received,
                    total,
                    "upload pending"
                );
                return Ok(UploadOutcome::Pending {
                    name: upload.name.clone(),
                    received,
                    total,
                });
            }
        };

        let final_chunk_sha256 = match final_chunk_sha256 {
            Some(digest) => digest,
            None => self.final_fragment_digest(&fragments).await?,
        };

        let file = match self
            .reassembler
            .merge(submission_id, &upload.name, &fragments)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                if matches!(e, UploadError::CorruptAssembly { .. }) {
                    counter!(ASSEMBLY_FAILURES_TOTAL).increment(1);
                }
                return Err(e);
            }
        };
        counter!(FILES_ASSEMBLED_TOTAL, "mode" => "chunked").increment(1);

        state.recent = Some(RecentCompletion {
            total_chunks: total,
            final_chunk_sha256,
            file: file.clone(),
            at: Instant::now(),
        });
        Ok(UploadOutcome::Completed(file))
    }

    /// The remembered file, if a repeated final chunk can still be answered
    /// with it: nothing is staged for the name and the file was not deleted.
    async fn answer_from_completion(
        &self,
        submission_id: &SubmissionId,
        safe_name: &str,
        recent: &RecentCompletion,
    ) -> Result<Option<AssembledFile>, UploadError> {
        if !self.store.list_chunks(submission_id, safe_name).await?.is_empty() {
            return Ok(None);
        }
        match tokio::fs::try_exists(&recent.file.final_path).await {
            Ok(true) => Ok(Some(recent.file.clone())),
            _ => Ok(None),
        }
    }

    /// Digest of the highest-index fragment, read before merging.
    async fn final_fragment_digest(&self, fragments: &[ChunkRecord]) -> Result<String, UploadError> {
        let Some(last) = fragments.iter().max_by_key(|c| c.index) else {
            return Ok(sha256_hex(&[]));
        };
        let data = tokio::fs::read(&last.path).await.map_err(|e| {
            UploadError::io(
                format!("reading chunk {} of {}", last.index, last.safe_name),
                e,
            )
        })?;
        Ok(sha256_hex(&data))
    }

    /// Delete a stored file by its name inside the submission directory.
    ///
    /// Deleting an assembled file also removes its sidecar and forgets its
    /// completion. A symlink inside the submission is unlinked, never its
    /// target.
    pub async fn delete_file(
        &self,
        submission_id: &str,
        stored_name: &str,
    ) -> Result<String, UploadError> {
        let submission_id = SubmissionId::parse(submission_id)?;
        let resolved = self.resolve(&submission_id, stored_name).await?;
        let path = self.store.submission_dir(&submission_id).join(stored_name);

        let metadata = tokio::fs::metadata(&resolved).await.map_err(|e| {
            UploadError::io(
                format!("inspecting {stored_name} in submission {submission_id}"),
                e,
            )
        })?;
        if !metadata.is_file() {
            return Err(UploadError::NotFound {
                name: stored_name.to_string(),
            });
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UploadError::NotFound {
                    name: stored_name.to_string(),
                })
            }
            Err(e) => {
                return Err(UploadError::io(
                    format!("deleting {stored_name} in submission {submission_id}"),
                    e,
                ))
            }
        }

        if let Some(unique_id) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_completed_id)
        {
            self.sidecars.remove_for(&submission_id, &unique_id).await;
            self.locks
                .forget_completions(&submission_id, Some(&unique_id))
                .await;
        }

        info!(submission_id = %submission_id, file = %stored_name, "file deleted");
        Ok(format!("File {stored_name} Deleted"))
    }

    /// Open a stored file for streaming.
    pub async fn fetch_file(
        &self,
        submission_id: &str,
        stored_name: &str,
    ) -> Result<FetchedFile, UploadError> {
        let submission_id = SubmissionId::parse(submission_id)?;
        let path = self.resolve(&submission_id, stored_name).await?;
        let context = || format!("opening {stored_name} in submission {submission_id}");

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| UploadError::io(context(), e))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| UploadError::io(context(), e))?;
        if !metadata.is_file() {
            return Err(UploadError::NotFound {
                name: stored_name.to_string(),
            });
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(stored_name)
            .to_string();
        Ok(FetchedFile {
            name,
            size: metadata.len(),
            file,
        })
    }

    /// Sidecars of the files currently assembled in a submission.
    pub async fn list_files(
        &self,
        submission_id: &str,
    ) -> Result<Vec<UploadMetadataSidecar>, UploadError> {
        let submission_id = SubmissionId::parse(submission_id)?;
        let present: HashSet<_> = self
            .store
            .list_completed(&submission_id)
            .await?
            .into_iter()
            .map(|f| f.unique_id)
            .collect();

        let mut sidecars = self.sidecars.list(&submission_id).await?;
        sidecars.retain(|s| present.contains(&s.unique_id));
        Ok(sidecars)
    }

    /// Remove everything stored for a submission. Returns whether anything
    /// existed.
    pub async fn purge_submission(&self, submission_id: &str) -> Result<bool, UploadError> {
        let submission_id = SubmissionId::parse(submission_id)?;
        let existed = self.store.purge_submission(&submission_id).await?;
        if existed {
            info!(submission_id = %submission_id, "submission purged");
        }
        self.locks.forget_completions(&submission_id, None).await;
        self.locks.prune_idle();
        Ok(existed)
    }

    /// Resolve a client-named file, hiding in-flight temp files.
    async fn resolve(
        &self,
        submission_id: &SubmissionId,
        stored_name: &str,
    ) -> Result<std::path::PathBuf, UploadError> {
        if stored_name.starts_with(TEMP_PREFIX) {
            return Err(UploadError::NotFound {
                name: stored_name.to_string(),
            });
        }
        match self.store.resolve_within(submission_id, stored_name).await {
            Err(e @ UploadError::PathTraversalRejected { .. }) => {
                counter!(PATH_TRAVERSAL_REJECTED_TOTAL).increment(1);
                warn!(submission_id = %submission_id, file = %stored_name, "path traversal rejected");
                Err(e)
            }
            other => other,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
