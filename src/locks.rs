//! Per-file mutual exclusion for the write / check / merge sequence.
//!
//! Each `(submission, safe file name)` pair gets its own async mutex, so
//! requests for the same logical file run one at a time while different
//! files and submissions proceed in parallel. The guarded state remembers
//! the most recent assembly of that file so a repeated final chunk can be
//! answered without staging it again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::storage::paths::SubmissionId;
use crate::storage::records::AssembledFile;

/// Registry size above which idle entries are pruned on acquire.
const PRUNE_THRESHOLD: usize = 1024;

/// Key of one logical file within one submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadKey {
    pub submission_id: SubmissionId,
    pub safe_name: String,
}

impl UploadKey {
    pub fn new(submission_id: &SubmissionId, safe_name: &str) -> Self {
        Self {
            submission_id: submission_id.clone(),
            safe_name: safe_name.to_string(),
        }
    }
}

/// The last completed assembly for a key.
#[derive(Debug, Clone)]
pub struct RecentCompletion {
    pub total_chunks: u32,
    /// Hex SHA-256 of the final chunk's payload.
    pub final_chunk_sha256: String,
    pub file: AssembledFile,
    pub at: Instant,
}

/// A final chunk answered from [`RecentCompletion`] instead of staged.
///
/// It may equally be the first chunk of a new transfer of the same file,
/// so it is kept until the completion expires. If a non-final chunk of the
/// same total arrives meanwhile, it is staged after all.
#[derive(Debug, Clone)]
pub struct ParkedChunk {
    pub index: u32,
    pub total_chunks: u32,
    pub data: Bytes,
}

/// State guarded by a key's mutex.
#[derive(Debug, Default)]
pub struct KeyState {
    pub recent: Option<RecentCompletion>,
    /// Valid only while `recent` is.
    pub parked: Option<ParkedChunk>,
}

impl KeyState {
    /// The remembered completion if it is younger than `ttl`.
    pub fn recent_within(&self, ttl: Duration) -> Option<&RecentCompletion> {
        self.recent.as_ref().filter(|r| r.at.elapsed() < ttl)
    }

    /// Take the parked chunk if its completion is still younger than `ttl`.
    pub fn take_parked(&mut self, ttl: Duration) -> Option<ParkedChunk> {
        let parked = self.parked.take();
        if self.recent_within(ttl).is_some() {
            parked
        } else {
            None
        }
    }

    /// Drop the remembered completion and anything parked against it.
    pub fn forget(&mut self) {
        self.recent = None;
        self.parked = None;
    }
}

/// Registry of per-key async mutexes.
#[derive(Debug)]
pub struct KeyedLocks {
    entries: Mutex<HashMap<UploadKey, Arc<AsyncMutex<KeyState>>>>,
    ttl: Duration,
}

impl KeyedLocks {
    /// `ttl` bounds how long a completion is remembered.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &UploadKey) -> OwnedMutexGuard<KeyState> {
        let slot = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if entries.len() > PRUNE_THRESHOLD {
                prune(&mut entries, self.ttl);
            }
            entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(KeyState::default())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget remembered completions in `submission_id`.
    ///
    /// With `only`, just the completion that produced that file; otherwise
    /// every key of the submission. Waits for each key's current holder.
    pub async fn forget_completions(&self, submission_id: &SubmissionId, only: Option<&Uuid>) {
        let slots: Vec<Arc<AsyncMutex<KeyState>>> = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .iter()
                .filter(|(key, _)| key.submission_id == *submission_id)
                .map(|(_, slot)| slot.clone())
                .collect()
        };
        for slot in slots {
            let mut state = slot.lock().await;
            let matches = match only {
                Some(id) => state.recent.as_ref().is_some_and(|r| r.file.unique_id == *id),
                None => true,
            };
            if matches {
                state.forget();
            }
        }
    }

    /// Drop entries nobody holds and that remember nothing worth keeping.
    pub fn prune_idle(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut entries, self.ttl);
    }
}

fn prune(entries: &mut HashMap<UploadKey, Arc<AsyncMutex<KeyState>>>, ttl: Duration) {
    entries.retain(|_, slot| {
        // Held or awaited elsewhere.
        if Arc::strong_count(slot) > 1 {
            return true;
        }
        match slot.try_lock() {
            Ok(state) => state.recent_within(ttl).is_some(),
            Err(_) => true,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(sub: &str, name: &str) -> UploadKey {
        UploadKey::new(&SubmissionId::parse(sub).unwrap(), name)
    }

    fn file() -> AssembledFile {
        AssembledFile {
            submission_id: SubmissionId::parse("s").unwrap(),
            original_name: "f".into(),
            final_path: PathBuf::from("/tmp/f"),
            size_bytes: 1,
            unique_id: Uuid::new_v4(),
            sha256: String::new(),
        }
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new(Duration::from_secs(60)));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(&key("s", "f")).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new(Duration::from_secs(60));
        let _a = locks.acquire(&key("s", "a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&key("s", "b"))).await;
        assert!(b.is_ok());
        let c = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&key("t", "a"))).await;
        assert!(c.is_ok());
    }

    #[tokio::test]
    async fn test_state_persists_between_acquisitions() {
        let locks = KeyedLocks::new(Duration::from_secs(60));
        {
            let mut state = locks.acquire(&key("s", "f")).await;
            state.recent = Some(RecentCompletion {
                total_chunks: 3,
                final_chunk_sha256: String::new(),
                file: file(),
                at: Instant::now(),
            });
        }
        let state = locks.acquire(&key("s", "f")).await;
        assert_eq!(state.recent_within(locks.ttl()).unwrap().total_chunks, 3);
    }

    #[tokio::test]
    async fn test_prune_keeps_held_and_recent_entries() {
        let locks = KeyedLocks::new(Duration::from_secs(60));
        drop(locks.acquire(&key("s", "idle")).await);
        {
            let mut state = locks.acquire(&key("s", "recent")).await;
            state.recent = Some(RecentCompletion {
                total_chunks: 1,
                final_chunk_sha256: String::new(),
                file: file(),
                at: Instant::now(),
            });
        }
        let _held = locks.acquire(&key("s", "held")).await;

        assert_eq!(locks.len(), 3);
        locks.prune_idle();
        assert_eq!(locks.len(), 2);
    }

    fn completion(file: AssembledFile) -> RecentCompletion {
        RecentCompletion {
            total_chunks: 2,
            final_chunk_sha256: String::new(),
            file,
            at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_forget_completions_by_file_and_by_submission() {
        let locks = KeyedLocks::new(Duration::from_secs(60));
        let kept = file();
        let dropped = file();
        locks.acquire(&key("s", "a")).await.recent = Some(completion(kept.clone()));
        locks.acquire(&key("s", "b")).await.recent = Some(completion(dropped.clone()));
        locks.acquire(&key("t", "a")).await.recent = Some(completion(file()));

        locks
            .forget_completions(&SubmissionId::parse("s").unwrap(), Some(&dropped.unique_id))
            .await;
        assert!(locks.acquire(&key("s", "a")).await.recent.is_some());
        assert!(locks.acquire(&key("s", "b")).await.recent.is_none());

        locks
            .forget_completions(&SubmissionId::parse("s").unwrap(), None)
            .await;
        assert!(locks.acquire(&key("s", "a")).await.recent.is_none());
        assert!(locks.acquire(&key("t", "a")).await.recent.is_some());
    }

    #[tokio::test]
    async fn test_parked_chunk_lives_with_its_completion() {
        let mut state = KeyState {
            recent: Some(completion(file())),
            parked: Some(ParkedChunk {
                index: 1,
                total_chunks: 2,
                data: Bytes::from_static(b"ZZ"),
            }),
        };
        assert_eq!(state.take_parked(Duration::from_secs(60)).unwrap().index, 1);
        assert!(state.parked.is_none());

        state.parked = Some(ParkedChunk {
            index: 1,
            total_chunks: 2,
            data: Bytes::from_static(b"ZZ"),
        });
        assert!(state.take_parked(Duration::ZERO).is_none());
        assert!(state.parked.is_none());
    }

    #[tokio::test]
    async fn test_expired_completion_is_ignored_and_pruned() {
        let locks = KeyedLocks::new(Duration::ZERO);
        {
            let mut state = locks.acquire(&key("s", "f")).await;
            state.recent = Some(RecentCompletion {
                total_chunks: 1,
                final_chunk_sha256: String::new(),
                file: file(),
                at: Instant::now(),
            });
            assert!(state.recent_within(locks.ttl()).is_none());
        }
        locks.prune_idle();
        assert!(locks.is_empty());
    }
}
