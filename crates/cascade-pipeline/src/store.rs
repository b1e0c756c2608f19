//! Run-record stores: persisted per-step execution history.
//!
//! The store is what makes repeated pipeline invocations idempotent: the
//! executor compares each step's current trigger fingerprint against the
//! record of the last attempt and skips unchanged, previously successful
//! steps. The `lock` operation hands out per-step mutual exclusion that the
//! executor holds across its whole get/execute/put sequence, so two
//! concurrent invocations over the same store cannot both act on a stale
//! "unchanged" read.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use cascade_types::{CascadeError, Result, RunRecord};

/// Per-step mutual exclusion token. Held for the duration of a step's
/// fingerprint comparison and record update; released on drop.
pub struct StepLock {
    _guard: Box<dyn std::any::Any + Send>,
}

impl std::fmt::Debug for StepLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepLock").finish_non_exhaustive()
    }
}

impl StepLock {
    pub fn new(guard: impl std::any::Any + Send) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

/// Durable (or in-memory, for tests and single-shot runs) record storage.
#[async_trait]
pub trait RunRecordStore: Send + Sync {
    async fn get(&self, step: &str) -> Result<Option<RunRecord>>;

    /// Overwrite the record for `step`. Records are superseded, never merged.
    async fn put(&self, step: &str, record: RunRecord) -> Result<()>;

    /// Acquire the per-step lock, suspending until it is available (stores
    /// with cross-process locking may bound the wait and fail with
    /// `LockTimeout`).
    async fn lock(&self, step: &str) -> Result<StepLock>;
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

/// Process-local store. History is lost when the process exits, so this is
/// mainly useful for tests and one-off runs.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: tokio::sync::RwLock<HashMap<String, RunRecord>>,
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn step_mutex(&self, step: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks.entry(step.to_string()).or_default().clone()
    }
}

#[async_trait]
impl RunRecordStore for MemoryRecordStore {
    async fn get(&self, step: &str) -> Result<Option<RunRecord>> {
        Ok(self.records.read().await.get(step).cloned())
    }

    async fn put(&self, step: &str, record: RunRecord) -> Result<()> {
        self.records.write().await.insert(step.to_string(), record);
        Ok(())
    }

    async fn lock(&self, step: &str) -> Result<StepLock> {
        let mutex = self.step_mutex(step);
        let guard = mutex.lock_owned().await;
        Ok(StepLock::new(guard))
    }
}

// ---------------------------------------------------------------------------
// JsonRecordStore
// ---------------------------------------------------------------------------

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Directory-backed store: one JSON document per step, durable across
/// process restarts.
///
/// Cross-process mutual exclusion uses `<step>.lock` marker files created
/// exclusively; acquisition polls with a bounded deadline. A lock file left
/// behind by a crashed process must be removed by hand once the holder is
/// confirmed dead.
pub struct JsonRecordStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl JsonRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn record_path(&self, step: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize(step)))
    }

    fn lock_path(&self, step: &str) -> PathBuf {
        self.root.join(format!("{}.lock", sanitize(step)))
    }
}

#[async_trait]
impl RunRecordStore for JsonRecordStore {
    async fn get(&self, step: &str) -> Result<Option<RunRecord>> {
        let path = self.record_path(step);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, step: &str, record: RunRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.record_path(step);
        let json = serde_json::to_string_pretty(&record)?;
        tokio::fs::write(&path, json).await?;
        tracing::debug!(step, path = %path.display(), "Run record saved");
        Ok(())
    }

    async fn lock(&self, step: &str) -> Result<StepLock> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.lock_path(step);
        let deadline = tokio::time::Instant::now() + self.lock_timeout;

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    return Ok(StepLock::new(LockFileGuard { path }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(CascadeError::LockTimeout {
                            step: step.to_string(),
                        });
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

struct LockFileGuard {
    path: PathBuf,
}

impl Drop for LockFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Keep step names filesystem-safe.
fn sanitize(step: &str) -> String {
    step.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
