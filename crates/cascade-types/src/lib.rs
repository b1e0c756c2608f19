//! Shared types, errors, fingerprints, and run records for the Cascade pipeline engine.
//!
//! This crate provides the foundational types used across all other Cascade crates:
//! - `CascadeError` — unified error taxonomy
//! - `Fingerprint` — stable content identity used for change detection
//! - `RunRecord` / `StepOutput` — persisted execution history
//! - `StepResult` / `RunReport` — per-run result mapping
//! - `CancelToken` — cooperative cancellation for in-flight runs

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unified error type for all Cascade subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    // === Graph construction errors ===
    #[error("Duplicate step name '{name}' in pipeline")]
    DuplicateStepName { name: String },

    #[error("Dependency cycle detected among steps: {}", involved.join(", "))]
    CycleDetected { involved: Vec<String> },

    #[error("Step '{step}' triggers on unknown step '{target}'")]
    UnknownTriggerTarget { step: String, target: String },

    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    // === Fingerprinting errors ===
    #[error("Trigger input '{}' is unavailable: {reason}", path.display())]
    InputUnavailable { path: PathBuf, reason: String },

    #[error("Upstream step '{upstream}' has not produced an output yet")]
    UpstreamNotYetRun { upstream: String },

    // === Per-step execution errors ===
    #[error("Step '{step}' blocked: upstream step '{upstream}' did not succeed")]
    UpstreamFailed { step: String, upstream: String },

    #[error("Step '{step}' failed with exit code {exit_code}")]
    StepFailed { step: String, exit_code: i32 },

    #[error("Step '{step}': working directory '{}' is claimed by a concurrently executing step", dir.display())]
    WorkingDirConflict { step: String, dir: PathBuf },

    // === Store errors ===
    #[error("Timed out waiting for the run-record lock of step '{step}'")]
    LockTimeout { step: String },

    // === Cancellation ===
    #[error("Pipeline run cancelled")]
    Cancelled,

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CascadeError {
    /// Returns `true` for errors raised during graph construction or
    /// validation. When one of these surfaces, no command has run at all.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            CascadeError::DuplicateStepName { .. }
                | CascadeError::CycleDetected { .. }
                | CascadeError::UnknownTriggerTarget { .. }
                | CascadeError::ValidationError(_)
        )
    }

    /// Returns `true` for errors scoped to a single step. These are recorded
    /// in the run report and do not abort sibling steps.
    pub fn is_step_error(&self) -> bool {
        matches!(
            self,
            CascadeError::InputUnavailable { .. }
                | CascadeError::UpstreamNotYetRun { .. }
                | CascadeError::UpstreamFailed { .. }
                | CascadeError::StepFailed { .. }
                | CascadeError::WorkingDirConflict { .. }
        )
    }
}

/// A convenience alias for `Result<T, CascadeError>`.
pub type Result<T> = std::result::Result<T, CascadeError>;

// ---------------------------------------------------------------------------
// Fingerprint — stable content identity
// ---------------------------------------------------------------------------

/// Hex-encoded SHA-256 digest identifying the content of one or more inputs.
///
/// Equal fingerprints mean "nothing relevant changed"; the executor skips a
/// step exactly when its current trigger fingerprint matches the last
/// successfully recorded one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Digest a raw byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(to_hex(&hasher.finalize()))
    }

    /// Digest the concatenation of existing fingerprints, in iteration order.
    ///
    /// Order-sensitive: combining the same fingerprints in a different order
    /// yields a different result, so reordering a trigger list is a
    /// detectable change.
    pub fn combine<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a Fingerprint>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.0.as_bytes());
        }
        Self(to_hex(&hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log output.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn to_hex(digest: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

// ---------------------------------------------------------------------------
// StepOutput / RunRecord — persisted execution history
// ---------------------------------------------------------------------------

/// The content-identified artifact a step produced.
///
/// Immutable once created; a later run supersedes it with a new value rather
/// than mutating it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Combined digest of the matched files.
    pub digest: Fingerprint,
    /// Directory the output spec was evaluated against.
    pub root: PathBuf,
    /// Matched files, relative to `root`, sorted.
    pub files: Vec<PathBuf>,
}

/// Outcome status persisted in a [`RunRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Per-step history of the last execution attempt.
///
/// Created on the first attempt, overwritten on every subsequent one, never
/// deleted by the engine. Durable stores keep this across process restarts so
/// repeated pipeline invocations stay idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// The trigger fingerprint that caused the last attempt.
    pub last_trigger_fingerprint: Fingerprint,
    /// Output of the last successful run, if any. A failed attempt keeps the
    /// previous output so downstream history is not lost.
    pub last_output: Option<StepOutput>,
    pub last_status: RunStatus,
    pub last_run_at: chrono::DateTime<chrono::Utc>,
}

impl RunRecord {
    /// Record for a successful execution.
    pub fn succeeded(fingerprint: Fingerprint, output: StepOutput) -> Self {
        Self {
            last_trigger_fingerprint: fingerprint,
            last_output: Some(output),
            last_status: RunStatus::Succeeded,
            last_run_at: chrono::Utc::now(),
        }
    }

    /// Record for a failed attempt. `prior_output` carries forward the output
    /// of the last successful run, if there was one.
    pub fn failed(fingerprint: Fingerprint, prior_output: Option<StepOutput>) -> Self {
        Self {
            last_trigger_fingerprint: fingerprint,
            last_output: prior_output,
            last_status: RunStatus::Failed,
            last_run_at: chrono::Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepResult / RunReport — per-run result mapping
// ---------------------------------------------------------------------------

/// What happened to a single step during one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    /// The command ran and exited zero.
    Executed {
        output: StepOutput,
        stdout: String,
        duration_ms: u64,
    },
    /// Trigger fingerprint unchanged since the last success; the recorded
    /// output was reused for downstream consumers.
    Skipped { output: StepOutput },
    /// The command failed, or the step could not be prepared for execution.
    Failed {
        error: String,
        exit_code: Option<i32>,
    },
    /// An upstream dependency did not succeed, so this step never evaluated
    /// its fingerprint.
    Blocked { upstream: String },
    /// The run was cancelled before this step finished.
    Cancelled,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Executed { .. } | StepResult::Skipped { .. })
    }

    /// The output visible to downstream steps, when there is one.
    pub fn output(&self) -> Option<&StepOutput> {
        match self {
            StepResult::Executed { output, .. } | StepResult::Skipped { output } => Some(output),
            _ => None,
        }
    }
}

/// Result of one full pipeline invocation.
///
/// Always a complete per-step mapping, even when some steps failed: callers
/// can distinguish "nothing ran" (a graph error, surfaced as `Err`) from
/// "some steps failed" (an `Ok` report with `Failed`/`Blocked` entries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: uuid::Uuid,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub steps: std::collections::HashMap<String, StepResult>,
}

impl RunReport {
    pub fn result(&self, step: &str) -> Option<&StepResult> {
        self.steps.get(step)
    }

    pub fn executed_count(&self) -> usize {
        self.steps
            .values()
            .filter(|r| matches!(r, StepResult::Executed { .. }))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.steps
            .values()
            .filter(|r| matches!(r, StepResult::Skipped { .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.steps
            .values()
            .filter(|r| matches!(r, StepResult::Failed { .. } | StepResult::Blocked { .. }))
            .count()
    }

    /// True when every step was skipped: the idempotent no-op case.
    pub fn all_skipped(&self) -> bool {
        !self.steps.is_empty() && self.steps.values().all(|r| matches!(r, StepResult::Skipped { .. }))
    }
}

// ---------------------------------------------------------------------------
// CancelToken — cooperative cancellation
// ---------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle for cancelling an in-flight pipeline run.
///
/// The executor checks the token at every suspension point; in-flight
/// commands are terminated and run records are left at their prior state.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: tokio::sync::Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after registering: cancel() may have landed in between.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Error display ---

    #[test]
    fn error_display_duplicate_step() {
        let err = CascadeError::DuplicateStepName {
            name: "generate".into(),
        };
        assert_eq!(err.to_string(), "Duplicate step name 'generate' in pipeline");
    }

    #[test]
    fn error_display_cycle() {
        let err = CascadeError::CycleDetected {
            involved: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected among steps: a, b");
    }

    #[test]
    fn error_display_unknown_trigger() {
        let err = CascadeError::UnknownTriggerTarget {
            step: "publish".into(),
            target: "missing".into(),
        };
        assert_eq!(
            err.to_string(),
            "Step 'publish' triggers on unknown step 'missing'"
        );
    }

    #[test]
    fn error_display_input_unavailable() {
        let err = CascadeError::InputUnavailable {
            path: PathBuf::from("/tmp/plugin"),
            reason: "No such file".into(),
        };
        assert_eq!(
            err.to_string(),
            "Trigger input '/tmp/plugin' is unavailable: No such file"
        );
    }

    #[test]
    fn error_display_upstream_failed() {
        let err = CascadeError::UpstreamFailed {
            step: "publish-npm".into(),
            upstream: "generate".into(),
        };
        assert_eq!(
            err.to_string(),
            "Step 'publish-npm' blocked: upstream step 'generate' did not succeed"
        );
    }

    #[test]
    fn error_display_step_failed() {
        let err = CascadeError::StepFailed {
            step: "publish-npm".into(),
            exit_code: 1,
        };
        assert_eq!(err.to_string(), "Step 'publish-npm' failed with exit code 1");
    }

    // --- Classification ---

    #[test]
    fn graph_errors_classified() {
        assert!(CascadeError::DuplicateStepName { name: "x".into() }.is_graph_error());
        assert!(CascadeError::CycleDetected { involved: vec![] }.is_graph_error());
        assert!(CascadeError::ValidationError("bad".into()).is_graph_error());
        assert!(!CascadeError::Cancelled.is_graph_error());
        assert!(!CascadeError::StepFailed { step: "x".into(), exit_code: 1 }.is_graph_error());
    }

    #[test]
    fn step_errors_classified() {
        assert!(CascadeError::StepFailed { step: "x".into(), exit_code: 2 }.is_step_error());
        assert!(CascadeError::UpstreamNotYetRun { upstream: "g".into() }.is_step_error());
        assert!(CascadeError::WorkingDirConflict {
            step: "x".into(),
            dir: PathBuf::from("/tmp/wd"),
        }
        .is_step_error());
        assert!(!CascadeError::CycleDetected { involved: vec![] }.is_step_error());
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CascadeError = io_err.into();
        assert!(matches!(err, CascadeError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    // --- Fingerprint ---

    #[test]
    fn fingerprint_is_deterministic() {
        let a = Fingerprint::from_bytes(b"hello");
        let b = Fingerprint::from_bytes(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn fingerprint_differs_for_different_content() {
        let a = Fingerprint::from_bytes(b"hello");
        let b = Fingerprint::from_bytes(b"hello!");
        assert_ne!(a, b);
    }

    #[test]
    fn combine_is_order_sensitive() {
        let a = Fingerprint::from_bytes(b"a");
        let b = Fingerprint::from_bytes(b"b");
        let ab = Fingerprint::combine([&a, &b]);
        let ba = Fingerprint::combine([&b, &a]);
        assert_ne!(ab, ba);
    }

    #[test]
    fn combine_of_nothing_is_stable() {
        let empty1 = Fingerprint::combine([]);
        let empty2 = Fingerprint::combine([]);
        assert_eq!(empty1, empty2);
    }

    #[test]
    fn short_prefix() {
        let fp = Fingerprint::from_bytes(b"x");
        assert_eq!(fp.short().len(), 12);
        assert!(fp.as_str().starts_with(fp.short()));
    }

    // --- RunRecord ---

    fn sample_output() -> StepOutput {
        StepOutput {
            digest: Fingerprint::from_bytes(b"artifact"),
            root: PathBuf::from("/tmp/work"),
            files: vec![PathBuf::from("sdk/index.js")],
        }
    }

    #[test]
    fn run_record_serde_round_trip() {
        let record = RunRecord::succeeded(Fingerprint::from_bytes(b"fp"), sample_output());
        let json = serde_json::to_string(&record).unwrap();
        let restored: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.last_trigger_fingerprint, record.last_trigger_fingerprint);
        assert_eq!(restored.last_status, RunStatus::Succeeded);
        assert_eq!(restored.last_output, record.last_output);
    }

    #[test]
    fn failed_record_keeps_prior_output() {
        let output = sample_output();
        let record = RunRecord::failed(Fingerprint::from_bytes(b"fp2"), Some(output.clone()));
        assert_eq!(record.last_status, RunStatus::Failed);
        assert_eq!(record.last_output, Some(output));
    }

    // --- StepResult / RunReport ---

    #[test]
    fn step_result_success_and_output() {
        let executed = StepResult::Executed {
            output: sample_output(),
            stdout: "published".into(),
            duration_ms: 10,
        };
        assert!(executed.is_success());
        assert!(executed.output().is_some());

        let blocked = StepResult::Blocked { upstream: "generate".into() };
        assert!(!blocked.is_success());
        assert!(blocked.output().is_none());
    }

    #[test]
    fn step_result_serializes_with_status_tag() {
        let skipped = StepResult::Skipped { output: sample_output() };
        let json = serde_json::to_value(&skipped).unwrap();
        assert_eq!(json["status"], "skipped");
    }

    #[test]
    fn run_report_counts() {
        let mut steps = std::collections::HashMap::new();
        steps.insert(
            "a".to_string(),
            StepResult::Skipped { output: sample_output() },
        );
        steps.insert(
            "b".to_string(),
            StepResult::Failed { error: "exit 1".into(), exit_code: Some(1) },
        );
        steps.insert("c".to_string(), StepResult::Blocked { upstream: "b".into() });

        let report = RunReport {
            run_id: uuid::Uuid::new_v4(),
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
            steps,
        };

        assert_eq!(report.executed_count(), 0);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.failed_count(), 2);
        assert!(!report.all_skipped());
    }

    #[test]
    fn run_report_all_skipped() {
        let mut steps = std::collections::HashMap::new();
        steps.insert("a".to_string(), StepResult::Skipped { output: sample_output() });
        steps.insert("b".to_string(), StepResult::Skipped { output: sample_output() });
        let report = RunReport {
            run_id: uuid::Uuid::new_v4(),
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
            steps,
        };
        assert!(report.all_skipped());
    }

    // --- CancelToken ---

    #[tokio::test]
    async fn cancel_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_token_resolves_after_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        token.cancel();
        assert!(handle.await.unwrap());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_before_wait_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        // Must not hang.
        token.cancelled().await;
    }
}
