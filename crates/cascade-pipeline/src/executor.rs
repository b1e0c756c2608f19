//! Pipeline executor: dependency-ordered, fingerprint-gated step execution.
//!
//! One tokio task per step. Dependent steps suspend on watch channels until
//! every upstream output is finalized; independent steps run in parallel.
//! Each step holds its per-step store lock across the whole compare/execute/
//! record sequence, which is what guarantees at-most-one execution per
//! fingerprint even when several pipeline invocations share one durable
//! store.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cascade_exec::{collect_artifacts, CommandRunner};
use cascade_types::{
    CancelToken, CascadeError, Fingerprint, Result, RunRecord, RunReport, RunStatus, StepOutput,
    StepResult,
};
use tokio::sync::watch;

use crate::events::{EventEmitter, PipelineEvent};
use crate::fingerprint;
use crate::graph::PipelineGraph;
use crate::step::Step;
use crate::store::RunRecordStore;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Knobs for a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Per-command timeout. `None` lets commands run indefinitely.
    pub command_timeout: Option<Duration>,
}

/// The pipeline executor. Owns the command runner and the event stream.
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    config: ExecutorConfig,
    events: EventEmitter,
}

// ---------------------------------------------------------------------------
// Internal signalling
// ---------------------------------------------------------------------------

/// What a finished step publishes to its dependents.
#[derive(Clone)]
enum Signal {
    /// Executed or skipped; either way this output is what downstream
    /// fingerprints observe.
    Success { output: StepOutput },
    /// Failed, blocked, or cancelled: dependents must not run.
    Failure,
}

type SignalRx = watch::Receiver<Option<Signal>>;
type SignalTx = watch::Sender<Option<Signal>>;

/// Working directories currently claimed by an executing step.
type WorkdirSet = Arc<std::sync::Mutex<HashSet<PathBuf>>>;

/// Exclusive claim on a working directory for the duration of one command.
#[derive(Debug)]
struct WorkdirClaim {
    set: WorkdirSet,
    dir: PathBuf,
}

impl WorkdirClaim {
    fn acquire(set: &WorkdirSet, step: &str, dir: PathBuf) -> Result<Self> {
        let mut claimed = set.lock().expect("workdir set poisoned");
        if !claimed.insert(dir.clone()) {
            return Err(CascadeError::WorkingDirConflict {
                step: step.to_string(),
                dir,
            });
        }
        Ok(Self {
            set: set.clone(),
            dir,
        })
    }
}

impl Drop for WorkdirClaim {
    fn drop(&mut self) {
        if let Ok(mut claimed) = self.set.lock() {
            claimed.remove(&self.dir);
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

impl Executor {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            config: ExecutorConfig::default(),
            events: EventEmitter::default(),
        }
    }

    pub fn with_config(runner: Arc<dyn CommandRunner>, config: ExecutorConfig) -> Self {
        Self {
            runner,
            config,
            events: EventEmitter::default(),
        }
    }

    /// Subscribe point for run progress events.
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Run the pipeline to completion (successes, skips, and failures all
    /// land in the report; sibling steps are never aborted by one failure).
    pub async fn run(
        &self,
        graph: &PipelineGraph,
        store: Arc<dyn RunRecordStore>,
    ) -> Result<RunReport> {
        self.run_with_cancel(graph, store, CancelToken::new()).await
    }

    /// Like [`run`](Self::run), with cooperative cancellation: in-flight
    /// commands are terminated and their run records left at the prior state.
    pub async fn run_with_cancel(
        &self,
        graph: &PipelineGraph,
        store: Arc<dyn RunRecordStore>,
        cancel: CancelToken,
    ) -> Result<RunReport> {
        let run_id = uuid::Uuid::new_v4();
        let started_at = chrono::Utc::now();
        let t0 = tokio::time::Instant::now();

        tracing::info!(%run_id, steps = graph.len(), "Pipeline run starting");
        self.events.emit(PipelineEvent::RunStarted {
            run_id,
            step_count: graph.len(),
        });

        // One watch channel per step; dependents wait on their upstreams'
        // receivers. Created up front so receivers exist before any task
        // starts.
        let mut txs: HashMap<String, SignalTx> = HashMap::new();
        let mut rxs: HashMap<String, SignalRx> = HashMap::new();
        for step in graph.execution_order() {
            let (tx, rx) = watch::channel(None);
            txs.insert(step.name.clone(), tx);
            rxs.insert(step.name.clone(), rx);
        }

        let workdirs: WorkdirSet = Arc::new(std::sync::Mutex::new(HashSet::new()));

        let mut handles = Vec::with_capacity(graph.len());
        for step in graph.execution_order() {
            let upstreams: Vec<(String, SignalRx)> = step
                .upstream_names()
                .into_iter()
                .map(|name| (name.to_string(), rxs[name].clone()))
                .collect();
            let tx = txs.remove(&step.name).expect("channel created above");

            let ctx = StepContext {
                step: step.clone(),
                runner: self.runner.clone(),
                store: store.clone(),
                config: self.config.clone(),
                cancel: cancel.clone(),
                workdirs: workdirs.clone(),
                events: self.events.clone(),
            };
            let name = step.name.clone();
            handles.push((
                name,
                tokio::spawn(async move {
                    let result = ctx.run_step(upstreams).await;
                    let signal = match &result {
                        StepResult::Executed { output, .. } | StepResult::Skipped { output } => {
                            Signal::Success {
                                output: output.clone(),
                            }
                        }
                        _ => Signal::Failure,
                    };
                    let _ = tx.send(Some(signal));
                    result
                }),
            ));
        }

        let mut steps = HashMap::with_capacity(handles.len());
        for (name, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => StepResult::Failed {
                    error: format!("step task panicked: {e}"),
                    exit_code: None,
                },
            };
            steps.insert(name, result);
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: chrono::Utc::now(),
            steps,
        };

        tracing::info!(
            %run_id,
            executed = report.executed_count(),
            skipped = report.skipped_count(),
            failed = report.failed_count(),
            "Pipeline run finished"
        );
        self.events.emit(PipelineEvent::RunCompleted {
            run_id,
            executed: report.executed_count(),
            skipped: report.skipped_count(),
            failed: report.failed_count(),
            duration_ms: t0.elapsed().as_millis() as u64,
        });

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Per-step execution
// ---------------------------------------------------------------------------

/// Everything one step task needs, owned so the task is `'static`.
struct StepContext {
    step: Step,
    runner: Arc<dyn CommandRunner>,
    store: Arc<dyn RunRecordStore>,
    config: ExecutorConfig,
    cancel: CancelToken,
    workdirs: WorkdirSet,
    events: EventEmitter,
}

impl StepContext {
    async fn run_step(&self, upstreams: Vec<(String, SignalRx)>) -> StepResult {
        let name = self.step.name.as_str();

        // 1. Wait for every upstream output to be finalized. This is a
        //    suspension point, not a poll loop.
        let mut upstream_outputs: HashMap<String, Fingerprint> = HashMap::new();
        for (upstream, mut rx) in upstreams {
            let signal = loop {
                let current = rx.borrow().clone();
                if let Some(signal) = current {
                    break signal;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return StepResult::Cancelled,
                    changed = rx.changed() => {
                        // A dropped sender means the upstream task died
                        // without signalling; treat it as a failure.
                        if changed.is_err() && rx.borrow().is_none() {
                            break Signal::Failure;
                        }
                    }
                }
            };
            match signal {
                Signal::Success { output } => {
                    upstream_outputs.insert(upstream, output.digest);
                }
                Signal::Failure => {
                    let err = CascadeError::UpstreamFailed {
                        step: name.to_string(),
                        upstream: upstream.clone(),
                    };
                    tracing::warn!(step = name, error = %err, "Blocked by failed upstream");
                    self.events.emit(PipelineEvent::StepBlocked {
                        step: name.to_string(),
                        upstream: upstream.clone(),
                    });
                    return StepResult::Blocked { upstream };
                }
            }
        }
        if self.cancel.is_cancelled() {
            return StepResult::Cancelled;
        }

        // 2. Hold the per-step store lock across compare, execute, and
        //    record: a concurrent invocation of the same pipeline waits here
        //    and then observes the updated record instead of re-executing.
        let _lock = match self.store.lock(name).await {
            Ok(lock) => lock,
            Err(e) => return self.fail(e.to_string(), None),
        };

        // 3. Resolve the current trigger fingerprint.
        let current = match fingerprint::fingerprint(&self.step.triggers, &upstream_outputs).await
        {
            Ok(fp) => fp,
            Err(e) => return self.fail(e.to_string(), None),
        };

        // 4. Compare against the last attempt. Unchanged + succeeded means
        //    skip and republish the recorded output downstream.
        let prior = match self.store.get(name).await {
            Ok(prior) => prior,
            Err(e) => return self.fail(e.to_string(), None),
        };
        if let Some(record) = &prior {
            if record.last_status == RunStatus::Succeeded
                && record.last_trigger_fingerprint == current
            {
                if let Some(output) = record.last_output.clone() {
                    tracing::info!(
                        step = name,
                        fingerprint = current.short(),
                        "Fingerprint unchanged, skipping"
                    );
                    self.events.emit(PipelineEvent::StepSkipped {
                        step: name.to_string(),
                        fingerprint: current.to_string(),
                    });
                    return StepResult::Skipped { output };
                }
            }
        }
        let prior_output = prior.and_then(|r| r.last_output);

        // 5. Prepare the working directory and claim it for exclusive use.
        if let Err(e) = tokio::fs::create_dir_all(&self.step.working_dir).await {
            return self.fail(
                format!(
                    "cannot create working directory '{}': {e}",
                    self.step.working_dir.display()
                ),
                None,
            );
        }
        let canonical = tokio::fs::canonicalize(&self.step.working_dir)
            .await
            .unwrap_or_else(|_| self.step.working_dir.clone());
        let _claim = match WorkdirClaim::acquire(&self.workdirs, name, canonical) {
            Ok(claim) => claim,
            Err(e) => return self.fail(e.to_string(), None),
        };

        // 6. Execute.
        tracing::info!(step = name, fingerprint = current.short(), "Executing");
        self.events.emit(PipelineEvent::StepStarted {
            step: name.to_string(),
        });
        let exec = tokio::select! {
            _ = self.cancel.cancelled() => {
                // Dropping the execute future kills the child process; the
                // run record deliberately stays at its prior state.
                tracing::warn!(step = name, "Cancelled mid-execution");
                return StepResult::Cancelled;
            }
            exec = self.runner.execute(
                &self.step.command,
                &self.step.working_dir,
                &self.step.environment,
                self.config.command_timeout,
            ) => exec,
        };

        let exec = match exec {
            Ok(exec) => exec,
            Err(e) => {
                let error = format!("command runner error: {e}");
                if let Err(e) = self
                    .store
                    .put(name, RunRecord::failed(current, prior_output))
                    .await
                {
                    tracing::error!(step = name, error = %e, "Failed to persist run record");
                }
                return self.fail(error, None);
            }
        };

        if exec.exit_code != 0 || exec.timed_out {
            let error = if exec.timed_out {
                exec.stderr.clone()
            } else {
                let err = CascadeError::StepFailed {
                    step: name.to_string(),
                    exit_code: exec.exit_code,
                };
                let stderr = exec.stderr.trim();
                if stderr.is_empty() {
                    err.to_string()
                } else {
                    format!("{err}: {stderr}")
                }
            };
            if let Err(e) = self
                .store
                .put(name, RunRecord::failed(current, prior_output))
                .await
            {
                tracing::error!(step = name, error = %e, "Failed to persist run record");
            }
            return self.fail(error, Some(exec.exit_code));
        }

        // 7. Success: collect the produced artifact, record it, publish it.
        let output = match collect_artifacts(&self.step.working_dir, &self.step.output_spec).await
        {
            Ok(output) => output,
            Err(e) => {
                if let Err(e) = self
                    .store
                    .put(name, RunRecord::failed(current.clone(), prior_output))
                    .await
                {
                    tracing::error!(step = name, error = %e, "Failed to persist run record");
                }
                return self.fail(format!("collecting outputs failed: {e}"), None);
            }
        };
        if let Err(e) = self
            .store
            .put(name, RunRecord::succeeded(current, output.clone()))
            .await
        {
            return self.fail(format!("persisting run record failed: {e}"), None);
        }

        tracing::info!(
            step = name,
            output = output.digest.short(),
            files = output.files.len(),
            duration_ms = exec.duration_ms,
            "Step executed"
        );
        self.events.emit(PipelineEvent::StepExecuted {
            step: name.to_string(),
            duration_ms: exec.duration_ms,
        });
        StepResult::Executed {
            output,
            stdout: exec.stdout,
            duration_ms: exec.duration_ms,
        }
    }

    fn fail(&self, error: String, exit_code: Option<i32>) -> StepResult {
        tracing::warn!(step = %self.step.name, error = %error, "Step failed");
        self.events.emit(PipelineEvent::StepFailed {
            step: self.step.name.clone(),
            error: error.clone(),
        });
        StepResult::Failed { error, exit_code }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
