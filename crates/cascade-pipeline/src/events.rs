//! Pipeline event stream for observability.
//!
//! The executor emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`]
//! channel so that external observers (loggers, progress UIs, metrics
//! collectors) can follow run progress without coupling to engine internals.

use serde::{Deserialize, Serialize};

/// Events emitted during pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    RunStarted {
        run_id: uuid::Uuid,
        step_count: usize,
    },
    RunCompleted {
        run_id: uuid::Uuid,
        executed: usize,
        skipped: usize,
        failed: usize,
        duration_ms: u64,
    },
    StepStarted {
        step: String,
    },
    /// The step's trigger fingerprint matched the last successful record.
    StepSkipped {
        step: String,
        fingerprint: String,
    },
    StepExecuted {
        step: String,
        duration_ms: u64,
    },
    StepFailed {
        step: String,
        error: String,
    },
    StepBlocked {
        step: String,
        upstream: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
