//! Change-detection pipeline engine: graph construction, fingerprinting,
//! execution, and run-record stores.
//!
//! This crate implements the core Cascade runner: steps with ordered trigger
//! inputs, a DAG derived from output back-references, content-fingerprint
//! gating against a durable record store, parallel execution of independent
//! steps, and a broadcast event stream for observers.

pub mod events;
pub mod executor;
pub mod fingerprint;
pub mod graph;
pub mod step;
pub mod store;
pub mod validation;

pub use events::{EventEmitter, PipelineEvent};
pub use executor::{Executor, ExecutorConfig};
pub use fingerprint::{fingerprint, OutputResolver};
pub use graph::PipelineGraph;
pub use step::{Step, TriggerInput};
pub use store::{JsonRecordStore, MemoryRecordStore, RunRecordStore, StepLock};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
