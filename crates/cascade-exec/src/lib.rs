//! Command execution and artifact collection collaborators for the Cascade engine.
//!
//! The pipeline core treats both as opaque primitives: `CommandRunner` runs a
//! shell command in a working directory with an explicit environment and
//! reports stdout/exit status; `artifacts` evaluates output-spec globs and
//! computes content fingerprints of what a step produced.

pub mod artifacts;
pub mod runner;

pub use artifacts::{collect_artifacts, hash_file};
pub use runner::{CommandRunner, ExecResult, LocalCommandRunner};
