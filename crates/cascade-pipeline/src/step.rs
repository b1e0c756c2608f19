//! Step definitions: one named unit of pipeline work.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One input whose content identity participates in a step's trigger
/// fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerInput {
    /// A raw file; fingerprinted by hashing its bytes at read time.
    File(PathBuf),
    /// A non-owning back-reference to another step's output, by step name.
    /// Fingerprinted as that step's current output digest.
    StepOutput(String),
}

/// A named unit of work: a shell command, the directory it runs in, the
/// inputs that trigger it, the environment it sees, and the globs naming what
/// it produces.
///
/// The trigger list is ordered; reordering it changes the step's fingerprint.
/// The environment is explicit: the engine never consults the process
/// environment, so secrets must be resolved by the caller before the step is
/// constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub command: String,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub triggers: Vec<TriggerInput>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub output_spec: Vec<String>,
}

impl Step {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            working_dir: working_dir.into(),
            triggers: Vec::new(),
            environment: HashMap::new(),
            output_spec: Vec::new(),
        }
    }

    /// Trigger on the content of a raw file.
    pub fn trigger_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.triggers.push(TriggerInput::File(path.into()));
        self
    }

    /// Trigger on another step's output changing.
    pub fn trigger_output(mut self, step_name: impl Into<String>) -> Self {
        self.triggers.push(TriggerInput::StepOutput(step_name.into()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Declare a glob (relative to the working directory) naming produced
    /// files.
    pub fn output_glob(mut self, pattern: impl Into<String>) -> Self {
        self.output_spec.push(pattern.into());
        self
    }

    /// Names of the steps this one depends on, in trigger order, deduplicated.
    pub fn upstream_names(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.triggers
            .iter()
            .filter_map(|t| match t {
                TriggerInput::StepOutput(name) => Some(name.as_str()),
                TriggerInput::File(_) => None,
            })
            .filter(|name| seen.insert(*name))
            .collect()
    }
}
