//! Trigger fingerprint resolution.
//!
//! A step's trigger fingerprint is the combined digest of its inputs in
//! declared order: raw files are hashed at read time, step references resolve
//! to the upstream step's current output digest. Because the combination is
//! order-sensitive, reordering a trigger list forces re-execution just like a
//! content change would.

use std::collections::HashMap;

use cascade_types::{CascadeError, Fingerprint, Result};

use crate::step::TriggerInput;

/// Source of upstream output digests during fingerprinting.
///
/// The executor passes the outputs finalized earlier in the current run; a
/// standalone caller can pass a snapshot derived from a record store.
pub trait OutputResolver: Send + Sync {
    fn output_digest(&self, step: &str) -> Option<Fingerprint>;
}

impl OutputResolver for HashMap<String, Fingerprint> {
    fn output_digest(&self, step: &str) -> Option<Fingerprint> {
        self.get(step).cloned()
    }
}

/// Resolve the current fingerprint of an ordered trigger list.
///
/// Fails with `InputUnavailable` when a file trigger cannot be read and with
/// `UpstreamNotYetRun` when a step reference has no resolvable output.
pub async fn fingerprint(
    triggers: &[TriggerInput],
    resolver: &dyn OutputResolver,
) -> Result<Fingerprint> {
    let mut parts = Vec::with_capacity(triggers.len());
    for trigger in triggers {
        match trigger {
            TriggerInput::File(path) => {
                parts.push(cascade_exec::hash_file(path).await?);
            }
            TriggerInput::StepOutput(name) => {
                let digest = resolver.output_digest(name).ok_or_else(|| {
                    CascadeError::UpstreamNotYetRun {
                        upstream: name.clone(),
                    }
                })?;
                parts.push(digest);
            }
        }
    }
    Ok(Fingerprint::combine(parts.iter()))
}
