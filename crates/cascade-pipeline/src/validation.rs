//! Pipeline validation: lint rules and diagnostics.
//!
//! Structural errors (duplicate names, unknown references, cycles) are caught
//! by [`PipelineGraph::build`]; the rules here check the semantic details a
//! well-formed graph can still get wrong. Call [`validate`] for advisory
//! diagnostics or [`validate_or_raise`] to fail on the first `Error`-severity
//! issue.

use crate::graph::PipelineGraph;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub step: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct AbsoluteWorkingDirRule;
impl LintRule for AbsoluteWorkingDirRule {
    fn name(&self) -> &str {
        "absolute_working_dir"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .execution_order()
            .filter(|s| !s.working_dir.is_absolute())
            .map(|s| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!(
                    "Step '{}' has relative working directory '{}'",
                    s.name,
                    s.working_dir.display()
                ),
                step: Some(s.name.clone()),
            })
            .collect()
    }
}

struct NonEmptyCommandRule;
impl LintRule for NonEmptyCommandRule {
    fn name(&self) -> &str {
        "non_empty_command"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .execution_order()
            .filter(|s| s.command.trim().is_empty())
            .map(|s| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Step '{}' has an empty command", s.name),
                step: Some(s.name.clone()),
            })
            .collect()
    }
}

/// Two steps with no dependency path between them may execute concurrently;
/// if they share a working directory the executor will fail one of them with
/// `WorkingDirConflict` at run time. Warn about it up front.
struct SharedWorkingDirRule;
impl LintRule for SharedWorkingDirRule {
    fn name(&self) -> &str {
        "shared_working_dir"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let steps: Vec<_> = graph.execution_order().collect();
        let mut diags = Vec::new();
        for (i, a) in steps.iter().enumerate() {
            for b in steps.iter().skip(i + 1) {
                if a.working_dir == b.working_dir
                    && !graph.depends_transitively(&a.name, &b.name)
                    && !graph.depends_transitively(&b.name, &a.name)
                {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Warning,
                        message: format!(
                            "Independent steps '{}' and '{}' share working directory '{}' and may conflict at run time",
                            a.name,
                            b.name,
                            a.working_dir.display()
                        ),
                        step: Some(a.name.clone()),
                    });
                }
            }
        }
        diags
    }
}

struct MissingOutputSpecRule;
impl LintRule for MissingOutputSpecRule {
    fn name(&self) -> &str {
        "missing_output_spec"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .execution_order()
            .filter(|s| s.output_spec.is_empty() && !graph.dependents(&s.name).is_empty())
            .map(|s| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!(
                    "Step '{}' is referenced by {} but declares no output spec; dependents will only observe an empty output",
                    s.name,
                    graph
                        .dependents(&s.name)
                        .iter()
                        .map(|d| format!("'{d}'"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                step: Some(s.name.clone()),
            })
            .collect()
    }
}

struct TriggerlessStepRule;
impl LintRule for TriggerlessStepRule {
    fn name(&self) -> &str {
        "triggerless_step"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .execution_order()
            .filter(|s| s.triggers.is_empty())
            .map(|s| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Info,
                message: format!(
                    "Step '{}' has no triggers: it will run once and then always be skipped",
                    s.name
                ),
                step: Some(s.name.clone()),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(graph: &PipelineGraph) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(AbsoluteWorkingDirRule),
        Box::new(NonEmptyCommandRule),
        Box::new(SharedWorkingDirRule),
        Box::new(MissingOutputSpecRule),
        Box::new(TriggerlessStepRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(graph: &PipelineGraph) -> cascade_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(cascade_types::CascadeError::ValidationError(
            messages.join("; "),
        ));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
