//! Pipeline graph construction and dependency ordering.
//!
//! Edges are derived from trigger back-references: a step that triggers on
//! another step's output depends on it. Construction fails fast on duplicate
//! names, references to unknown steps, and cycles, so nothing executes
//! against a malformed pipeline.

use std::collections::HashMap;

use cascade_types::{CascadeError, Result};

use crate::step::Step;

/// A validated, acyclic set of steps with a stable execution order.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
    /// Upstream step indices per step, deduplicated, in trigger order.
    dependencies: Vec<Vec<usize>>,
    /// Downstream step indices per step, in declaration order.
    dependents: Vec<Vec<usize>>,
    /// Topological order over `steps`, ties broken by declaration order so
    /// repeated calls observe the same sequence.
    order: Vec<usize>,
}

impl PipelineGraph {
    /// Build a graph from steps, deriving edges from trigger back-references.
    pub fn build(steps: Vec<Step>) -> Result<Self> {
        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.name.clone(), i).is_some() {
                return Err(CascadeError::DuplicateStepName {
                    name: step.name.clone(),
                });
            }
        }

        let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for upstream in step.upstream_names() {
                let &j = index.get(upstream).ok_or_else(|| {
                    CascadeError::UnknownTriggerTarget {
                        step: step.name.clone(),
                        target: upstream.to_string(),
                    }
                })?;
                dependencies[i].push(j);
                dependents[j].push(i);
            }
        }

        let order = topological_order(&steps, &dependencies, &dependents)?;

        Ok(Self {
            steps,
            index,
            dependencies,
            dependents,
            order,
        })
    }

    /// Steps in dependency order. Stable across repeated calls.
    pub fn execution_order(&self) -> impl Iterator<Item = &Step> {
        self.order.iter().map(|&i| &self.steps[i])
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    /// Names of the steps `name` directly depends on.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        match self.index.get(name) {
            Some(&i) => self.dependencies[i]
                .iter()
                .map(|&j| self.steps[j].name.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Names of the steps that directly depend on `name`.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        match self.index.get(name) {
            Some(&i) => self.dependents[i]
                .iter()
                .map(|&j| self.steps[j].name.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// True when a dependency path (of any length) leads from `from` to `to`.
    pub fn depends_transitively(&self, from: &str, to: &str) -> bool {
        let (Some(&from_i), Some(&to_i)) = (self.index.get(from), self.index.get(to)) else {
            return false;
        };
        let mut stack = vec![from_i];
        let mut visited = vec![false; self.steps.len()];
        while let Some(i) = stack.pop() {
            if i == to_i {
                return true;
            }
            if std::mem::replace(&mut visited[i], true) {
                continue;
            }
            stack.extend(self.dependencies[i].iter().copied());
        }
        false
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Kahn's algorithm with a declaration-order tie-break.
fn topological_order(
    steps: &[Step],
    dependencies: &[Vec<usize>],
    dependents: &[Vec<usize>],
) -> Result<Vec<usize>> {
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &j in &dependents[i] {
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    if order.len() < steps.len() {
        let mut involved: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d > 0)
            .map(|(i, _)| steps[i].name.clone())
            .collect();
        involved.sort();
        return Err(CascadeError::CycleDetected { involved });
    }
    Ok(order)
}
