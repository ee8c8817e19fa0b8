//! Decision routing.
//!
//! A decision step reports its outcome as a tagged value in its output
//! map. Downstream consumers interpret that tag through an explicit
//! routing table (decision tag -> step-name subset) instead of branching
//! ad hoc, so the execution graph stays acyclic and statically
//! analyzable.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::workflow::types::{StepResult, Workflow};

/// Output key under which a decision step records its outcome.
pub const DECISION_KEY: &str = "decision";

/// Read the decision tag from a step result, if one was recorded.
pub fn decision_of(result: &StepResult) -> Option<&str> {
    result.output.get(DECISION_KEY).and_then(|v| v.as_str())
}

/// Static mapping from decision tags to the subset of steps each one
/// enables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingTable {
    routes: BTreeMap<String, BTreeSet<String>>,
}

impl RoutingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route from a decision tag to a set of step names.
    pub fn route<I, S>(mut self, decision: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes
            .entry(decision.into())
            .or_default()
            .extend(steps.into_iter().map(Into::into));
        self
    }

    /// Check that every routed step exists in the workflow.
    pub fn validate_against(&self, workflow: &Workflow) -> Result<()> {
        for (decision, steps) in &self.routes {
            for step in steps {
                if workflow.get_step(step).is_none() {
                    return Err(Error::InvalidRoute {
                        decision: decision.clone(),
                        step: step.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolve a decision tag to the steps it enables.
    pub fn resolve(&self, decision: &str) -> Option<&BTreeSet<String>> {
        self.routes.get(decision)
    }

    /// Resolve the decision recorded in a step result.
    pub fn resolve_result(&self, result: &StepResult) -> Option<&BTreeSet<String>> {
        decision_of(result).and_then(|d| self.resolve(d))
    }

    /// All known decision tags, sorted.
    pub fn decisions(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}
