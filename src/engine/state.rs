//! Run state and snapshot types.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::workflow::types::StepResult;

/// Serializable snapshot of a run.
///
/// The `errors` map is excluded by design: failure causes may not be
/// serializable, and failed steps return to pending on resume anyway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Name of the workflow this snapshot belongs to.
    pub workflow: String,

    pub completed: BTreeSet<String>,
    pub pending: BTreeSet<String>,
    pub running: BTreeSet<String>,
    pub results: BTreeMap<String, StepResult>,

    /// Step names in completion order.
    #[serde(default)]
    pub history: Vec<String>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// Mutable state of one workflow run.
///
/// The completed/pending/running sets are mutually exclusive; their union,
/// together with the names recorded in `errors`, covers the full step-name
/// set at every point after validation.
#[derive(Debug)]
pub struct WorkflowState {
    /// Unique ID of this run.
    pub run_id: String,

    /// Steps whose outputs are available to dependents.
    pub completed: BTreeSet<String>,

    /// Steps not yet dispatched.
    pub pending: BTreeSet<String>,

    /// Steps dispatched in the current batch.
    pub running: BTreeSet<String>,

    /// Results of completed steps.
    pub results: BTreeMap<String, StepResult>,

    /// Terminal failure causes, keyed by step name. A step recorded here
    /// never enters `completed` and is never re-dispatched.
    pub errors: BTreeMap<String, Error>,

    /// Step names in completion order (cached completions included).
    pub history: Vec<String>,

    /// When the run started.
    pub started_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Create a fresh state with every step pending.
    pub fn fresh(step_names: BTreeSet<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            completed: BTreeSet::new(),
            pending: step_names,
            running: BTreeSet::new(),
            results: BTreeMap::new(),
            errors: BTreeMap::new(),
            history: Vec::new(),
            started_at: None,
        }
    }

    /// Rebuild state from a snapshot.
    ///
    /// Steps the snapshot marks completed keep their stored outputs and
    /// are excluded from re-execution; everything else (including steps
    /// the snapshot recorded as running) returns to pending. Snapshot
    /// entries for steps no longer in the workflow are dropped.
    pub fn resume(snapshot: Snapshot, step_names: &BTreeSet<String>) -> Self {
        let completed: BTreeSet<String> = snapshot
            .completed
            .into_iter()
            .filter(|name| step_names.contains(name))
            .collect();
        let pending: BTreeSet<String> =
            step_names.difference(&completed).cloned().collect();
        let results: BTreeMap<String, StepResult> = snapshot
            .results
            .into_iter()
            .filter(|(name, _)| completed.contains(name))
            .collect();

        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            completed,
            pending,
            running: BTreeSet::new(),
            results,
            errors: BTreeMap::new(),
            history: snapshot.history,
            started_at: snapshot.started_at,
        }
    }

    /// Move a step from pending to running.
    pub(crate) fn mark_running(&mut self, name: &str) {
        if self.pending.remove(name) {
            self.running.insert(name.to_string());
        }
    }

    /// Record a terminal success: running -> completed, output retained.
    pub(crate) fn record_success(&mut self, name: &str, result: StepResult) {
        self.running.remove(name);
        self.completed.insert(name.to_string());
        self.results.insert(name.to_string(), result);
        self.history.push(name.to_string());
    }

    /// Record a terminal failure: removed from running, cause retained.
    /// The step never enters `completed`.
    pub(crate) fn record_failure(&mut self, name: &str, error: Error) {
        self.running.remove(name);
        self.errors.insert(name.to_string(), error);
    }

    /// Whether the run finished with every step completed.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.pending.is_empty() && self.running.is_empty()
    }

    /// Whether the run stopped with steps that can never execute, because
    /// a failed dependency left them permanently blocked.
    pub fn is_stuck(&self) -> bool {
        self.running.is_empty() && !self.pending.is_empty()
    }

    /// Produce the serializable snapshot of this state (errors excluded).
    pub fn snapshot(&self, workflow: &str) -> Snapshot {
        Snapshot {
            workflow: workflow.to_string(),
            completed: self.completed.clone(),
            pending: self.pending.clone(),
            running: self.running.clone(),
            results: self.results.clone(),
            history: self.history.clone(),
            started_at: self.started_at,
        }
    }
}
