//! Batch-synchronous workflow driver.
//!
//! The driver loop is single-threaded: it computes the set of ready
//! steps, dispatches up to `max_workers` of them concurrently, and blocks
//! until every dispatched step reaches a terminal outcome before merging
//! results and computing the next batch. Results merge only at batch
//! boundaries, so a dependent step can never start in the same batch as
//! its dependency.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn, Span};

use super::runner::{execute_step, RunContext, StepOutcome};
use super::state::WorkflowState;
use crate::cache::StepCache;
use crate::error::{Error, Result};
use crate::hooks::{HookContext, AFTER_WORKFLOW, BEFORE_WORKFLOW};
use crate::persistence::SnapshotStore;
use crate::store::SharedStore;
use crate::workflow::types::{DataMap, Step, StepResult, Workflow};
use crate::workflow::validator::validate;

/// Drives workflow runs.
pub struct Scheduler;

impl Scheduler {
    /// Create a new scheduler.
    pub fn new() -> Self {
        Self
    }

    /// Run a workflow to a terminal state.
    ///
    /// Returns `Err` only for pre-execution validation failures and hook
    /// failures; step-level failures are recorded in the returned state's
    /// `errors` map. Callers determine success by checking that `errors`
    /// is empty and both `pending` and `running` are empty (or via
    /// [`WorkflowState::is_success`]).
    #[instrument(
        name = "workflow.run",
        skip(self, workflow, inputs),
        fields(workflow = %workflow.name, run_id = tracing::field::Empty)
    )]
    pub async fn run(&self, workflow: &Workflow, inputs: DataMap) -> Result<WorkflowState> {
        validate(workflow)?;

        let step_names = workflow.step_names();
        let persistence = SnapshotStore::new(workflow.settings.snapshot_path.clone());
        let mut state = match persistence.load() {
            Some(snapshot) if snapshot.workflow == workflow.name => {
                info!(
                    "Resuming workflow '{}' with {} completed step(s)",
                    workflow.name,
                    snapshot.completed.len()
                );
                WorkflowState::resume(snapshot, &step_names)
            }
            Some(snapshot) => {
                warn!(
                    "Snapshot belongs to workflow '{}', starting fresh",
                    snapshot.workflow
                );
                WorkflowState::fresh(step_names)
            }
            None => WorkflowState::fresh(step_names),
        };
        if state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        Span::current().record("run_id", state.run_id.as_str());

        let rcx = Arc::new(RunContext {
            workflow: workflow.name.clone(),
            run_id: state.run_id.clone(),
            shared: Arc::new(SharedStore::new()),
            cache: Arc::new(StepCache::new(workflow.settings.cache_dir.clone())),
            hooks: workflow.hooks.clone(),
            middleware: workflow.middleware.clone(),
            retry_base: Duration::from_millis(workflow.settings.retry_base_ms),
            retry_cap: Duration::from_millis(workflow.settings.retry_cap_ms),
        });

        info!(
            "Starting run {} of workflow '{}' ({} step(s))",
            state.run_id,
            workflow.name,
            workflow.steps.len()
        );

        let before_ctx = HookContext {
            event: BEFORE_WORKFLOW,
            workflow: &workflow.name,
            run_id: &state.run_id,
            step: None,
            shared: &rcx.shared,
            outcome: None,
        };
        rcx.hooks.fire(BEFORE_WORKFLOW, &before_ctx).await?;

        while !state.pending.is_empty() || !state.running.is_empty() {
            // Ready = pending steps whose every dependency completed.
            // BTreeSet iteration gives the deterministic lexicographic
            // dispatch order.
            let ready = state.pending.iter().filter(|name| {
                workflow.steps[*name]
                    .depends_on
                    .iter()
                    .all(|dep| state.completed.contains(dep))
            });

            let slots = if workflow.settings.max_workers > 0 {
                workflow.settings.max_workers.saturating_sub(state.running.len())
            } else {
                usize::MAX
            };
            let to_start: Vec<String> = ready.take(slots).cloned().collect();

            if to_start.is_empty() {
                // Failed dependencies left the remaining pending steps
                // permanently blocked. Surface the partial state instead
                // of hanging.
                warn!(
                    "Run {} stuck with {} pending step(s) blocked by failed dependencies",
                    state.run_id,
                    state.pending.len()
                );
                break;
            }

            debug!("Dispatching batch: {:?}", to_start);
            let mut batch = JoinSet::new();
            for name in &to_start {
                state.mark_running(name);
                let step = workflow.steps[name].clone();
                let assembled = assemble_inputs(&step, &inputs, &state.results);
                batch.spawn(execute_step(step, assembled, rcx.clone()));
            }

            // Block until every dispatched step reaches a terminal
            // outcome, then merge. Dispatched work is never cancelled,
            // even when a hook failure will abort the run afterwards.
            let mut fatal: Option<Error> = None;
            while let Some(joined) = batch.join_next().await {
                let outcome: StepOutcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Step task aborted: {}", e);
                        fatal.get_or_insert(Error::Execution(format!("step task aborted: {e}")));
                        continue;
                    }
                };

                match outcome.result {
                    Some(Ok(result)) => {
                        if outcome.from_cache {
                            debug!("Step '{}' served from cache", outcome.step);
                        }
                        info!("Step '{}' completed", outcome.step);
                        state.record_success(&outcome.step, result);
                    }
                    Some(Err(e)) => {
                        error!("Step '{}' failed: {}", outcome.step, e);
                        state.record_failure(&outcome.step, e);
                    }
                    // A "before" hook failed and no attempt ran; the hook
                    // error below aborts the run.
                    None => {}
                }

                if let Some(e) = outcome.hook_error {
                    fatal.get_or_insert(e);
                }
            }

            if let Some(e) = fatal {
                return Err(e);
            }
        }

        let after_ctx = HookContext {
            event: AFTER_WORKFLOW,
            workflow: &workflow.name,
            run_id: &state.run_id,
            step: None,
            shared: &rcx.shared,
            outcome: None,
        };
        rcx.hooks.fire(AFTER_WORKFLOW, &after_ctx).await?;

        if let Err(e) = persistence.save(&state.snapshot(&workflow.name)) {
            // A failed save must not erase real progress; the in-memory
            // state is still returned.
            warn!("Failed to persist snapshot for run {}: {}", state.run_id, e);
        }

        info!(
            "Run {} finished: {} completed, {} failed, {} blocked",
            state.run_id,
            state.completed.len(),
            state.errors.len(),
            state.pending.len()
        );

        Ok(state)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a workflow with the default scheduler.
pub async fn run(workflow: &Workflow, inputs: DataMap) -> Result<WorkflowState> {
    Scheduler::new().run(workflow, inputs).await
}

/// Assemble a step's inputs: base workflow inputs unioned with the merged
/// outputs of its direct dependencies.
///
/// On key collision, dependency-output values take precedence over base
/// inputs; among dependencies, the lexicographically greatest name wins
/// (they merge in sorted order, last writer wins).
fn assemble_inputs(
    step: &Step,
    base: &DataMap,
    results: &BTreeMap<String, StepResult>,
) -> DataMap {
    let mut assembled = base.clone();
    for dep in &step.depends_on {
        if let Some(result) = results.get(dep) {
            for (key, value) in &result.output {
                assembled.insert(key.clone(), value.clone());
            }
        }
    }
    assembled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::after_step_event;
    use crate::workflow::types::StepContext;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
    use std::sync::Mutex;

    fn ok(name: &str) -> Step {
        Step::from_fn(name, |_| async { Ok(StepResult::empty()) })
    }

    fn base_inputs(pairs: &[(&str, Value)]) -> DataMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_diamond_completes_and_merges_dependency_outputs() {
        let d_inputs = Arc::new(Mutex::new(DataMap::new()));
        let seen = d_inputs.clone();

        let workflow = Workflow::new("diamond")
            .max_workers(4)
            .step(Step::from_fn("a", |_| async {
                Ok(StepResult::of("from_a", json!("root")))
            }))
            .step(
                Step::from_fn("b", |ctx: StepContext| async move {
                    ctx.require("from_a")?;
                    Ok(StepResult::of("from_b", json!(1)))
                })
                .after(["a"]),
            )
            .step(
                Step::from_fn("c", |ctx: StepContext| async move {
                    ctx.require("from_a")?;
                    Ok(StepResult::of("from_c", json!(2)))
                })
                .after(["a"]),
            )
            .step(
                Step::from_fn("d", move |ctx: StepContext| {
                    *seen.lock().unwrap() = ctx.inputs.clone();
                    async { Ok(StepResult::empty()) }
                })
                .after(["b", "c"]),
            );

        let state = run(&workflow, DataMap::new()).await.unwrap();
        assert!(state.is_success());
        assert_eq!(state.completed.len(), 4);

        let inputs = d_inputs.lock().unwrap();
        assert_eq!(inputs.get("from_b"), Some(&json!(1)));
        assert_eq!(inputs.get("from_c"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_any_body_runs() {
        let calls = Arc::new(AtomicU32::new(0));
        let mk = |name: &str, dep: &str| {
            let calls = calls.clone();
            Step::from_fn(name, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(StepResult::empty()) }
            })
            .after([dep])
        };

        let workflow = Workflow::new("cyclic").step(mk("a", "b")).step(mk("b", "a"));

        match run(&workflow, DataMap::new()).await.unwrap_err() {
            Error::CircularDependency { names } => {
                assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_dependency_aborts() {
        let workflow = Workflow::new("broken").step(ok("a").after(["ghost"]));
        let err = run(&workflow, DataMap::new()).await.unwrap_err();
        assert_eq!(err.code(), "MISSING_DEPENDENCY");
    }

    #[tokio::test]
    async fn test_failed_step_blocks_dependents_without_hanging() {
        let workflow = Workflow::new("partial")
            .step(Step::from_fn("a", |_| async {
                Err(Error::Execution("down".to_string()))
            }))
            .step(ok("b").after(["a"]))
            .step(ok("c"));

        let state = run(&workflow, DataMap::new()).await.unwrap();
        assert!(!state.is_success());
        assert!(state.is_stuck());
        assert!(state.completed.contains("c"));
        assert!(state.errors.contains_key("a"));
        assert!(state.pending.contains("b"));
        assert!(state.running.is_empty());
    }

    #[tokio::test]
    async fn test_step_timeout_lands_in_errors() {
        let workflow = Workflow::new("slowpoke").step(
            Step::from_fn("x", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(StepResult::empty())
            })
            .with_timeout(Duration::from_millis(20)),
        );

        let state = run(&workflow, DataMap::new()).await.unwrap();
        match state.errors.get("x").unwrap() {
            Error::StepTimeout { step } => assert_eq!(step, "x"),
            other => panic!("expected StepTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_within_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut settings = crate::workflow::WorkflowSettings::default();
        settings.retry_base_ms = 1;

        let workflow = Workflow::new("retrying").with_settings(settings).step(
            Step::from_fn("flaky", move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(Error::Execution("transient".to_string()))
                    } else {
                        Ok(StepResult::empty())
                    }
                }
            })
            .with_retries(2),
        );

        let state = run(&workflow, DataMap::new()).await.unwrap();
        assert!(state.completed.contains("flaky"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_worker_never_overlaps_independent_steps() {
        let active = Arc::new(AtomicI32::new(0));
        let max_active = Arc::new(AtomicI32::new(0));

        let mk = |name: &str| {
            let active = active.clone();
            let max_active = max_active.clone();
            Step::from_fn(name, move |_| {
                let active = active.clone();
                let max_active = max_active.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(StepResult::empty())
                }
            })
        };

        let workflow = Workflow::new("serial")
            .max_workers(1)
            .step(mk("p"))
            .step(mk("q"));

        let state = run(&workflow, DataMap::new()).await.unwrap();
        assert!(state.is_success());
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unbounded_workers_dispatch_all_ready_steps() {
        let active = Arc::new(AtomicI32::new(0));
        let max_active = Arc::new(AtomicI32::new(0));

        let mut workflow = Workflow::new("wide").max_workers(0);
        for i in 0..6 {
            let active = active.clone();
            let max_active = max_active.clone();
            workflow = workflow.step(Step::from_fn(format!("s{i}"), move |_| {
                let active = active.clone();
                let max_active = max_active.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(StepResult::empty())
                }
            }));
        }

        let state = run(&workflow, DataMap::new()).await.unwrap();
        assert!(state.is_success());
        assert_eq!(max_active.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_cache_skips_body_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let make_workflow = || {
            let counter = calls.clone();
            Workflow::new("memoized")
                .with_cache_dir(dir.path())
                .step(
                    Step::from_fn("expensive", move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async { Ok(StepResult::of("n", json!(99))) }
                    })
                    .with_cache(),
                )
        };

        let inputs = base_inputs(&[("seed", json!(42))]);
        let first = run(&make_workflow(), inputs.clone()).await.unwrap();
        let second = run(&make_workflow(), inputs).await.unwrap();

        assert!(first.is_success());
        assert!(second.is_success());
        // The second run is a cache hit; the step still records as completed.
        assert!(second.completed.contains("expensive"));
        assert_eq!(
            second.results.get("expensive").unwrap().output.get("n"),
            Some(&json!(99))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_differentiates_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let make_workflow = || {
            let counter = calls.clone();
            Workflow::new("memoized")
                .with_cache_dir(dir.path())
                .step(
                    Step::from_fn("expensive", move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async { Ok(StepResult::empty()) }
                    })
                    .with_cache(),
                )
        };

        run(&make_workflow(), base_inputs(&[("seed", json!(1))]))
            .await
            .unwrap();
        run(&make_workflow(), base_inputs(&[("seed", json!(2))]))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_steps() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_path = dir.path().join("run.json");
        let a_calls = Arc::new(AtomicU32::new(0));
        let b_should_fail = Arc::new(AtomicU32::new(1));

        let make_workflow = || {
            let a_counter = a_calls.clone();
            let fail_flag = b_should_fail.clone();
            Workflow::new("resumable")
                .with_snapshot_path(&snapshot_path)
                .step(Step::from_fn("a", move |_| {
                    a_counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(StepResult::of("token", json!("issued"))) }
                }))
                .step(
                    Step::from_fn("b", move |ctx: StepContext| {
                        let fail = fail_flag.load(Ordering::SeqCst) == 1;
                        async move {
                            ctx.require("token")?;
                            if fail {
                                Err(Error::Execution("flaky backend".to_string()))
                            } else {
                                Ok(StepResult::empty())
                            }
                        }
                    })
                    .after(["a"]),
                )
        };

        // First run: a completes, b fails, snapshot lands on disk.
        let first = run(&make_workflow(), DataMap::new()).await.unwrap();
        assert!(first.errors.contains_key("b"));
        assert!(snapshot_path.exists());

        // Second run: a is restored from the snapshot, b sees its stored
        // output and succeeds.
        b_should_fail.store(0, Ordering::SeqCst);
        let second = run(&make_workflow(), DataMap::new()).await.unwrap();
        assert!(second.is_success());
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_workflow_hooks_fire_and_observe_outcomes() {
        let events = Arc::new(Mutex::new(Vec::new()));

        let log = |tag: &'static str, events: &Arc<Mutex<Vec<String>>>| {
            let events = events.clone();
            move |_ctx: &HookContext<'_>| {
                events.lock().unwrap().push(tag.to_string());
                Ok(())
            }
        };

        let seen = events.clone();
        let workflow = Workflow::new("observed")
            .on(BEFORE_WORKFLOW, log("before_workflow", &events))
            .on(AFTER_WORKFLOW, log("after_workflow", &events))
            .on(after_step_event("only"), move |ctx: &HookContext<'_>| {
                let ok = matches!(ctx.outcome, Some(Ok(_)));
                seen.lock().unwrap().push(format!("after_step:{ok}"));
                Ok(())
            })
            .step(ok("only"));

        let state = run(&workflow, DataMap::new()).await.unwrap();
        assert!(state.is_success());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["before_workflow", "after_step:true", "after_workflow"]
        );
    }

    #[tokio::test]
    async fn test_hook_failure_is_workflow_fatal() {
        let workflow = Workflow::new("doomed")
            .on(after_step_event("a"), |_: &HookContext<'_>| {
                Err(Error::Execution("observer down".to_string()))
            })
            .step(ok("a"));

        let err = run(&workflow, DataMap::new()).await.unwrap_err();
        assert_eq!(err.code(), "HOOK_FAILED");
    }

    #[tokio::test]
    async fn test_dependency_outputs_override_base_inputs() {
        let seen = Arc::new(Mutex::new(DataMap::new()));
        let sink = seen.clone();

        let workflow = Workflow::new("override")
            .step(Step::from_fn("producer", |_| async {
                Ok(StepResult::of("mode", json!("from_dependency")))
            }))
            .step(
                Step::from_fn("consumer", move |ctx: StepContext| {
                    *sink.lock().unwrap() = ctx.inputs.clone();
                    async { Ok(StepResult::empty()) }
                })
                .after(["producer"]),
            );

        let state = run(&workflow, base_inputs(&[("mode", json!("from_base"))]))
            .await
            .unwrap();
        assert!(state.is_success());
        assert_eq!(
            seen.lock().unwrap().get("mode"),
            Some(&json!("from_dependency"))
        );
    }

    #[tokio::test]
    async fn test_shared_store_is_per_run_and_visible_to_steps() {
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();

        let workflow = Workflow::new("shared")
            .step(Step::from_fn("writer", |ctx: StepContext| async move {
                ctx.shared.update("count", |v| {
                    json!(v.and_then(Value::as_i64).unwrap_or(0) + 1)
                });
                Ok(StepResult::empty())
            }))
            .step(
                Step::from_fn("reader", move |ctx: StepContext| {
                    *sink.lock().unwrap() = ctx.shared.get("count");
                    async { Ok(StepResult::empty()) }
                })
                .after(["writer"]),
            );

        // Two runs: each gets its own store, so the counter never carries over.
        run(&workflow, DataMap::new()).await.unwrap();
        run(&workflow, DataMap::new()).await.unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_missing_required_input_becomes_step_failure() {
        let workflow = Workflow::new("strict").step(Step::from_fn(
            "needy",
            |ctx: StepContext| async move {
                ctx.require("api_key")?;
                Ok(StepResult::empty())
            },
        ));

        let state = run(&workflow, DataMap::new()).await.unwrap();
        match state.errors.get("needy").unwrap() {
            Error::StepFailed { source, .. } => {
                assert!(matches!(**source, Error::InputNotFound { .. }));
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_history_records_completion_order() {
        let workflow = Workflow::new("ordered")
            .step(ok("late").after(["early"]))
            .step(ok("early"));

        let state = run(&workflow, DataMap::new()).await.unwrap();
        assert_eq!(
            state.history,
            vec!["early".to_string(), "late".to_string()]
        );
    }
}
