//! Single-step execution.
//!
//! Runs one step to a terminal outcome: cache consult, "before" hook,
//! the middleware-wrapped body with retry and per-attempt timeout, the
//! "after" hook, and the cache write-back on success.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::cache::StepCache;
use crate::error::{Error, Result};
use crate::hooks::{after_step_event, before_step_event, HookContext, HookRegistry, Middleware, Next};
use crate::store::SharedStore;
use crate::workflow::types::{DataMap, Step, StepContext, StepResult};

/// Shared, immutable context for one run.
pub(crate) struct RunContext {
    pub workflow: String,
    pub run_id: String,
    pub shared: Arc<SharedStore>,
    pub cache: Arc<StepCache>,
    pub hooks: HookRegistry,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

/// Terminal outcome of one step dispatch.
pub(crate) struct StepOutcome {
    pub step: String,
    /// Terminal result. None when the "before" hook failed and no attempt
    /// ever ran.
    pub result: Option<Result<StepResult>>,
    /// Error raised by a lifecycle hook. Fatal to the run.
    pub hook_error: Option<Error>,
    pub from_cache: bool,
}

/// Execute one step to a terminal outcome.
///
/// A cache hit returns the stored result without invoking the body or any
/// hook or middleware. Otherwise the body runs wrapped by the middleware
/// chain, with up to `retries` additional attempts after the first
/// failure; the "after" hook fires exactly once when the attempt sequence
/// concludes, so observers always see the terminal outcome.
#[instrument(
    name = "step.execute",
    skip(step, inputs, rcx),
    fields(step = %step.name, run_id = %rcx.run_id)
)]
pub(crate) async fn execute_step(step: Step, inputs: DataMap, rcx: Arc<RunContext>) -> StepOutcome {
    let cache_key = step
        .cache_enabled
        .then(|| StepCache::key(&step.name, &inputs));

    if let Some(key) = cache_key.as_deref() {
        if let Some(hit) = rcx.cache.lookup(key) {
            debug!("Cache hit for step '{}'", step.name);
            return StepOutcome {
                step: step.name,
                result: Some(Ok(hit)),
                hook_error: None,
                from_cache: true,
            };
        }
    }

    let before_event = before_step_event(&step.name);
    let before_ctx = HookContext {
        event: &before_event,
        workflow: &rcx.workflow,
        run_id: &rcx.run_id,
        step: Some(&step.name),
        shared: &rcx.shared,
        outcome: None,
    };
    if let Err(e) = rcx.hooks.fire(&before_event, &before_ctx).await {
        error!("Hook failed before step '{}': {}", step.name, e);
        return StepOutcome {
            step: step.name,
            result: None,
            hook_error: Some(e),
            from_cache: false,
        };
    }

    let result = run_attempts(&step, &inputs, &rcx).await;

    let after_event = after_step_event(&step.name);
    let after_ctx = HookContext {
        event: &after_event,
        workflow: &rcx.workflow,
        run_id: &rcx.run_id,
        step: Some(&step.name),
        shared: &rcx.shared,
        outcome: Some(&result),
    };
    let hook_error = rcx.hooks.fire(&after_event, &after_ctx).await.err();
    if let Some(e) = &hook_error {
        error!("Hook failed after step '{}': {}", step.name, e);
    }

    if let (Some(key), Ok(res)) = (cache_key.as_deref(), &result) {
        rcx.cache.store(key, res);
    }

    StepOutcome {
        step: step.name,
        result: Some(result),
        hook_error,
        from_cache: false,
    }
}

enum AttemptFailure {
    TimedOut,
    Failed(Error),
}

/// Run the body through the middleware chain until success or the retry
/// budget is exhausted. Each attempt is a full re-invocation of the
/// wrapped body: bodies must be idempotent, and retries may repeat side
/// effects.
async fn run_attempts(step: &Step, inputs: &DataMap, rcx: &RunContext) -> Result<StepResult> {
    let max_attempts = step.retries.saturating_add(1);
    let mut last_timed_out = false;
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        let ctx = StepContext {
            inputs: inputs.clone(),
            shared: rcx.shared.clone(),
            workflow: rcx.workflow.clone(),
            run_id: rcx.run_id.clone(),
            step: step.name.clone(),
            attempt,
        };
        let invocation = Next::new(&rcx.middleware, step.handler.as_ref()).run(ctx);

        let outcome = match step.timeout {
            Some(limit) => match timeout(limit, invocation).await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(AttemptFailure::Failed(e)),
                Err(_) => Err(AttemptFailure::TimedOut),
            },
            None => invocation.await.map_err(AttemptFailure::Failed),
        };

        match outcome {
            Ok(result) => {
                info!("Step '{}' succeeded on attempt {}", step.name, attempt);
                return Ok(result);
            }
            Err(failure) => {
                match failure {
                    AttemptFailure::TimedOut => {
                        warn!(
                            "Step '{}' attempt {}/{} timed out",
                            step.name, attempt, max_attempts
                        );
                        last_timed_out = true;
                        last_error = None;
                    }
                    AttemptFailure::Failed(e) => {
                        warn!(
                            "Step '{}' attempt {}/{} failed: {}",
                            step.name, attempt, max_attempts, e
                        );
                        last_timed_out = false;
                        last_error = Some(e);
                    }
                }

                if attempt < max_attempts {
                    let delay = backoff_delay(attempt, rcx.retry_base, rcx.retry_cap);
                    debug!("Retrying step '{}' in {:?}", step.name, delay);
                    sleep(delay).await;
                }
            }
        }
    }

    // The final attempt's failure mode decides the terminal error.
    if last_timed_out {
        Err(Error::StepTimeout {
            step: step.name.clone(),
        })
    } else {
        Err(Error::StepFailed {
            step: step.name.clone(),
            source: Box::new(
                last_error.unwrap_or_else(|| Error::Execution("attempt failed".to_string())),
            ),
        })
    }
}

/// Capped exponential backoff after the `attempt`-th failure (1-indexed):
/// base, 2x base, 4x base, ... never exceeding the cap.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << shift).min(cap)
}
