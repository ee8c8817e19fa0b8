//! Lifecycle hooks and execution middleware.
//!
//! Hooks are named lists of callbacks keyed by lifecycle event. Multiple
//! hooks for one event run sequentially in registration order. A hook
//! failure is fatal to the run: hooks exist for observability guarantees
//! that must not go dark, so their errors are never swallowed.
//!
//! Middleware wraps step-body invocation. The registered list composes
//! with the first-registered entry as the outermost wrapper.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::store::SharedStore;
use crate::workflow::types::{StepContext, StepHandler, StepResult};

/// Event fired once before the first batch is dispatched.
pub const BEFORE_WORKFLOW: &str = "before_workflow";

/// Event fired once after the driver loop terminates.
pub const AFTER_WORKFLOW: &str = "after_workflow";

/// Event name for a step's "before" hook.
pub fn before_step_event(step: &str) -> String {
    format!("before_step_{step}")
}

/// Event name for a step's "after" hook.
pub fn after_step_event(step: &str) -> String {
    format!("after_step_{step}")
}

/// Context passed to hook callbacks.
pub struct HookContext<'a> {
    /// The event being fired.
    pub event: &'a str,

    /// Name of the workflow being run.
    pub workflow: &'a str,

    /// Unique ID of this run.
    pub run_id: &'a str,

    /// Step name for step-scoped events, None for workflow-scoped ones.
    pub step: Option<&'a str>,

    /// The run's shared result store.
    pub shared: &'a SharedStore,

    /// Terminal outcome, present only on "after_step" events.
    pub outcome: Option<&'a Result<StepResult>>,
}

/// A side-effecting callback bound to a lifecycle event name.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Invoke the hook. Returning an error aborts the run.
    async fn call(&self, ctx: &HookContext<'_>) -> Result<()>;
}

/// Adapter implementing [`Hook`] for plain closures.
struct FnHook<F>(F);

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&HookContext<'_>) -> Result<()> + Send + Sync,
{
    async fn call(&self, ctx: &HookContext<'_>) -> Result<()> {
        (self.0)(ctx)
    }
}

/// Named lists of lifecycle hooks.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Vec<Arc<dyn Hook>>>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for an event. Hooks for one event run in
    /// registration order.
    pub fn on(&mut self, event: impl Into<String>, hook: Arc<dyn Hook>) {
        self.hooks.entry(event.into()).or_default().push(hook);
    }

    /// Register a plain closure as a hook.
    pub fn on_fn<F>(&mut self, event: impl Into<String>, f: F)
    where
        F: Fn(&HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.on(event, Arc::new(FnHook(f)));
    }

    /// Fire all hooks registered for an event, sequentially. The first
    /// failing hook aborts the sequence; its error is wrapped with the
    /// event name and propagated.
    pub async fn fire(&self, event: &str, ctx: &HookContext<'_>) -> Result<()> {
        if let Some(list) = self.hooks.get(event) {
            for hook in list {
                hook.call(ctx).await.map_err(|e| Error::Hook {
                    event: event.to_string(),
                    source: Box::new(e),
                })?;
            }
        }
        Ok(())
    }

    /// Whether any hook is registered for an event.
    pub fn has(&self, event: &str) -> bool {
        self.hooks.get(event).is_some_and(|l| !l.is_empty())
    }
}

/// A composable wrapper around step execution.
///
/// Implementations call `next.run(ctx)` to continue down the chain (and
/// ultimately into the step body), and may inspect or transform the
/// context and result on the way through.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Wrap one attempt of a step body.
    async fn handle(&self, ctx: StepContext, next: Next<'_>) -> Result<StepResult>;
}

/// The remainder of the middleware chain, ending in the step body.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a dyn StepHandler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], handler: &'a dyn StepHandler) -> Self {
        Self { chain, handler }
    }

    /// Run the rest of the chain with the given context.
    pub async fn run(self, ctx: StepContext) -> Result<StepResult> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(
                    ctx,
                    Next {
                        chain: rest,
                        handler: self.handler,
                    },
                )
                .await
            }
            None => self.handler.execute(ctx).await,
        }
    }
}
