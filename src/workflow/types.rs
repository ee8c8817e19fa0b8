//! Workflow and step type definitions.
//!
//! Workflows are built programmatically: step bodies are async closures or
//! [`StepHandler`] implementations, wired together by declared dependency
//! names into a DAG.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::hooks::{Hook, HookContext, HookRegistry, Middleware};
use crate::store::SharedStore;

/// Input/output mapping type. `serde_json::Map` keeps keys sorted, which
/// makes the serialized form canonical for cache keys.
pub type DataMap = Map<String, Value>;

/// Result of a successful step execution.
///
/// `output` is visible to dependent steps as part of their assembled
/// inputs; `metadata` is informational only and never propagated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResult {
    /// Output data, merged into dependents' inputs.
    pub output: DataMap,

    /// Metadata (timing, debug info, etc.). Not propagated.
    #[serde(default)]
    pub metadata: DataMap,
}

impl StepResult {
    /// Create a result with just output data.
    pub fn new(output: DataMap) -> Self {
        Self {
            output,
            metadata: DataMap::new(),
        }
    }

    /// Create a result with output and metadata.
    pub fn with_metadata(output: DataMap, metadata: DataMap) -> Self {
        Self { output, metadata }
    }

    /// Create an empty result.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a result holding a single output key.
    pub fn of(key: &str, value: Value) -> Self {
        let mut output = DataMap::new();
        output.insert(key.to_string(), value);
        Self::new(output)
    }
}

/// Context passed to a step body for one attempt.
#[derive(Clone)]
pub struct StepContext {
    /// Assembled inputs: workflow inputs unioned with the outputs of all
    /// direct dependencies (dependency values win on key collision).
    pub inputs: DataMap,

    /// The run's shared result store.
    pub shared: Arc<SharedStore>,

    /// Name of the workflow being run.
    pub workflow: String,

    /// Unique ID of this run.
    pub run_id: String,

    /// Name of the step being executed.
    pub step: String,

    /// Attempt number, starting at 1.
    pub attempt: u32,
}

impl StepContext {
    /// Get an input value by key.
    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    /// Get a required input value, failing with `InputNotFound` if absent.
    pub fn require(&self, key: &str) -> Result<&Value> {
        self.inputs.get(key).ok_or_else(|| Error::InputNotFound {
            key: key.to_string(),
        })
    }
}

/// Trait implemented by step bodies.
///
/// Bodies must be idempotent: the retry policy re-invokes the full body,
/// so side effects may repeat across attempts.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute one attempt of the step.
    async fn execute(&self, ctx: StepContext) -> Result<StepResult>;
}

type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Adapter implementing [`StepHandler`] for async closures.
struct FnHandler<F>(F);

#[async_trait]
impl<F> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> BoxFuture<Result<StepResult>> + Send + Sync,
{
    async fn execute(&self, ctx: StepContext) -> Result<StepResult> {
        (self.0)(ctx).await
    }
}

/// A named unit of work with declared dependencies.
#[derive(Clone)]
pub struct Step {
    /// Unique step name within a workflow.
    pub name: String,

    /// Names of steps that must complete before this one runs.
    pub depends_on: BTreeSet<String>,

    /// Additional attempts after the first failure.
    pub retries: u32,

    /// Per-attempt timeout. An attempt exceeding it counts as a failure.
    pub timeout: Option<Duration>,

    /// Whether results are memoized by (step name, assembled inputs).
    pub cache_enabled: bool,

    pub(crate) handler: Arc<dyn StepHandler>,
}

impl Step {
    /// Create a step from a [`StepHandler`] implementation.
    pub fn new(name: impl Into<String>, handler: impl StepHandler + 'static) -> Self {
        Self {
            name: name.into(),
            depends_on: BTreeSet::new(),
            retries: 0,
            timeout: None,
            cache_enabled: false,
            handler: Arc::new(handler),
        }
    }

    /// Create a step from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StepResult>> + Send + 'static,
    {
        Self::new(
            name,
            FnHandler(move |ctx| -> BoxFuture<Result<StepResult>> { Box::pin(f(ctx)) }),
        )
    }

    /// Declare dependencies on other steps.
    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Set the number of additional attempts after the first failure.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set a per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable result caching for this step.
    pub fn with_cache(mut self) -> Self {
        self.cache_enabled = true;
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .field("cache_enabled", &self.cache_enabled)
            .finish()
    }
}

/// Global workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Maximum concurrent step executions per batch. 0 means unbounded.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Base unit for exponential retry backoff, in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Upper bound on a single backoff delay, in milliseconds.
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,

    /// Snapshot file for resumable runs. None disables persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,

    /// Directory for memoized step results. None disables caching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            snapshot_path: None,
            cache_dir: None,
        }
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_retry_base_ms() -> u64 {
    200
}

fn default_retry_cap_ms() -> u64 {
    30_000 // 30 seconds
}

/// A DAG of steps plus execution configuration.
///
/// Immutable once handed to the scheduler; all mutation during a run
/// happens on the run's `WorkflowState`.
pub struct Workflow {
    /// Workflow name (used as identifier, recorded in snapshots).
    pub name: String,

    /// Steps keyed by name. The map enforces name uniqueness.
    pub steps: BTreeMap<String, Step>,

    /// Global settings.
    pub settings: WorkflowSettings,

    /// Middleware chain; the first registered entry is the outermost
    /// wrapper around step bodies.
    pub(crate) middleware: Vec<Arc<dyn Middleware>>,

    /// Named lifecycle hooks.
    pub(crate) hooks: HookRegistry,
}

impl Workflow {
    /// Create an empty workflow with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: BTreeMap::new(),
            settings: WorkflowSettings::default(),
            middleware: Vec::new(),
            hooks: HookRegistry::new(),
        }
    }

    /// Add a step. A step with the same name replaces the previous one.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.insert(step.name.clone(), step);
        self
    }

    /// Replace the settings wholesale.
    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the per-batch worker bound. 0 means unbounded.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.settings.max_workers = max_workers;
        self
    }

    /// Set the snapshot file for resumable runs.
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.snapshot_path = Some(path.into());
        self
    }

    /// Set the directory for memoized step results.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.cache_dir = Some(dir.into());
        self
    }

    /// Append a middleware. Registration order is outermost-first.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Register a hook for a lifecycle event.
    pub fn on_hook(mut self, event: impl Into<String>, hook: Arc<dyn Hook>) -> Self {
        self.hooks.on(event, hook);
        self
    }

    /// Register a plain closure as a hook.
    pub fn on<F>(mut self, event: impl Into<String>, f: F) -> Self
    where
        F: Fn(&HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_fn(event, f);
        self
    }

    /// Get a step by name.
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    /// All step names, sorted.
    pub fn step_names(&self) -> BTreeSet<String> {
        self.steps.keys().cloned().collect()
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("settings", &self.settings)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}
