//! lockstep - batch-synchronous dependency-graph workflow executor
//!
//! lockstep runs named computational steps in parallel while respecting
//! their declared dependencies, with retries, per-attempt timeouts,
//! result caching, checkpoint persistence, and lifecycle hooks and
//! middleware. Step bodies are opaque async functions (an LLM call, an
//! HTTP fetch, a database write); the engine never inspects their
//! internals.
//!
//! The scheduler is deliberately batch-synchronous: each round dispatches
//! every ready step (bounded by `max_workers`), blocks until the whole
//! batch reaches terminal outcomes, then merges results. That trades
//! peak worker utilization for a race-free state model in which a
//! dependent can never start in the same batch as its dependency.
//!
//! ## Example
//!
//! ```no_run
//! use lockstep::{DataMap, Step, StepResult, Workflow};
//! use serde_json::json;
//!
//! # async fn demo() -> lockstep::Result<()> {
//! let workflow = Workflow::new("enrich-orders")
//!     .max_workers(4)
//!     .step(Step::from_fn("fetch", |_ctx| async {
//!         Ok(StepResult::of("orders", json!([1, 2, 3])))
//!     }))
//!     .step(
//!         Step::from_fn("summarize", |ctx| async move {
//!             let orders = ctx.require("orders")?.clone();
//!             Ok(StepResult::of("summary", orders))
//!         })
//!         .after(["fetch"])
//!         .with_retries(2),
//!     );
//!
//! let state = lockstep::run(&workflow, DataMap::new()).await?;
//! assert!(state.is_success());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod persistence;
pub mod routing;
pub mod store;
pub mod workflow;

pub use cache::StepCache;
pub use engine::{run, Scheduler, Snapshot, WorkflowState};
pub use error::{Error, Result};
pub use hooks::{Hook, HookContext, HookRegistry, Middleware, Next};
pub use persistence::SnapshotStore;
pub use routing::RoutingTable;
pub use store::SharedStore;
pub use workflow::{
    validate, DataMap, Step, StepContext, StepHandler, StepResult, Workflow, WorkflowSettings,
};
