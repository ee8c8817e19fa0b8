//! Workflow definition and validation.
//!
//! A workflow is a DAG of named steps plus execution settings. Steps are
//! built programmatically from async closures or [`StepHandler`]
//! implementations.

pub mod types;
pub mod validator;

pub use types::{DataMap, Step, StepContext, StepHandler, StepResult, Workflow, WorkflowSettings};
pub use validator::validate;
