//! Error types for lockstep.
//!
//! Validation and hook errors abort a run; step-level errors are recorded
//! in the run state's `errors` map and surfaced there instead.

use thiserror::Error;

/// Result type alias for lockstep operations.
pub type Result<T> = std::result::Result<T, Error>;

/// lockstep error types.
///
/// Each variant carries a code that callers can match on programmatically.
#[derive(Error, Debug)]
pub enum Error {
    /// A step references a dependency that is not part of the workflow.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    MissingDependency { step: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("circular dependency among steps: {}", .names.join(", "))]
    CircularDependency { names: Vec<String> },

    /// A step required an input key absent from its assembled inputs.
    #[error("required input '{key}' not found")]
    InputNotFound { key: String },

    /// A step body failed after exhausting its retry budget.
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<Error>,
    },

    /// A step's final attempt exceeded its configured timeout.
    #[error("step '{step}' timed out")]
    StepTimeout { step: String },

    /// A lifecycle hook failed. Hook failures are always fatal to the run.
    #[error("hook '{event}' failed: {source}")]
    Hook {
        event: String,
        #[source]
        source: Box<Error>,
    },

    /// A routing table names a step that does not exist.
    #[error("route '{decision}' targets unknown step '{step}'")]
    InvalidRoute { decision: String, step: String },

    /// Snapshot I/O failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Opaque step-body failure.
    #[error("execution error: {0}")]
    Execution(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Error::MissingDependency { .. } => "MISSING_DEPENDENCY",
            Error::CircularDependency { .. } => "CIRCULAR_DEPENDENCY",
            Error::InputNotFound { .. } => "INPUT_NOT_FOUND",
            Error::StepFailed { .. } => "STEP_FAILED",
            Error::StepTimeout { .. } => "STEP_TIMEOUT",
            Error::Hook { .. } => "HOOK_FAILED",
            Error::InvalidRoute { .. } => "INVALID_ROUTE",
            Error::Persistence(_) => "PERSISTENCE_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether this error aborts the whole run rather than a single step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MissingDependency { .. } | Error::CircularDependency { .. } | Error::Hook { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::MissingDependency {
            step: "a".to_string(),
            dependency: "ghost".to_string(),
        };
        assert_eq!(err.code(), "MISSING_DEPENDENCY");
        assert!(err.to_string().contains("ghost"));

        let err = Error::CircularDependency {
            names: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.code(), "CIRCULAR_DEPENDENCY");
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn test_step_failed_preserves_cause() {
        let err = Error::StepFailed {
            step: "fetch".to_string(),
            source: Box::new(Error::InputNotFound {
                key: "url".to_string(),
            }),
        };
        assert!(err.to_string().contains("fetch"));
        assert!(err.to_string().contains("url"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::CircularDependency { names: vec![] }.is_fatal());
        assert!(!Error::StepTimeout {
            step: "x".to_string()
        }
        .is_fatal());
    }
}
