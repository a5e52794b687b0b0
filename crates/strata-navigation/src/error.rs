//! Error types for navigation.

use strata_types::{RoutineFormat, SubprocessContextId};
use thiserror::Error;

/// Result type alias using the navigation error type.
pub type Result<T> = std::result::Result<T, NavigationError>;

/// Errors raised while walking a workflow graph.
///
/// These indicate a malformed workflow definition or a misuse of the
/// navigation API, never a runtime condition of a step.
#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Subprocess not found: {0}")]
    SubprocessNotFound(String),

    #[error("Element '{0}' is not a subprocess")]
    NotASubprocess(String),

    #[error("No start event in '{0}'")]
    MissingStartEvent(String),

    #[error("Subprocess nesting too deep: depth {depth} reaches the limit of {max}")]
    NestingTooDeep { depth: usize, max: usize },

    #[error("No active subprocess activation {0}")]
    UnknownActivation(SubprocessContextId),

    #[error("No outgoing flow of gateway '{0}' matched")]
    NoMatchingFlow(String),

    #[error("Invalid workflow model: {0}")]
    InvalidModel(String),

    #[error("Routine not found: {0}")]
    RoutineNotFound(String),

    #[error("No navigator for format '{0}'")]
    UnsupportedFormat(RoutineFormat),

    #[error("Failed to read workflow {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Workflow parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl NavigationError {
    /// Create an invalid model error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidModel(msg.into())
    }
}
