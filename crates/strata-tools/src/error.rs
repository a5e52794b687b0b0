//! Error types for the tools crate.

use strata_types::{ErrorCategory, ErrorClassification, Recoverability, Severity};
use thiserror::Error;

/// Result type alias using the tool error type.
pub type Result<T> = std::result::Result<T, ToolError>;

/// Error type for tool registration and execution.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Tool not found in registry.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// Invalid tool parameters.
    #[error("Invalid tool parameters: {0}")]
    InvalidParameters(String),

    /// The tool ran and failed.
    #[error("Tool execution failed: {message}")]
    Execution { message: String, retryable: bool },

    /// The tool did not finish in time.
    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// An upstream quota was exhausted.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The tool refused an operation for security reasons.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The approval gate declined a high-risk tool.
    #[error("Approval denied for tool '{tool}': {reason}")]
    ApprovalDenied { tool: String, reason: String },

    /// An external provider failed.
    #[error("Provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    /// Registration conflicts with an existing tool.
    #[error("Registration conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ToolError {
    /// Create a retryable execution error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Execution {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable execution error.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an invalid parameters error.
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    /// Classify this error for recovery strategy selection.
    pub fn classify(&self) -> ErrorClassification {
        match self {
            ToolError::Execution {
                retryable: true, ..
            }
            | ToolError::Timeout { .. }
            | ToolError::Provider { .. } => {
                ErrorClassification::new(Severity::Error, ErrorCategory::Transient)
            }
            ToolError::RateLimited(_) => {
                ErrorClassification::new(Severity::Warning, ErrorCategory::Resource)
            }
            ToolError::Execution {
                retryable: false, ..
            } => ErrorClassification::new(Severity::Error, ErrorCategory::Logic)
                .with_recoverability(Recoverability::Manual),
            ToolError::PermissionDenied(_) | ToolError::ApprovalDenied { .. } => {
                ErrorClassification::new(Severity::Critical, ErrorCategory::Security)
                    .with_recoverability(Recoverability::Manual)
                    .with_security_risk(true)
            }
            ToolError::NotFound(_)
            | ToolError::InvalidParameters(_)
            | ToolError::Conflict(_)
            | ToolError::Serialization(_) => {
                ErrorClassification::new(Severity::Error, ErrorCategory::Logic)
                    .with_recoverability(Recoverability::None)
            }
        }
    }
}
