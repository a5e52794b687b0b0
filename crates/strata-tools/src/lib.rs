//! Tool registry for the Strata execution engine.
//!
//! Tools are the leaf work a workflow step performs. The
//! [`IntegratedToolRegistry`] unifies three sources behind the one [`Tool`]
//! trait:
//!
//! - built-in tools registered by the composition root,
//! - dynamic tools registered and removed at runtime,
//! - external tools discovered through an [`ExternalToolProvider`].
//!
//! Execution of tools at or above the configured risk threshold passes
//! through an [`ApprovalGate`] first.

pub mod builtin;
pub mod error;
pub mod registry;
pub mod tool;

pub use builtin::{EchoTool, FailTool, FlakyTool, SleepTool, register_builtins};
pub use error::{Result, ToolError};
pub use registry::{
    ApprovalDecision, ApprovalGate, ApprovalRequest, AutoApprove, DenyAll,
    ExternalToolProvider, IntegratedToolRegistry, RegistryConfig, StaticToolProvider,
    ToolInfo, ToolSource,
};
pub use tool::{Tool, ToolContext, ToolOutput};
