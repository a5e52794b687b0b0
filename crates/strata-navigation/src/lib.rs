//! Tier-2 navigation for the Strata engine.
//!
//! Tier 2 turns a routine into a sequence of steps:
//!
//! - [`BpmnModel`]: workflow graph with typed elements and sequence flows
//! - [`BpmnSubprocessHandler`]: entry, nested navigation and completion of
//!   embedded subprocesses, call activities, event subprocesses,
//!   transactions and ad-hoc subprocesses
//! - [`Navigator`]: format-specific graph walker ([`BpmnNavigator`],
//!   [`NativeNavigator`])
//! - [`TierTwoOrchestrator`]: resolves the navigator for a request, runs
//!   steps through tier 3 and reports `run.*` events

pub mod bpmn;
pub mod error;
pub mod native;
pub mod navigator;
pub mod orchestrator;

pub use bpmn::{
    AdHocOrdering, BpmnElement, BpmnModel, BpmnNavigator, BpmnSubprocessHandler,
    ComparisonOperator, DEFAULT_MAX_SUBPROCESS_DEPTH, ElementKind, FlowCondition, SequenceFlow,
    ServiceTask, VariableMapping,
};
pub use error::{NavigationError, Result};
pub use native::{NativeNavigator, NativeRoutine, NativeStep};
pub use navigator::{NodeAction, Navigator, SharedNavigator, resolve_parameters};
pub use orchestrator::{DEFAULT_MAX_STEPS, NavigationConfig, TierTwoOrchestrator};
