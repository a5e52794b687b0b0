//! BPMN-style workflow graphs.

mod model;
mod navigator;
mod subprocess;

pub use model::{
    AdHocOrdering, BpmnElement, BpmnModel, ComparisonOperator, ElementKind, FlowCondition,
    SequenceFlow, ServiceTask, VariableMapping,
};
pub use navigator::BpmnNavigator;
pub use subprocess::{BpmnSubprocessHandler, DEFAULT_MAX_SUBPROCESS_DEPTH};
