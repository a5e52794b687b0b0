//! The contract between execution tiers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Variables;
use crate::error::Result;
use crate::ids::ExecutionId;
use crate::location::AbstractLocation;
use crate::resources::{AvailableResources, ResourceConstraints, ResourceUsage};

/// Format a routine is authored in; selects the navigator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineFormat {
    /// Ordered list of steps.
    Native,
    /// BPMN-style graph.
    Bpmn,
    /// Format provided by an externally registered navigator.
    Custom(String),
}

impl std::fmt::Display for RoutineFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutineFormat::Native => write!(f, "native"),
            RoutineFormat::Bpmn => write!(f, "bpmn"),
            RoutineFormat::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// Granularity of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    /// A single leaf step.
    Step,
    /// A whole routine.
    Routine,
}

/// The leaf work a step request carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub step_id: String,
    /// Tool to run.
    pub tool: String,
    #[serde(default)]
    pub parameters: Value,
}

/// A normalized execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierExecutionRequest {
    pub execution_id: ExecutionId,
    pub request_type: RequestType,
    pub routine_id: String,
    pub format: RoutineFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepDescriptor>,
    #[serde(default)]
    pub inputs: Variables,
    #[serde(default)]
    pub available: AvailableResources,
    #[serde(default)]
    pub constraints: ResourceConstraints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<AbstractLocation>,
}

impl TierExecutionRequest {
    /// A routine-level request.
    pub fn routine(routine_id: impl Into<String>, format: RoutineFormat) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            request_type: RequestType::Routine,
            routine_id: routine_id.into(),
            format,
            step: None,
            inputs: Variables::new(),
            available: AvailableResources::default(),
            constraints: ResourceConstraints::default(),
            user_id: None,
            swarm_id: None,
            location: None,
        }
    }

    /// A step-level request for the same routine and budget.
    pub fn step_of(&self, step: StepDescriptor, location: AbstractLocation) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            request_type: RequestType::Step,
            routine_id: self.routine_id.clone(),
            format: self.format.clone(),
            step: Some(step),
            inputs: self.inputs.clone(),
            available: self.available.clone(),
            constraints: self.constraints.clone(),
            user_id: self.user_id.clone(),
            swarm_id: self.swarm_id.clone(),
            location: Some(location),
        }
    }

    pub fn with_inputs(mut self, inputs: Variables) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_available(mut self, available: AvailableResources) -> Self {
        self.available = available;
        self
    }

    pub fn with_constraints(mut self, constraints: ResourceConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_step(mut self, step: StepDescriptor) -> Self {
        self.request_type = RequestType::Step;
        self.step = Some(step);
        self
    }
}

/// Final status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Cancelled,
}

/// What an execution produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResourceUsage>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn completed(execution_id: ExecutionId, data: Value) -> Self {
        Self {
            execution_id,
            status: ExecutionStatus::Completed,
            data: Some(data),
            error: None,
            usage: None,
            duration_ms: 0,
        }
    }

    pub fn failed(execution_id: ExecutionId, error: impl Into<String>) -> Self {
        Self {
            execution_id,
            status: ExecutionStatus::Failed,
            data: None,
            error: Some(error.into()),
            usage: None,
            duration_ms: 0,
        }
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Aggregate execution metrics of a tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierMetrics {
    pub total_executions: u64,
    pub active_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_execution_time_ms: f64,
}

/// Interface a tier exposes to the tier above it.
///
/// Implementations must tolerate concurrent calls.
#[async_trait]
pub trait TierCommunication: Send + Sync {
    /// Execute a request.
    async fn execute(&self, request: TierExecutionRequest) -> Result<ExecutionResult>;

    /// Current metrics.
    fn metrics(&self) -> TierMetrics;
}

/// Shared handle to a tier.
pub type SharedTierCommunication = Arc<dyn TierCommunication>;
