//! The tool trait and its execution context.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_types::{ExecutionId, ResourceUsage, RiskLevel, Variables};

use crate::error::Result;

// ─────────────────────────────────────────────────────────────────────────────
// Tool Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for workflow tools.
///
/// A tool performs the leaf work of a step. Each tool describes its
/// parameters as a JSON Schema and declares how risky it is; the registry
/// uses the risk level to decide whether approval is needed.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name of this tool.
    fn name(&self) -> &str;

    /// Human-readable description of what this tool does.
    fn description(&self) -> &str;

    /// JSON Schema for this tool's parameters.
    fn parameters(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    /// Risk level of running this tool.
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Low
    }

    /// Execute the tool with the given parameters.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context provided to tools during execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Execution the step belongs to.
    pub execution_id: ExecutionId,
    /// Step being executed.
    pub step_id: String,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Variables visible at the step's location.
    pub variables: Variables,
}

impl ToolContext {
    pub fn new(execution_id: ExecutionId, step_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            attempt: 1,
            variables: Variables::new(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Output
// ─────────────────────────────────────────────────────────────────────────────

/// Successful result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Output data.
    pub data: Value,
    /// Resources the tool reports having consumed.
    #[serde(default)]
    pub usage: ResourceUsage,
}

impl ToolOutput {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            usage: ResourceUsage::default(),
        }
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = usage;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock Tool (for testing)
// ─────────────────────────────────────────────────────────────────────────────

/// A mock tool for testing.
///
/// Returns a configurable response and tracks calls for verification.
#[cfg(test)]
#[derive(Debug)]
pub struct MockTool {
    name: String,
    risk: RiskLevel,
    response: std::sync::Mutex<Option<Value>>,
    calls: std::sync::Mutex<Vec<Value>>,
}

#[cfg(test)]
impl MockTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            risk: RiskLevel::Low,
            response: std::sync::Mutex::new(None),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_response(self, response: Value) -> Self {
        *self.response.lock().unwrap() = Some(response);
        self
    }

    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "A mock tool for testing"
    }

    fn risk_level(&self) -> RiskLevel {
        self.risk
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(params);
        let response = self
            .response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| serde_json::json!("mock response"));
        Ok(ToolOutput::new(response))
    }
}
