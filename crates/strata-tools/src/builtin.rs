//! Built-in tools.
//!
//! Small, dependency-free tools that every registry gets. They are enough to
//! drive a workflow end to end: pass data along, wait, and fail in a
//! controlled way to exercise recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use strata_types::{ExecutionId, ResourceUsage};

use crate::error::{Result, ToolError};
use crate::registry::IntegratedToolRegistry;
use crate::tool::{Tool, ToolContext, ToolOutput};

/// Register every built-in tool.
pub fn register_builtins(registry: &IntegratedToolRegistry) {
    registry.register_builtin(Arc::new(EchoTool));
    registry.register_builtin(Arc::new(SleepTool));
    registry.register_builtin(Arc::new(FailTool));
    registry.register_builtin(Arc::new(FlakyTool::new()));
}

fn reported_usage(params: &Value) -> ResourceUsage {
    ResourceUsage {
        cost: params.get("cost").and_then(Value::as_f64).unwrap_or(0.0),
        tokens: params.get("tokens").and_then(Value::as_u64).unwrap_or(0),
        api_calls: params.get("api_calls").and_then(Value::as_u64).unwrap_or(0),
        ..Default::default()
    }
}

fn error_of_kind(kind: &str, message: String) -> ToolError {
    match kind {
        "transient" => ToolError::transient(message),
        "rate_limit" => ToolError::RateLimited(message),
        "permission" => ToolError::PermissionDenied(message),
        _ => ToolError::execution(message),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// echo
// ─────────────────────────────────────────────────────────────────────────────

/// Returns its parameters as output.
///
/// Optional `cost`, `tokens` and `api_calls` parameters are reported as
/// resource usage.
#[derive(Debug, Default)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the given parameters unchanged"
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let usage = reported_usage(&params);
        Ok(ToolOutput::new(params).with_usage(usage))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// sleep
// ─────────────────────────────────────────────────────────────────────────────

/// Waits for `ms` milliseconds.
#[derive(Debug, Default)]
pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Wait for the given number of milliseconds"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "ms": { "type": "integer", "minimum": 0 } },
            "required": ["ms"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let ms = params
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| ToolError::invalid_params("'ms' must be a non-negative integer"))?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        let usage = ResourceUsage {
            compute_time_ms: ms,
            ..reported_usage(&params)
        };
        Ok(ToolOutput::new(json!({ "slept_ms": ms })).with_usage(usage))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// fail
// ─────────────────────────────────────────────────────────────────────────────

/// Always fails. `kind` selects the error: `transient`, `rate_limit`,
/// `permission` or anything else for a logic error.
#[derive(Debug, Default)]
pub struct FailTool;

#[async_trait]
impl Tool for FailTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Fail with the requested kind of error"
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let kind = params.get("kind").and_then(Value::as_str).unwrap_or("logic");
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("requested failure")
            .to_string();
        Err(error_of_kind(kind, message))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// flaky
// ─────────────────────────────────────────────────────────────────────────────

/// Fails the first `failures` calls for each step of an execution, then
/// succeeds. Errors are transient unless `kind` says otherwise.
#[derive(Debug, Default)]
pub struct FlakyTool {
    attempts: Mutex<HashMap<(ExecutionId, String), u64>>,
}

impl FlakyTool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Fail a fixed number of times per step, then succeed"
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let failures = params.get("failures").and_then(Value::as_u64).unwrap_or(1);
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts
                .entry((ctx.execution_id, ctx.step_id.clone()))
                .or_insert(0);
            *count += 1;
            *count
        };

        if attempt <= failures {
            let kind = params.get("kind").and_then(Value::as_str).unwrap_or("transient");
            return Err(error_of_kind(
                kind,
                format!("flaky failure {attempt} of {failures}"),
            ));
        }
        Ok(ToolOutput::new(json!({ "attempts": attempt })).with_usage(reported_usage(&params)))
    }
}
