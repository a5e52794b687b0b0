//! Native routines: an ordered list of tool steps.
//!
//! ```json
//! {
//!   "id": "greet",
//!   "steps": [
//!     { "id": "hello", "tool": "echo", "parameters": { "message": "{{name}}" }, "result_variable": "greeting" },
//!     { "id": "pause", "tool": "sleep", "parameters": { "ms": 10 } }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_types::{AbstractLocation, ExecutionContext, RoutineFormat, StepDescriptor};

use crate::error::{NavigationError, Result};
use crate::navigator::{Navigator, NodeAction, resolve_parameters};

/// One step of a native routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeStep {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: Value,
    /// Variable the step's output is stored under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_variable: Option<String>,
}

impl NativeStep {
    pub fn new(id: impl Into<String>, tool: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            parameters,
            result_variable: None,
        }
    }

    pub fn storing(mut self, variable: impl Into<String>) -> Self {
        self.result_variable = Some(variable.into());
        self
    }
}

/// A routine that runs its steps in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeRoutine {
    pub id: String,
    #[serde(default)]
    pub steps: Vec<NativeStep>,
}

impl NativeRoutine {
    pub fn new(id: impl Into<String>, steps: Vec<NativeStep>) -> Self {
        Self {
            id: id.into(),
            steps,
        }
    }

    /// Parse and validate a routine from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let routine: Self = serde_json::from_str(json)?;
        routine.validate()?;
        Ok(routine)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| NavigationError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Checks the id is set, step ids are unique and every step names a tool.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(NavigationError::invalid("routine id must not be empty"));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(NavigationError::invalid(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            if step.tool.trim().is_empty() {
                return Err(NavigationError::invalid(format!(
                    "step '{}' names no tool",
                    step.id
                )));
            }
        }
        Ok(())
    }

    fn position(&self, step_id: &str) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| NavigationError::ElementNotFound(step_id.to_string()))
    }
}

/// Runs a [`NativeRoutine`] one step after the other.
#[derive(Debug, Clone)]
pub struct NativeNavigator {
    routine: Arc<NativeRoutine>,
}

impl NativeNavigator {
    pub fn new(routine: impl Into<Arc<NativeRoutine>>) -> Self {
        Self {
            routine: routine.into(),
        }
    }

    pub fn routine(&self) -> &NativeRoutine {
        &self.routine
    }
}

impl Navigator for NativeNavigator {
    fn routine_id(&self) -> &str {
        &self.routine.id
    }

    fn format(&self) -> RoutineFormat {
        RoutineFormat::Native
    }

    fn start(&self, _ctx: &mut ExecutionContext) -> Result<Vec<AbstractLocation>> {
        Ok(self
            .routine
            .steps
            .first()
            .map(|s| vec![AbstractLocation::node(&self.routine.id, s.id.clone())])
            .unwrap_or_default())
    }

    fn action(&self, location: &AbstractLocation, ctx: &ExecutionContext) -> Result<NodeAction> {
        let step = &self.routine.steps[self.routine.position(&location.node_id)?];
        Ok(NodeAction::Step(StepDescriptor {
            step_id: step.id.clone(),
            tool: step.tool.clone(),
            parameters: resolve_parameters(&step.parameters, &ctx.variables),
        }))
    }

    fn advance(
        &self,
        location: &AbstractLocation,
        output: Option<&Value>,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let index = self.routine.position(&location.node_id)?;
        if let (Some(var), Some(value)) = (&self.routine.steps[index].result_variable, output) {
            ctx.variables.insert(var.clone(), value.clone());
        }
        Ok(self
            .routine
            .steps
            .get(index + 1)
            .map(|s| vec![location.sibling(s.id.clone())])
            .unwrap_or_default())
    }
}
