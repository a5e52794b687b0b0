//! The navigator abstraction.
//!
//! A navigator knows how to walk one routine format. The orchestrator owns
//! the frontier of locations and asks the navigator what each location
//! requires ([`Navigator::action`]) and where to go once that is done
//! ([`Navigator::advance`]).

use std::sync::Arc;

use serde_json::Value;
use strata_types::{
    AbstractLocation, ExecutionContext, RoutineFormat, StepDescriptor, SubprocessContextId,
    Variables,
};

use crate::error::{NavigationError, Result};

/// What the orchestrator must do at a location.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeAction {
    /// Run a leaf step on tier 3.
    Step(StepDescriptor),
    /// Run another routine and feed its variables back.
    Call {
        called_element: String,
        context_id: SubprocessContextId,
        inputs: Variables,
    },
    /// Nothing to execute; advance immediately.
    Pass,
    /// The token ends here.
    End,
}

/// Walks routines of one format.
pub trait Navigator: Send + Sync {
    /// Routine this navigator walks.
    fn routine_id(&self) -> &str;

    fn format(&self) -> RoutineFormat;

    /// Initial locations.
    fn start(&self, ctx: &mut ExecutionContext) -> Result<Vec<AbstractLocation>>;

    /// What `location` requires.
    fn action(&self, location: &AbstractLocation, ctx: &ExecutionContext) -> Result<NodeAction>;

    /// Next locations after `location` finished with `output`.
    fn advance(
        &self,
        location: &AbstractLocation,
        output: Option<&Value>,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>>;

    /// Next locations after a called routine finished with `outputs`.
    fn complete_call(
        &self,
        location: &AbstractLocation,
        context_id: SubprocessContextId,
        outputs: Variables,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let _ = (context_id, outputs, ctx);
        Err(NavigationError::invalid(format!(
            "{} routines do not call other routines (at {location})",
            self.format()
        )))
    }

    /// Record that the routine called from `location` failed.
    ///
    /// Navigators without call support have nothing to record.
    fn fail_call(
        &self,
        location: &AbstractLocation,
        context_id: SubprocessContextId,
        reason: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let _ = (location, context_id, reason, ctx);
        Ok(())
    }

    /// Whether `location` still belongs to a live scope.
    ///
    /// Locations inside an interrupted or finished activation are dropped
    /// from the frontier.
    fn is_live(&self, location: &AbstractLocation, ctx: &ExecutionContext) -> bool {
        location
            .metadata
            .subprocess_context_id
            .is_none_or(|id| ctx.subprocesses.get(id).is_some())
    }
}

/// Shared navigator handle.
pub type SharedNavigator = Arc<dyn Navigator>;

/// Substitute `{{name}}` placeholders in `template` from `variables`.
///
/// A string that is exactly one placeholder takes the variable's value as is
/// (keeping its JSON type). Placeholders embedded in longer strings are
/// replaced by the variable's string form. Unknown names are left untouched.
pub fn resolve_parameters(template: &Value, variables: &Variables) -> Value {
    match template {
        Value::String(s) => resolve_string(s, variables),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_parameters(item, variables))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_parameters(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, variables: &Variables) -> Value {
    if let Some(name) = whole_placeholder(s)
        && let Some(value) = variables.get(name)
    {
        return value.clone();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        let name = rest[open + 2..open + 2 + close].trim();
        out.push_str(&rest[..open]);
        match variables.get(name) {
            Some(Value::String(v)) => out.push_str(v),
            Some(v) => out.push_str(&v.to_string()),
            None => out.push_str(&rest[open..open + 4 + close]),
        }
        rest = &rest[open + 4 + close..];
    }
    out.push_str(rest);
    Value::String(out)
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    (!inner.contains("{{") && !inner.contains("}}")).then(|| inner.trim())
}
