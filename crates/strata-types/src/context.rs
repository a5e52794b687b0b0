//! Execution context threaded through navigation.
//!
//! An [`ExecutionContext`] is owned by exactly one execution. Navigators
//! mutate it in place; subprocess entry and exit push and pop scoped
//! [`SubprocessContext`] entries on its stack.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ExecutionId, SubprocessContextId};
use crate::location::AbstractLocation;

/// Variable bindings (name → value). Order is irrelevant.
pub type Variables = HashMap<String, Value>;

/// Variable under which propagated subprocess errors are collected.
pub const ERRORS_VARIABLE: &str = "errors";

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of event that can trigger an event subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Message,
    Signal,
    Error,
    Timer,
    Escalation,
}

/// An event trigger: a kind plus the name/code it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTrigger {
    pub kind: TriggerKind,
    pub reference: String,
}

impl EventTrigger {
    pub fn new(kind: TriggerKind, reference: impl Into<String>) -> Self {
        Self {
            kind,
            reference: reference.into(),
        }
    }
}

/// A trigger an event subprocess is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub trigger: EventTrigger,
    pub subprocess_id: String,
    pub registered_at: DateTime<Utc>,
}

/// Event bookkeeping for one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventState {
    /// Events currently being handled.
    pub active: Vec<EventTrigger>,
    /// Triggers registered by waiting event subprocesses.
    pub pending: Vec<PendingEvent>,
    /// Events that have fired and not yet been consumed.
    pub fired: Vec<EventTrigger>,
}

impl EventState {
    /// Whether `trigger` has fired.
    pub fn has_fired(&self, trigger: &EventTrigger) -> bool {
        self.fired.contains(trigger)
    }

    /// Move a fired trigger into the active set.
    pub fn consume(&mut self, trigger: &EventTrigger) -> bool {
        match self.fired.iter().position(|t| t == trigger) {
            Some(idx) => {
                let trigger = self.fired.remove(idx);
                self.pending.retain(|p| p.trigger != trigger);
                self.active.push(trigger);
                true
            }
            None => false,
        }
    }

    /// Register a waiting trigger once per subprocess.
    pub fn register_pending(&mut self, trigger: EventTrigger, subprocess_id: &str) {
        let already = self
            .pending
            .iter()
            .any(|p| p.trigger == trigger && p.subprocess_id == subprocess_id);
        if !already {
            self.pending.push(PendingEvent {
                trigger,
                subprocess_id: subprocess_id.to_string(),
                registered_at: Utc::now(),
            });
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parallel branches
// ─────────────────────────────────────────────────────────────────────────────

/// One active parallel branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub gateway_id: String,
    pub started_at: DateTime<Utc>,
}

/// Parallel-branch bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelState {
    pub active_branches: Vec<Branch>,
    pub completed_branches: Vec<String>,
    /// Join gateway id → number of tokens that have arrived.
    pub join_arrivals: HashMap<String, u32>,
}

impl ParallelState {
    /// Record a token arriving at a join. Returns the arrival count.
    pub fn arrive(&mut self, gateway_id: &str) -> u32 {
        let count = self.join_arrivals.entry(gateway_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset the join once it has fired.
    pub fn reset_join(&mut self, gateway_id: &str) {
        self.join_arrivals.remove(gateway_id);
    }

    /// Move a branch from active to completed.
    pub fn complete_branch(&mut self, branch_id: &str) {
        if let Some(idx) = self.active_branches.iter().position(|b| b.id == branch_id) {
            let branch = self.active_branches.remove(idx);
            self.completed_branches.push(branch.id);
        }
    }
}

/// Per-gateway state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayState {
    pub activations: u32,
    /// Flow targets taken on the last activation.
    pub last_taken: Vec<String>,
}

/// A compensation handler registered by a transaction or activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationHandler {
    pub activity_id: String,
    pub handler_id: String,
    pub subprocess_context_id: Option<SubprocessContextId>,
    pub registered_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Subprocesses
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of subprocess an activation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubprocessKind {
    Embedded,
    CallActivity,
    Event,
    Transaction,
    AdHoc,
}

impl std::fmt::Display for SubprocessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubprocessKind::Embedded => write!(f, "embedded"),
            SubprocessKind::CallActivity => write!(f, "call_activity"),
            SubprocessKind::Event => write!(f, "event"),
            SubprocessKind::Transaction => write!(f, "transaction"),
            SubprocessKind::AdHoc => write!(f, "ad_hoc"),
        }
    }
}

/// Lifecycle status of an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubprocessStatus {
    Active,
    Completed,
    Failed,
}

/// Ad-hoc subprocess progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdHocProgress {
    pub enabled: Vec<String>,
    pub completed: Vec<String>,
}

impl AdHocProgress {
    /// Whether every enabled activity has completed.
    pub fn all_completed(&self) -> bool {
        self.enabled.iter().all(|a| self.completed.contains(a))
    }
}

/// One active (or finished) subprocess activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubprocessContext {
    pub id: SubprocessContextId,
    pub subprocess_id: String,
    pub kind: SubprocessKind,
    pub parent_process_id: String,
    pub parent_location: AbstractLocation,
    /// Scoped copy (embedded) or mapped subset (call activity) of the
    /// parent's variables.
    pub variables: Variables,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SubprocessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub called_element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_hoc: Option<AdHocProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SubprocessContext {
    /// Start a new activation.
    pub fn start(
        subprocess_id: impl Into<String>,
        kind: SubprocessKind,
        parent_process_id: impl Into<String>,
        parent_location: AbstractLocation,
        variables: Variables,
    ) -> Self {
        Self {
            id: SubprocessContextId::new(),
            subprocess_id: subprocess_id.into(),
            kind,
            parent_process_id: parent_process_id.into(),
            parent_location,
            variables,
            started_at: Utc::now(),
            completed_at: None,
            status: SubprocessStatus::Active,
            called_element: None,
            ad_hoc: None,
            failure_reason: None,
        }
    }

    /// Stamp completion.
    pub fn finish(&mut self, status: SubprocessStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// The subprocess stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubprocessState {
    /// Active activations, outermost first.
    pub active: Vec<SubprocessContext>,
    pub completed: Vec<SubprocessContext>,
}

impl SubprocessState {
    /// Nesting depth.
    pub fn depth(&self) -> usize {
        self.active.len()
    }

    /// Innermost active activation of the given subprocess element.
    pub fn find_active(&self, subprocess_id: &str) -> Option<&SubprocessContext> {
        self.active
            .iter()
            .rev()
            .find(|s| s.subprocess_id == subprocess_id)
    }

    /// Active activation by id.
    pub fn get(&self, id: SubprocessContextId) -> Option<&SubprocessContext> {
        self.active.iter().find(|s| s.id == id)
    }

    /// Mutable active activation by id.
    pub fn get_mut(&mut self, id: SubprocessContextId) -> Option<&mut SubprocessContext> {
        self.active.iter_mut().find(|s| s.id == id)
    }

    /// Remove an active activation by id.
    pub fn pop(&mut self, id: SubprocessContextId) -> Option<SubprocessContext> {
        let idx = self.active.iter().position(|s| s.id == id)?;
        Some(self.active.remove(idx))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ExecutionContext
// ─────────────────────────────────────────────────────────────────────────────

/// Full mutable state of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub routine_id: String,
    pub variables: Variables,
    #[serde(default)]
    pub events: EventState,
    #[serde(default)]
    pub parallel: ParallelState,
    #[serde(default)]
    pub subprocesses: SubprocessState,
    #[serde(default)]
    pub gateway_states: HashMap<String, GatewayState>,
    #[serde(default)]
    pub compensation_handlers: Vec<CompensationHandler>,
    /// Loop and multi-instance counters by activity id.
    #[serde(default)]
    pub loop_counters: HashMap<String, u32>,
}

impl ExecutionContext {
    /// Create an empty context for a routine.
    pub fn new(routine_id: impl Into<String>) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            routine_id: routine_id.into(),
            variables: Variables::new(),
            events: EventState::default(),
            parallel: ParallelState::default(),
            subprocesses: SubprocessState::default(),
            gateway_states: HashMap::new(),
            compensation_handlers: Vec::new(),
            loop_counters: HashMap::new(),
        }
    }

    /// Seed root variables.
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Use a specific execution id.
    pub fn with_execution_id(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = execution_id;
        self
    }

    /// Subprocess nesting depth.
    pub fn depth(&self) -> usize {
        self.subprocesses.depth()
    }

    /// Variables of `scope` (an activation id), or root variables for `None`.
    pub fn scope_variables(&self, scope: Option<SubprocessContextId>) -> &Variables {
        scope
            .and_then(|id| self.subprocesses.get(id))
            .map(|s| &s.variables)
            .unwrap_or(&self.variables)
    }

    /// Mutable variables of `scope`, falling back to root variables.
    pub fn scope_variables_mut(&mut self, scope: Option<SubprocessContextId>) -> &mut Variables {
        if let Some(sub) = scope.and_then(|id| self.subprocesses.get_mut(id)) {
            return &mut sub.variables;
        }
        &mut self.variables
    }

    /// Set a variable in the given scope.
    pub fn set_variable(
        &mut self,
        scope: Option<SubprocessContextId>,
        name: impl Into<String>,
        value: Value,
    ) {
        self.scope_variables_mut(scope).insert(name.into(), value);
    }

    /// Variables visible from `scope`: root variables overlaid with every
    /// enclosing activation, innermost last.
    pub fn variables_in_scope(&self, scope: Option<SubprocessContextId>) -> Variables {
        let mut chain = Vec::new();
        let mut current = scope;
        while let Some(id) = current {
            let Some(sub) = self.subprocesses.get(id) else {
                break;
            };
            if chain.len() >= self.subprocesses.active.len() {
                break;
            }
            chain.push(sub);
            current = sub.parent_location.metadata.subprocess_context_id;
        }

        let mut merged = self.variables.clone();
        for sub in chain.into_iter().rev() {
            merged.extend(sub.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    /// Append an error entry to the `errors` variable of `scope`.
    pub fn record_error(&mut self, scope: Option<SubprocessContextId>, error: Value) {
        let vars = self.scope_variables_mut(scope);
        match vars.get_mut(ERRORS_VARIABLE) {
            Some(Value::Array(errors)) => errors.push(error),
            _ => {
                vars.insert(ERRORS_VARIABLE.to_string(), Value::Array(vec![error]));
            }
        }
    }

    /// Count one more completion of `activity_id` and return the total.
    pub fn bump_loop_counter(&mut self, activity_id: &str) -> u32 {
        let counter = self.loop_counters.entry(activity_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}
