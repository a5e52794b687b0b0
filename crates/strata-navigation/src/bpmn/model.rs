//! Workflow graph model.
//!
//! A [`BpmnModel`] is a flat list of elements plus the sequence flows between
//! them. Nesting is expressed through each element's `parent`: an element
//! whose parent is a subprocess lives inside that subprocess's scope.
//!
//! # Example JSON
//!
//! ```json
//! {
//!   "id": "main",
//!   "elements": [
//!     { "id": "Start", "type": "start_event" },
//!     { "id": "Fetch", "type": "service_task", "tool": "echo",
//!       "parameters": { "url": "{{url}}" }, "result_variable": "page" },
//!     { "id": "End", "type": "end_event" }
//!   ],
//!   "flows": [
//!     { "id": "f1", "source": "Start", "target": "Fetch" },
//!     { "id": "f2", "source": "Fetch", "target": "End" }
//!   ]
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_types::{
    AbstractLocation, EventTrigger, LocationMetadata, LocationType, SubprocessKind, Variables,
};

use crate::error::{NavigationError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Conditions
// ─────────────────────────────────────────────────────────────────────────────

/// Comparison applied by a flow condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    /// The variable is set and truthy; `value` is ignored.
    #[default]
    Truthy,
    Is,
    IsNot,
    GreaterThan,
    LessThan,
    /// String contains substring, or array contains element.
    Contains,
    Empty,
    NotEmpty,
}

/// Condition guarding a sequence flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCondition {
    pub variable: String,
    #[serde(default)]
    pub operator: ComparisonOperator,
    #[serde(default)]
    pub value: Value,
}

impl FlowCondition {
    /// A condition that holds when `variable` is truthy.
    pub fn truthy(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            operator: ComparisonOperator::Truthy,
            value: Value::Null,
        }
    }

    pub fn compare(variable: impl Into<String>, operator: ComparisonOperator, value: Value) -> Self {
        Self {
            variable: variable.into(),
            operator,
            value,
        }
    }

    /// Evaluate against a variable set.
    pub fn evaluate(&self, variables: &Variables) -> bool {
        let actual = variables.get(&self.variable);
        match self.operator {
            ComparisonOperator::Truthy => actual.is_some_and(is_truthy),
            ComparisonOperator::Is => actual.is_some_and(|a| values_equal(a, &self.value)),
            ComparisonOperator::IsNot => !actual.is_some_and(|a| values_equal(a, &self.value)),
            ComparisonOperator::GreaterThan => {
                matches!((actual.and_then(Value::as_f64), self.value.as_f64()), (Some(a), Some(b)) if a > b)
            }
            ComparisonOperator::LessThan => {
                matches!((actual.and_then(Value::as_f64), self.value.as_f64()), (Some(a), Some(b)) if a < b)
            }
            ComparisonOperator::Contains => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => items.iter().any(|i| values_equal(i, needle)),
                _ => false,
            },
            ComparisonOperator::Empty => actual.is_none_or(is_empty),
            ComparisonOperator::NotEmpty => !actual.is_none_or(is_empty),
        }
    }
}

/// Truthiness of a JSON value: `null`, `false`, `0`, `""`, `[]` and `{}` are
/// false.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Elements
// ─────────────────────────────────────────────────────────────────────────────

/// A task that runs a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTask {
    pub tool: String,
    /// Tool parameters; `{{name}}` placeholders are filled from variables.
    #[serde(default)]
    pub parameters: Value,
    /// Variable the tool output is stored in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_variable: Option<String>,
}

/// Order in which an ad-hoc subprocess enables its activities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdHocOrdering {
    #[default]
    Parallel,
    Sequential,
}

/// Copies `source` in one scope to `target` in another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableMapping {
    pub source: String,
    pub target: String,
}

impl VariableMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// What an element is, with the fields relevant to that kind only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    StartEvent,
    EndEvent {
        /// Error raised when this end event is reached.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    /// A task with nothing to execute.
    Task,
    ServiceTask(ServiceTask),
    ExclusiveGateway {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_flow: Option<String>,
    },
    ParallelGateway,
    /// Embedded subprocess sharing the parent's process instance.
    SubProcess,
    EventSubProcess {
        trigger: EventTrigger,
        #[serde(default = "default_interrupting")]
        interrupting: bool,
    },
    Transaction {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compensation_handler: Option<String>,
    },
    AdHocSubProcess {
        #[serde(default)]
        ordering: AdHocOrdering,
        /// Variable that completes the subprocess once truthy.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completion_condition: Option<String>,
    },
    CallActivity {
        called_element: String,
        /// `None` copies every parent variable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_mapping: Option<Vec<VariableMapping>>,
        /// `None` copies every child variable back.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_mapping: Option<Vec<VariableMapping>>,
    },
}

fn default_interrupting() -> bool {
    true
}

impl ElementKind {
    /// Subprocess kind, if this element is any kind of subprocess.
    pub fn subprocess_kind(&self) -> Option<SubprocessKind> {
        match self {
            ElementKind::SubProcess => Some(SubprocessKind::Embedded),
            ElementKind::EventSubProcess { .. } => Some(SubprocessKind::Event),
            ElementKind::Transaction { .. } => Some(SubprocessKind::Transaction),
            ElementKind::AdHocSubProcess { .. } => Some(SubprocessKind::AdHoc),
            ElementKind::CallActivity { .. } => Some(SubprocessKind::CallActivity),
            _ => None,
        }
    }

    /// Whether elements can be nested inside this one.
    pub fn is_container(&self) -> bool {
        matches!(
            self.subprocess_kind(),
            Some(kind) if kind != SubprocessKind::CallActivity
        )
    }
}

/// One node of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BpmnElement {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Containing subprocess; `None` at the top level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(flatten)]
    pub kind: ElementKind,
}

impl BpmnElement {
    pub fn new(id: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            parent: None,
            kind,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn inside(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn is_start_event(&self) -> bool {
        matches!(self.kind, ElementKind::StartEvent)
    }

    pub fn is_end_event(&self) -> bool {
        matches!(self.kind, ElementKind::EndEvent { .. })
    }
}

/// Directed edge between two elements of the same scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<FlowCondition>,
}

impl SequenceFlow {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: FlowCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    fn is_enabled(&self, variables: &Variables) -> bool {
        self.condition.as_ref().is_none_or(|c| c.evaluate(variables))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Model
// ─────────────────────────────────────────────────────────────────────────────

/// Serialized form of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelDocument {
    id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    elements: Vec<BpmnElement>,
    #[serde(default)]
    flows: Vec<SequenceFlow>,
}

/// An indexed workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "ModelDocument", into = "ModelDocument")]
pub struct BpmnModel {
    id: String,
    name: String,
    elements: Vec<BpmnElement>,
    flows: Vec<SequenceFlow>,
    element_index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
}

impl From<ModelDocument> for BpmnModel {
    fn from(doc: ModelDocument) -> Self {
        let mut model = BpmnModel::new(doc.id, doc.elements, doc.flows);
        model.name = doc.name;
        model
    }
}

impl From<BpmnModel> for ModelDocument {
    fn from(model: BpmnModel) -> Self {
        ModelDocument {
            id: model.id,
            name: model.name,
            elements: model.elements,
            flows: model.flows,
        }
    }
}

impl BpmnModel {
    /// Build and index a model. Call [`validate`](Self::validate) before
    /// navigating a model that did not come from [`from_json`](Self::from_json).
    pub fn new(id: impl Into<String>, elements: Vec<BpmnElement>, flows: Vec<SequenceFlow>) -> Self {
        let mut element_index = HashMap::with_capacity(elements.len());
        for (idx, element) in elements.iter().enumerate() {
            element_index.entry(element.id.clone()).or_insert(idx);
        }
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, flow) in flows.iter().enumerate() {
            outgoing.entry(flow.source.clone()).or_default().push(idx);
            incoming.entry(flow.target.clone()).or_default().push(idx);
        }
        Self {
            id: id.into(),
            name: String::new(),
            elements,
            flows,
            element_index,
            outgoing,
            incoming,
        }
    }

    /// Parse and validate a model from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let model: BpmnModel = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    /// Load and validate a model from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| NavigationError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Routine id of this model.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elements(&self) -> &[BpmnElement] {
        &self.elements
    }

    pub fn flows(&self) -> &[SequenceFlow] {
        &self.flows
    }

    /// Look up an element by id.
    pub fn element(&self, id: &str) -> Option<&BpmnElement> {
        self.element_index.get(id).map(|&idx| &self.elements[idx])
    }

    /// Look up an element, failing with `ElementNotFound`.
    pub fn require(&self, id: &str) -> Result<&BpmnElement> {
        self.element(id)
            .ok_or_else(|| NavigationError::ElementNotFound(id.to_string()))
    }

    /// Flows leaving `id`, in declaration order.
    pub fn outgoing_flows(&self, id: &str) -> Vec<&SequenceFlow> {
        self.flows_at(&self.outgoing, id)
    }

    /// Flows entering `id`, in declaration order.
    pub fn incoming_flows(&self, id: &str) -> Vec<&SequenceFlow> {
        self.flows_at(&self.incoming, id)
    }

    fn flows_at(&self, index: &HashMap<String, Vec<usize>>, id: &str) -> Vec<&SequenceFlow> {
        index
            .get(id)
            .map(|idxs| idxs.iter().map(|&i| &self.flows[i]).collect())
            .unwrap_or_default()
    }

    /// Elements directly inside the subprocess `subprocess_id`.
    pub fn subprocess_elements(&self, subprocess_id: &str) -> Vec<&BpmnElement> {
        self.elements
            .iter()
            .filter(|e| e.parent.as_deref() == Some(subprocess_id))
            .collect()
    }

    /// Start event of a scope (`None` for the top level).
    pub fn start_event(&self, container: Option<&str>) -> Option<&BpmnElement> {
        self.elements
            .iter()
            .find(|e| e.is_start_event() && e.parent.as_deref() == container)
    }

    /// A location in this routine.
    pub fn create_location(
        &self,
        node_id: impl Into<String>,
        location_type: LocationType,
        metadata: LocationMetadata,
    ) -> AbstractLocation {
        AbstractLocation::node(self.id.clone(), node_id)
            .with_type(location_type)
            .with_metadata(metadata)
    }

    /// Flows to follow when leaving `element_id`.
    ///
    /// An exclusive gateway takes the first enabled non-default flow, or its
    /// default flow, and fails when neither exists. Every other element takes
    /// all flows whose condition holds.
    pub fn select_flows(&self, element_id: &str, variables: &Variables) -> Result<Vec<&SequenceFlow>> {
        let element = self.require(element_id)?;
        let flows = self.outgoing_flows(element_id);

        if let ElementKind::ExclusiveGateway { default_flow } = &element.kind {
            let default_flow = default_flow.as_deref();
            let chosen = flows
                .iter()
                .find(|f| Some(f.id.as_str()) != default_flow && f.is_enabled(variables))
                .or_else(|| flows.iter().find(|f| Some(f.id.as_str()) == default_flow));
            return match chosen {
                Some(flow) => Ok(vec![*flow]),
                None if flows.is_empty() => Ok(Vec::new()),
                None => Err(NavigationError::NoMatchingFlow(element_id.to_string())),
            };
        }

        Ok(flows.into_iter().filter(|f| f.is_enabled(variables)).collect())
    }

    /// Check the model is well formed.
    ///
    /// Checks:
    /// - unique element and flow ids
    /// - flows connect existing elements of the same scope
    /// - parents exist, are containers, and do not form cycles
    /// - a top-level start event exists
    /// - embedded, event and transaction subprocesses have a start event
    /// - gateway default flows leave their gateway
    /// - call activities name the routine they call
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(NavigationError::invalid("Model id cannot be empty"));
        }
        if self.element_index.len() != self.elements.len() {
            let mut seen = HashSet::new();
            let duplicate = self
                .elements
                .iter()
                .find(|e| !seen.insert(e.id.as_str()))
                .map(|e| e.id.clone())
                .unwrap_or_default();
            return Err(NavigationError::invalid(format!(
                "Duplicate element id: {duplicate}"
            )));
        }

        let mut flow_ids = HashSet::new();
        for flow in &self.flows {
            if !flow_ids.insert(flow.id.as_str()) {
                return Err(NavigationError::invalid(format!(
                    "Duplicate flow id: {}",
                    flow.id
                )));
            }
            let source = self.element(&flow.source).ok_or_else(|| {
                NavigationError::invalid(format!(
                    "Flow '{}' leaves unknown element '{}'",
                    flow.id, flow.source
                ))
            })?;
            let target = self.element(&flow.target).ok_or_else(|| {
                NavigationError::invalid(format!(
                    "Flow '{}' enters unknown element '{}'",
                    flow.id, flow.target
                ))
            })?;
            if source.parent != target.parent {
                return Err(NavigationError::invalid(format!(
                    "Flow '{}' crosses a subprocess boundary",
                    flow.id
                )));
            }
        }

        for element in &self.elements {
            self.validate_parent_chain(element)?;

            match &element.kind {
                ElementKind::SubProcess
                | ElementKind::EventSubProcess { .. }
                | ElementKind::Transaction { .. } => {
                    if self.start_event(Some(&element.id)).is_none() {
                        return Err(NavigationError::MissingStartEvent(element.id.clone()));
                    }
                }
                ElementKind::ExclusiveGateway {
                    default_flow: Some(default),
                } => {
                    let leaves = self
                        .outgoing_flows(&element.id)
                        .iter()
                        .any(|f| &f.id == default);
                    if !leaves {
                        return Err(NavigationError::invalid(format!(
                            "Default flow '{default}' does not leave gateway '{}'",
                            element.id
                        )));
                    }
                }
                ElementKind::CallActivity { called_element, .. } if called_element.is_empty() => {
                    return Err(NavigationError::invalid(format!(
                        "Call activity '{}' has no called element",
                        element.id
                    )));
                }
                _ => {}
            }
        }

        if self.start_event(None).is_none() {
            return Err(NavigationError::MissingStartEvent(self.id.clone()));
        }
        Ok(())
    }

    fn validate_parent_chain(&self, element: &BpmnElement) -> Result<()> {
        let mut visited = HashSet::from([element.id.as_str()]);
        let mut current = element;
        while let Some(parent_id) = current.parent.as_deref() {
            let parent = self.element(parent_id).ok_or_else(|| {
                NavigationError::invalid(format!(
                    "Element '{}' is inside unknown element '{parent_id}'",
                    current.id
                ))
            })?;
            if !parent.kind.is_container() {
                return Err(NavigationError::invalid(format!(
                    "Element '{}' is inside '{parent_id}', which cannot contain elements",
                    current.id
                )));
            }
            if !visited.insert(parent_id) {
                return Err(NavigationError::invalid(format!(
                    "Element '{}' is nested inside itself",
                    element.id
                )));
            }
            current = parent;
        }
        Ok(())
    }
}
