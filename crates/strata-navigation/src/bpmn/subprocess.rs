//! Subprocess navigation.
//!
//! [`BpmnSubprocessHandler`] owns the lifecycle of subprocess activations:
//! entry (pushing a [`SubprocessContext`] on the execution context's stack),
//! navigation inside the subprocess, and completion (popping the activation
//! and handing its variables back to the parent scope).
//!
//! Variable scoping differs by kind. Embedded subprocesses, transactions,
//! event and ad-hoc subprocesses work on a copy of the parent scope that is
//! merged back whole on completion. Call activities copy or map their inputs
//! and map their outputs back; a missing mapping copies everything.

use chrono::Utc;
use serde_json::{Value, json};
use strata_types::{
    AbstractLocation, AdHocProgress, CompensationHandler, ERRORS_VARIABLE, EventTrigger,
    ExecutionContext, LocationMetadata, LocationType, SubprocessContext, SubprocessContextId,
    SubprocessKind, SubprocessStatus, TriggerKind, Variables,
};

use super::model::{AdHocOrdering, BpmnElement, BpmnModel, ElementKind, VariableMapping, is_truthy};
use crate::error::{NavigationError, Result};

/// Default cap on the subprocess stack.
pub const DEFAULT_MAX_SUBPROCESS_DEPTH: usize = 32;

/// Failure reason of activations cancelled by an interrupting event
/// subprocess.
const INTERRUPTED: &str = "interrupted";

/// Navigates subprocess elements of a [`BpmnModel`].
#[derive(Debug, Clone)]
pub struct BpmnSubprocessHandler {
    max_depth: usize,
}

impl Default for BpmnSubprocessHandler {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_SUBPROCESS_DEPTH,
        }
    }
}

impl BpmnSubprocessHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    // ─────────────────────────────────────────────────────────────────────
    // Entry
    // ─────────────────────────────────────────────────────────────────────

    /// Enter (or continue within) the subprocess `subprocess_id`.
    ///
    /// `location` is where the token currently is: the subprocess element
    /// itself when entering, or a node tagged with an existing activation of
    /// this subprocess, in which case navigation continues inside it.
    ///
    /// Returns the next locations. An event subprocess whose trigger has not
    /// fired registers itself as pending and returns nothing.
    pub fn process_subprocess(
        &self,
        model: &BpmnModel,
        subprocess_id: &str,
        location: &AbstractLocation,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let element = model
            .element(subprocess_id)
            .ok_or_else(|| NavigationError::SubprocessNotFound(subprocess_id.to_string()))?;
        let kind = element
            .kind
            .subprocess_kind()
            .ok_or_else(|| NavigationError::NotASubprocess(subprocess_id.to_string()))?;

        let already_inside = location.metadata.subprocess_id.as_deref() == Some(subprocess_id)
            && location
                .metadata
                .subprocess_context_id
                .is_some_and(|id| ctx.subprocesses.get(id).is_some());
        if already_inside {
            return self.navigate_within_subprocess(model, location, ctx);
        }

        match &element.kind {
            ElementKind::SubProcess | ElementKind::Transaction { .. } => {
                self.enter_scoped(model, element, kind, location, ctx)
            }
            ElementKind::CallActivity { called_element, input_mapping, .. } => self.enter_call(
                model,
                element,
                called_element,
                input_mapping.as_deref(),
                location,
                ctx,
            ),
            ElementKind::EventSubProcess {
                trigger,
                interrupting,
            } => {
                if !ctx.events.has_fired(trigger) {
                    tracing::debug!(
                        subprocess = subprocess_id,
                        trigger = %trigger.reference,
                        "Event subprocess waiting for trigger"
                    );
                    ctx.events.register_pending(trigger.clone(), subprocess_id);
                    return Ok(Vec::new());
                }
                ctx.events.consume(trigger);
                if *interrupting {
                    self.interrupt_scope(location.metadata.subprocess_context_id, ctx);
                }
                self.enter_scoped(model, element, kind, location, ctx)
            }
            ElementKind::AdHocSubProcess { ordering, .. } => {
                self.enter_ad_hoc(model, element, *ordering, location, ctx)
            }
            _ => Err(NavigationError::NotASubprocess(subprocess_id.to_string())),
        }
    }

    fn check_depth(&self, ctx: &ExecutionContext) -> Result<()> {
        let depth = ctx.depth();
        if depth >= self.max_depth {
            return Err(NavigationError::NestingTooDeep {
                depth,
                max: self.max_depth,
            });
        }
        Ok(())
    }

    fn start_activation(
        &self,
        element: &BpmnElement,
        kind: SubprocessKind,
        location: &AbstractLocation,
        variables: Variables,
        ctx: &mut ExecutionContext,
    ) -> Result<SubprocessContextId> {
        self.check_depth(ctx)?;
        let activation = SubprocessContext::start(
            element.id.clone(),
            kind,
            location.routine_id.clone(),
            location.clone(),
            variables,
        );
        let id = activation.id;
        tracing::debug!(
            subprocess = %element.id,
            %kind,
            activation = %id,
            depth = ctx.depth() + 1,
            "Subprocess started"
        );
        ctx.subprocesses.active.push(activation);
        Ok(id)
    }

    fn nested_location(
        model: &BpmnModel,
        node_id: &str,
        subprocess_id: &str,
        activation: SubprocessContextId,
        branch_id: Option<String>,
    ) -> AbstractLocation {
        model.create_location(
            node_id,
            LocationType::SubprocessContext,
            LocationMetadata {
                subprocess_id: Some(subprocess_id.to_string()),
                subprocess_context_id: Some(activation),
                called_element: None,
                branch_id,
            },
        )
    }

    fn enter_scoped(
        &self,
        model: &BpmnModel,
        element: &BpmnElement,
        kind: SubprocessKind,
        location: &AbstractLocation,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let start = model
            .start_event(Some(&element.id))
            .ok_or_else(|| NavigationError::MissingStartEvent(element.id.clone()))?;
        let variables = scoped_copy(ctx, location.metadata.subprocess_context_id);
        let id = self.start_activation(element, kind, location, variables, ctx)?;
        Ok(vec![Self::nested_location(
            model,
            &start.id,
            &element.id,
            id,
            location.metadata.branch_id.clone(),
        )])
    }

    fn enter_call(
        &self,
        model: &BpmnModel,
        element: &BpmnElement,
        called_element: &str,
        input_mapping: Option<&[VariableMapping]>,
        location: &AbstractLocation,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let parent = ctx.variables_in_scope(location.metadata.subprocess_context_id);
        let variables = apply_mapping(&parent, input_mapping);
        let id = self.start_activation(element, SubprocessKind::CallActivity, location, variables, ctx)?;
        if let Some(activation) = ctx.subprocesses.get_mut(id) {
            activation.called_element = Some(called_element.to_string());
        }

        Ok(vec![model.create_location(
            element.id.clone(),
            LocationType::CallActivity,
            LocationMetadata {
                subprocess_id: Some(element.id.clone()),
                subprocess_context_id: Some(id),
                called_element: Some(called_element.to_string()),
                branch_id: location.metadata.branch_id.clone(),
            },
        )])
    }

    fn enter_ad_hoc(
        &self,
        model: &BpmnModel,
        element: &BpmnElement,
        ordering: AdHocOrdering,
        location: &AbstractLocation,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let enabled: Vec<String> = model
            .subprocess_elements(&element.id)
            .into_iter()
            .filter(|child| {
                !child.is_start_event()
                    && !child.is_end_event()
                    && !matches!(child.kind, ElementKind::EventSubProcess { .. })
                    && model.incoming_flows(&child.id).is_empty()
            })
            .map(|child| child.id.clone())
            .collect();

        let variables = scoped_copy(ctx, location.metadata.subprocess_context_id);
        let id = self.start_activation(element, SubprocessKind::AdHoc, location, variables, ctx)?;
        if let Some(activation) = ctx.subprocesses.get_mut(id) {
            activation.ad_hoc = Some(AdHocProgress {
                enabled: enabled.clone(),
                completed: Vec::new(),
            });
        }

        if enabled.is_empty() {
            return self.finish_activation(model, id, ctx);
        }

        let targets = match ordering {
            AdHocOrdering::Parallel => enabled,
            AdHocOrdering::Sequential => enabled.into_iter().take(1).collect(),
        };
        Ok(targets
            .iter()
            .map(|t| {
                Self::nested_location(model, t, &element.id, id, location.metadata.branch_id.clone())
            })
            .collect())
    }

    /// Cancel every activation in `scope` and everything nested inside them.
    fn interrupt_scope(&self, scope: Option<SubprocessContextId>, ctx: &mut ExecutionContext) {
        let mut cancelled: Vec<SubprocessContextId> = Vec::new();
        loop {
            let next: Vec<SubprocessContextId> = ctx
                .subprocesses
                .active
                .iter()
                .filter(|s| !cancelled.contains(&s.id))
                .filter(|s| {
                    let parent = s.parent_location.metadata.subprocess_context_id;
                    parent == scope || parent.is_some_and(|p| cancelled.contains(&p))
                })
                .map(|s| s.id)
                .collect();
            if next.is_empty() {
                break;
            }
            cancelled.extend(next);
        }

        for id in cancelled {
            if let Some(mut activation) = ctx.subprocesses.pop(id) {
                tracing::info!(
                    subprocess = %activation.subprocess_id,
                    activation = %id,
                    "Subprocess interrupted"
                );
                activation.failure_reason = Some(INTERRUPTED.to_string());
                activation.finish(SubprocessStatus::Failed);
                ctx.subprocesses.completed.push(activation);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Navigation
    // ─────────────────────────────────────────────────────────────────────

    /// Follow the outgoing flows of a node inside a subprocess.
    ///
    /// Every produced location is tagged `subprocess_context` with the owning
    /// subprocess and activation.
    pub fn navigate_within_subprocess(
        &self,
        model: &BpmnModel,
        location: &AbstractLocation,
        ctx: &ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let metadata = Self::owner_metadata(model, location, ctx)?;
        let variables = ctx.variables_in_scope(metadata.subprocess_context_id);
        let flows = model.select_flows(&location.node_id, &variables)?;
        Ok(flows
            .into_iter()
            .map(|flow| {
                model.create_location(
                    flow.target.clone(),
                    LocationType::SubprocessContext,
                    metadata.clone(),
                )
            })
            .collect())
    }

    /// Subprocess tagging for `location`: its own when present, otherwise
    /// the innermost active activation of the element's container.
    fn owner_metadata(
        model: &BpmnModel,
        location: &AbstractLocation,
        ctx: &ExecutionContext,
    ) -> Result<LocationMetadata> {
        if location.metadata.subprocess_context_id.is_some() {
            return Ok(location.metadata.clone());
        }
        let element = model.require(&location.node_id)?;
        let mut metadata = location.metadata.clone();
        if let Some(parent) = element.parent.as_deref()
            && let Some(activation) = ctx.subprocesses.find_active(parent)
        {
            metadata.subprocess_id = Some(parent.to_string());
            metadata.subprocess_context_id = Some(activation.id);
        }
        Ok(metadata)
    }

    /// Arm the event subprocesses of a scope.
    ///
    /// Called when a scope starts: each event subprocess directly inside
    /// `container` either starts (its trigger already fired) or registers
    /// as pending.
    pub fn arm_event_subprocesses(
        &self,
        model: &BpmnModel,
        container: Option<&str>,
        scope_location: &AbstractLocation,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let event_subprocesses: Vec<String> = model
            .elements()
            .iter()
            .filter(|e| e.parent.as_deref() == container)
            .filter(|e| matches!(e.kind, ElementKind::EventSubProcess { .. }))
            .map(|e| e.id.clone())
            .collect();

        let mut next = Vec::new();
        for id in event_subprocesses {
            let at = scope_location.sibling(id.clone());
            next.extend(self.process_subprocess(model, &id, &at, ctx)?);
        }
        Ok(next)
    }

    /// Start every pending event subprocess whose trigger has fired.
    ///
    /// Pending entries whose scope is no longer active are dropped.
    pub fn start_triggered(
        &self,
        model: &BpmnModel,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let ready: Vec<String> = ctx
            .events
            .pending
            .iter()
            .filter(|p| ctx.events.has_fired(&p.trigger))
            .map(|p| p.subprocess_id.clone())
            .collect();

        let mut next = Vec::new();
        for subprocess_id in ready {
            let element = model.require(&subprocess_id)?;
            let scope_location = match element.parent.as_deref() {
                None => AbstractLocation::node(model.id(), subprocess_id.clone()),
                Some(parent) => match ctx.subprocesses.find_active(parent) {
                    Some(activation) => Self::nested_location(
                        model,
                        &subprocess_id,
                        parent,
                        activation.id,
                        None,
                    ),
                    None => {
                        ctx.events.pending.retain(|p| p.subprocess_id != subprocess_id);
                        continue;
                    }
                },
            };
            next.extend(self.process_subprocess(model, &subprocess_id, &scope_location, ctx)?);
        }
        Ok(next)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Completion
    // ─────────────────────────────────────────────────────────────────────

    /// Complete the subprocess owning the end event at `location`.
    ///
    /// Returns `None` when `location` is not an end event inside a tracked
    /// active subprocess. Otherwise pops the activation, merges its variables
    /// into the parent scope, propagates errors and returns the outgoing
    /// flows of the subprocess element.
    pub fn complete_subprocess(
        &self,
        model: &BpmnModel,
        location: &AbstractLocation,
        ctx: &mut ExecutionContext,
    ) -> Result<Option<Vec<AbstractLocation>>> {
        let element = model.require(&location.node_id)?;
        let ElementKind::EndEvent { error_code } = &element.kind else {
            return Ok(None);
        };
        let Some(owner) = element.parent.as_deref() else {
            return Ok(None);
        };

        let tagged = location
            .metadata
            .subprocess_context_id
            .filter(|id| {
                ctx.subprocesses
                    .get(*id)
                    .is_some_and(|a| a.subprocess_id == owner)
            });
        let Some(id) = tagged.or_else(|| ctx.subprocesses.find_active(owner).map(|a| a.id)) else {
            tracing::warn!(end_event = %element.id, subprocess = owner, "No active subprocess for end event");
            return Ok(None);
        };

        if let Some(code) = error_code {
            ctx.record_error(
                Some(id),
                json!({ "code": code, "element": element.id, "subprocess": owner }),
            );
            ctx.events
                .fired
                .push(EventTrigger::new(TriggerKind::Error, code.clone()));
        }

        self.finish_activation(model, id, ctx).map(Some)
    }

    /// Complete a call activity whose called routine produced `outputs`.
    pub fn complete_call_activity(
        &self,
        model: &BpmnModel,
        context_id: SubprocessContextId,
        outputs: Variables,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let activation = ctx
            .subprocesses
            .get(context_id)
            .ok_or(NavigationError::UnknownActivation(context_id))?;
        if activation.kind != SubprocessKind::CallActivity {
            return Err(NavigationError::NotASubprocess(activation.subprocess_id.clone()));
        }
        let element = model.require(&activation.subprocess_id)?;
        let ElementKind::CallActivity { output_mapping, .. } = &element.kind else {
            return Err(NavigationError::NotASubprocess(element.id.clone()));
        };

        let Some(mut activation) = ctx.subprocesses.pop(context_id) else {
            return Err(NavigationError::UnknownActivation(context_id));
        };
        activation.variables.extend(outputs);
        let parent_scope = activation.parent_location.metadata.subprocess_context_id;
        let mapped = apply_mapping(&activation.variables, output_mapping.as_deref());
        ctx.scope_variables_mut(parent_scope).extend(mapped);

        activation.finish(SubprocessStatus::Completed);
        tracing::debug!(
            subprocess = %activation.subprocess_id,
            activation = %context_id,
            "Call activity completed"
        );
        let next = Self::leave(model, &activation, ctx)?;
        ctx.subprocesses.completed.push(activation);
        Ok(next)
    }

    /// Mark a call activity failed without producing next locations.
    pub fn fail_call_activity(
        &self,
        context_id: SubprocessContextId,
        reason: impl Into<String>,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let mut activation = ctx
            .subprocesses
            .pop(context_id)
            .ok_or(NavigationError::UnknownActivation(context_id))?;
        activation.failure_reason = Some(reason.into());
        activation.finish(SubprocessStatus::Failed);
        ctx.subprocesses.completed.push(activation);
        Ok(())
    }

    /// Record completion of an ad-hoc activity at `location`.
    ///
    /// Returns `None` when `location` is not inside an ad-hoc activation.
    /// Completes the subprocess once its completion condition holds or every
    /// enabled activity finished; a sequential subprocess otherwise moves on
    /// to its next activity.
    pub fn advance_ad_hoc(
        &self,
        model: &BpmnModel,
        location: &AbstractLocation,
        ctx: &mut ExecutionContext,
    ) -> Result<Option<Vec<AbstractLocation>>> {
        let Some(id) = location.metadata.subprocess_context_id else {
            return Ok(None);
        };
        let (subprocess_id, enabled) = match ctx.subprocesses.get(id) {
            Some(activation) => match &activation.ad_hoc {
                Some(progress) => (activation.subprocess_id.clone(), progress.enabled.clone()),
                None => return Ok(None),
            },
            None => return Ok(None),
        };

        let finished = enabled_root(model, &location.node_id, &enabled);
        let all_done = {
            let Some(progress) = ctx
                .subprocesses
                .get_mut(id)
                .and_then(|a| a.ad_hoc.as_mut())
            else {
                return Ok(None);
            };
            if let Some(activity) = finished
                && !progress.completed.contains(&activity)
            {
                progress.completed.push(activity);
            }
            progress.all_completed()
        };

        let element = model.require(&subprocess_id)?;
        let ElementKind::AdHocSubProcess {
            ordering,
            completion_condition,
        } = &element.kind
        else {
            return Ok(None);
        };
        let condition_met = completion_condition.as_deref().is_some_and(|var| {
            ctx.variables_in_scope(Some(id))
                .get(var)
                .is_some_and(is_truthy)
        });

        if condition_met || all_done {
            return self.finish_activation(model, id, ctx).map(Some);
        }

        match ordering {
            AdHocOrdering::Parallel => Ok(Some(Vec::new())),
            AdHocOrdering::Sequential => {
                let completed = ctx
                    .subprocesses
                    .get(id)
                    .and_then(|a| a.ad_hoc.as_ref())
                    .map(|p| p.completed.clone())
                    .unwrap_or_default();
                let next = enabled.iter().find(|a| !completed.contains(a));
                Ok(Some(
                    next.map(|a| vec![location.sibling(a.clone())])
                        .unwrap_or_default(),
                ))
            }
        }
    }

    /// Pop a scoped activation, merge its variables into the parent scope and
    /// return the subprocess element's outgoing locations.
    fn finish_activation(
        &self,
        model: &BpmnModel,
        id: SubprocessContextId,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let mut activation = ctx
            .subprocesses
            .pop(id)
            .ok_or(NavigationError::UnknownActivation(id))?;
        let parent_scope = activation.parent_location.metadata.subprocess_context_id;

        let errors = match activation.variables.get(ERRORS_VARIABLE) {
            Some(Value::Array(errors)) => errors.clone(),
            _ => Vec::new(),
        };
        {
            let parent = ctx.scope_variables_mut(parent_scope);
            for (name, value) in &activation.variables {
                if name != ERRORS_VARIABLE {
                    parent.insert(name.clone(), value.clone());
                }
            }
        }
        for error in &errors {
            ctx.record_error(parent_scope, error.clone());
        }

        let element = model.require(&activation.subprocess_id)?;
        let status = match &element.kind {
            ElementKind::Transaction {
                compensation_handler,
            } if !errors.is_empty() => {
                if let Some(handler) = compensation_handler {
                    ctx.compensation_handlers.push(CompensationHandler {
                        activity_id: element.id.clone(),
                        handler_id: handler.clone(),
                        subprocess_context_id: Some(id),
                        registered_at: Utc::now(),
                    });
                }
                activation.failure_reason =
                    Some(format!("transaction failed with {} error(s)", errors.len()));
                SubprocessStatus::Failed
            }
            _ => SubprocessStatus::Completed,
        };
        activation.finish(status);
        tracing::debug!(
            subprocess = %activation.subprocess_id,
            activation = %id,
            status = ?status,
            errors = errors.len(),
            "Subprocess completed"
        );

        let next = Self::leave(model, &activation, ctx)?;
        ctx.subprocesses.completed.push(activation);
        Ok(next)
    }

    /// Outgoing locations of a finished activation's subprocess element,
    /// tagged like the location the subprocess was entered from.
    fn leave(
        model: &BpmnModel,
        activation: &SubprocessContext,
        ctx: &ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let parent = &activation.parent_location;
        let variables = ctx.variables_in_scope(parent.metadata.subprocess_context_id);
        let flows = model.select_flows(&activation.subprocess_id, &variables)?;
        let template = if parent.location_type == LocationType::CallActivity {
            parent.clone().with_type(LocationType::Node)
        } else {
            parent.clone()
        };
        Ok(flows
            .into_iter()
            .map(|f| template.sibling(f.target.clone()))
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Active activations, optionally of one kind only.
    pub fn active_subprocesses<'a>(
        &self,
        ctx: &'a ExecutionContext,
        kind: Option<SubprocessKind>,
    ) -> Vec<&'a SubprocessContext> {
        ctx.subprocesses
            .active
            .iter()
            .filter(|s| kind.is_none_or(|k| s.kind == k))
            .collect()
    }
}

/// Copy of a parent scope for a scoped activation. Errors stay with the
/// parent so that only the activation's own errors propagate on completion.
fn scoped_copy(ctx: &ExecutionContext, parent: Option<SubprocessContextId>) -> Variables {
    let mut variables = ctx.scope_variables(parent).clone();
    variables.remove(ERRORS_VARIABLE);
    variables
}

/// Copy `source` into a new scope: everything without a mapping, otherwise
/// only the mapped variables that exist.
fn apply_mapping(source: &Variables, mapping: Option<&[VariableMapping]>) -> Variables {
    match mapping {
        None => source.clone(),
        Some(mappings) => mappings
            .iter()
            .filter_map(|m| source.get(&m.source).map(|v| (m.target.clone(), v.clone())))
            .collect(),
    }
}

/// The enabled ad-hoc activity `node_id` belongs to: itself, or the first
/// enabled activity found walking its incoming flows backwards.
fn enabled_root(model: &BpmnModel, node_id: &str, enabled: &[String]) -> Option<String> {
    let mut queue = std::collections::VecDeque::from([node_id.to_string()]);
    let mut seen = std::collections::HashSet::new();
    while let Some(current) = queue.pop_front() {
        if enabled.contains(&current) {
            return Some(current);
        }
        if !seen.insert(current.clone()) {
            continue;
        }
        queue.extend(model.incoming_flows(&current).into_iter().map(|f| f.source.clone()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpmn::model::SequenceFlow;

    fn embedded_model() -> BpmnModel {
        BpmnModel::new(
            "main",
            vec![
                BpmnElement::new("MainStart", ElementKind::StartEvent),
                BpmnElement::new("EmbeddedSubprocess", ElementKind::SubProcess),
                BpmnElement::new("SubStart", ElementKind::StartEvent).inside("EmbeddedSubprocess"),
                BpmnElement::new("SubTask", ElementKind::Task).inside("EmbeddedSubprocess"),
                BpmnElement::new("SubEnd", ElementKind::EndEvent { error_code: None })
                    .inside("EmbeddedSubprocess"),
                BpmnElement::new("MainEnd", ElementKind::EndEvent { error_code: None }),
            ],
            vec![
                SequenceFlow::new("f1", "MainStart", "EmbeddedSubprocess"),
                SequenceFlow::new("f2", "EmbeddedSubprocess", "MainEnd"),
                SequenceFlow::new("s1", "SubStart", "SubTask"),
                SequenceFlow::new("s2", "SubTask", "SubEnd"),
            ],
        )
    }

    fn call_model(input: Option<Vec<VariableMapping>>, output: Option<Vec<VariableMapping>>) -> BpmnModel {
        BpmnModel::new(
            "main",
            vec![
                BpmnElement::new("Start", ElementKind::StartEvent),
                BpmnElement::new(
                    "Call",
                    ElementKind::CallActivity {
                        called_element: "ExternalProcess".into(),
                        input_mapping: input,
                        output_mapping: output,
                    },
                ),
                BpmnElement::new("End", ElementKind::EndEvent { error_code: None }),
            ],
            vec![
                SequenceFlow::new("f1", "Start", "Call"),
                SequenceFlow::new("f2", "Call", "End"),
            ],
        )
    }

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_enter_embedded_subprocess() {
        let model = embedded_model();
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        let at = AbstractLocation::node("main", "EmbeddedSubprocess");

        let next = handler
            .process_subprocess(&model, "EmbeddedSubprocess", &at, &mut ctx)
            .unwrap();

        assert_eq!(next.len(), 1);
        assert_eq!(next[0].node_id, "SubStart");
        assert_eq!(next[0].location_type, LocationType::SubprocessContext);
        let active = handler.active_subprocesses(&ctx, None);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, SubprocessStatus::Active);
        assert_eq!(active[0].parent_process_id, "main");
    }

    #[test]
    fn test_complete_embedded_subprocess() {
        let model = embedded_model();
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        let at = AbstractLocation::node("main", "EmbeddedSubprocess");
        let start = handler
            .process_subprocess(&model, "EmbeddedSubprocess", &at, &mut ctx)
            .unwrap()
            .remove(0);
        let scope = start.metadata.subprocess_context_id;
        ctx.set_variable(scope, "inner", json!("value"));

        let end = start.sibling("SubEnd");
        let next = handler
            .complete_subprocess(&model, &end, &mut ctx)
            .unwrap()
            .unwrap();

        assert_eq!(next.len(), 1);
        assert_eq!(next[0].node_id, "MainEnd");
        assert_eq!(next[0].location_type, LocationType::Node);
        assert!(ctx.subprocesses.active.is_empty());
        assert_eq!(ctx.subprocesses.completed.len(), 1);
        assert!(ctx.subprocesses.completed[0].completed_at.is_some());
        assert_eq!(ctx.variables["inner"], json!("value"));
    }

    #[test]
    fn test_navigate_within_tags_locations() {
        let model = embedded_model();
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        let at = AbstractLocation::node("main", "EmbeddedSubprocess");
        let start = handler
            .process_subprocess(&model, "EmbeddedSubprocess", &at, &mut ctx)
            .unwrap()
            .remove(0);

        let next = handler
            .navigate_within_subprocess(&model, &start, &ctx)
            .unwrap();
        assert_eq!(next[0].node_id, "SubTask");
        assert_eq!(next[0].location_type, LocationType::SubprocessContext);
        assert_eq!(
            next[0].metadata.subprocess_id.as_deref(),
            Some("EmbeddedSubprocess")
        );

        let untagged = AbstractLocation::node("main", "SubTask");
        let next = handler
            .navigate_within_subprocess(&model, &untagged, &ctx)
            .unwrap();
        assert_eq!(next[0].metadata.subprocess_context_id, start.metadata.subprocess_context_id);
    }

    #[test]
    fn test_process_active_subprocess_continues_inside() {
        let model = embedded_model();
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        let at = AbstractLocation::node("main", "EmbeddedSubprocess");
        let start = handler
            .process_subprocess(&model, "EmbeddedSubprocess", &at, &mut ctx)
            .unwrap()
            .remove(0);

        let next = handler
            .process_subprocess(&model, "EmbeddedSubprocess", &start, &mut ctx)
            .unwrap();
        assert_eq!(next[0].node_id, "SubTask");
        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn test_missing_subprocess() {
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        let err = handler
            .process_subprocess(
                &embedded_model(),
                "Nope",
                &AbstractLocation::node("main", "Nope"),
                &mut ctx,
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "Subprocess not found: Nope");
    }

    #[test]
    fn test_missing_start_event() {
        let model = BpmnModel::new(
            "main",
            vec![
                BpmnElement::new("Start", ElementKind::StartEvent),
                BpmnElement::new("Sub", ElementKind::SubProcess),
            ],
            vec![],
        );
        let mut ctx = ExecutionContext::new("main");
        let err = BpmnSubprocessHandler::new()
            .process_subprocess(&model, "Sub", &AbstractLocation::node("main", "Sub"), &mut ctx)
            .unwrap_err();
        assert!(matches!(err, NavigationError::MissingStartEvent(id) if id == "Sub"));
        assert!(ctx.subprocesses.active.is_empty());
    }

    #[test]
    fn test_nesting_depth_is_capped() {
        let model = embedded_model();
        let handler = BpmnSubprocessHandler::new().with_max_depth(1);
        let mut ctx = ExecutionContext::new("main");
        let at = AbstractLocation::node("main", "EmbeddedSubprocess");
        handler
            .process_subprocess(&model, "EmbeddedSubprocess", &at, &mut ctx)
            .unwrap();

        let err = handler
            .process_subprocess(&model, "EmbeddedSubprocess", &at, &mut ctx)
            .unwrap_err();
        assert!(matches!(err, NavigationError::NestingTooDeep { depth: 1, max: 1 }));
    }

    #[test]
    fn test_call_activity_without_mapping_copies_everything() {
        let model = call_model(None, None);
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main")
            .with_variables(vars(&[("a", json!(1)), ("b", json!({"nested": true}))]));

        let next = handler
            .process_subprocess(&model, "Call", &AbstractLocation::node("main", "Call"), &mut ctx)
            .unwrap();

        assert_eq!(next[0].location_type, LocationType::CallActivity);
        assert_eq!(next[0].metadata.called_element.as_deref(), Some("ExternalProcess"));
        let activation = &ctx.subprocesses.active[0];
        assert_eq!(activation.variables, ctx.variables);
        assert_eq!(activation.called_element.as_deref(), Some("ExternalProcess"));
    }

    #[test]
    fn test_call_activity_with_mappings() {
        let model = call_model(
            Some(vec![VariableMapping::new("a", "input")]),
            Some(vec![VariableMapping::new("output", "result")]),
        );
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main")
            .with_variables(vars(&[("a", json!(1)), ("secret", json!("x"))]));
        let next = handler
            .process_subprocess(&model, "Call", &AbstractLocation::node("main", "Call"), &mut ctx)
            .unwrap();
        let id = next[0].metadata.subprocess_context_id.unwrap();
        assert_eq!(ctx.subprocesses.active[0].variables, vars(&[("input", json!(1))]));

        let after = handler
            .complete_call_activity(
                &model,
                id,
                vars(&[("output", json!(42)), ("noise", json!(0))]),
                &mut ctx,
            )
            .unwrap();

        assert_eq!(after[0].node_id, "End");
        assert_eq!(after[0].location_type, LocationType::Node);
        assert_eq!(ctx.variables["result"], json!(42));
        assert!(!ctx.variables.contains_key("noise"));
        assert_eq!(ctx.subprocesses.completed[0].status, SubprocessStatus::Completed);
    }

    #[test]
    fn test_call_activity_output_without_mapping_copies_back() {
        let model = call_model(None, None);
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        let next = handler
            .process_subprocess(&model, "Call", &AbstractLocation::node("main", "Call"), &mut ctx)
            .unwrap();
        let id = next[0].metadata.subprocess_context_id.unwrap();

        handler
            .complete_call_activity(&model, id, vars(&[("x", json!(true))]), &mut ctx)
            .unwrap();
        assert_eq!(ctx.variables["x"], json!(true));

        let err = handler
            .complete_call_activity(&model, id, Variables::new(), &mut ctx)
            .unwrap_err();
        assert!(matches!(err, NavigationError::UnknownActivation(_)));
    }

    fn event_model(interrupting: bool) -> BpmnModel {
        BpmnModel::new(
            "main",
            vec![
                BpmnElement::new("Start", ElementKind::StartEvent),
                BpmnElement::new("Work", ElementKind::SubProcess),
                BpmnElement::new("WorkStart", ElementKind::StartEvent).inside("Work"),
                BpmnElement::new(
                    "OnCancel",
                    ElementKind::EventSubProcess {
                        trigger: EventTrigger::new(TriggerKind::Signal, "cancel"),
                        interrupting,
                    },
                ),
                BpmnElement::new("CancelStart", ElementKind::StartEvent).inside("OnCancel"),
            ],
            vec![SequenceFlow::new("f1", "Start", "Work")],
        )
    }

    #[test]
    fn test_event_subprocess_waits_for_trigger() {
        let model = event_model(true);
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        let root = AbstractLocation::node("main", "Start");

        let next = handler
            .arm_event_subprocesses(&model, None, &root, &mut ctx)
            .unwrap();
        assert!(next.is_empty());
        assert_eq!(ctx.events.pending.len(), 1);

        ctx.events
            .fired
            .push(EventTrigger::new(TriggerKind::Signal, "cancel"));
        let next = handler.start_triggered(&model, &mut ctx).unwrap();
        assert_eq!(next[0].node_id, "CancelStart");
        assert!(ctx.events.pending.is_empty());
        assert_eq!(handler.active_subprocesses(&ctx, Some(SubprocessKind::Event)).len(), 1);
    }

    #[test]
    fn test_interrupting_event_subprocess_cancels_siblings() {
        let model = event_model(true);
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        handler
            .process_subprocess(&model, "Work", &AbstractLocation::node("main", "Work"), &mut ctx)
            .unwrap();
        ctx.events
            .fired
            .push(EventTrigger::new(TriggerKind::Signal, "cancel"));

        handler
            .process_subprocess(&model, "OnCancel", &AbstractLocation::node("main", "OnCancel"), &mut ctx)
            .unwrap();

        assert_eq!(ctx.subprocesses.active.len(), 1);
        assert_eq!(ctx.subprocesses.active[0].subprocess_id, "OnCancel");
        let cancelled = &ctx.subprocesses.completed[0];
        assert_eq!(cancelled.status, SubprocessStatus::Failed);
        assert_eq!(cancelled.failure_reason.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_non_interrupting_event_subprocess_keeps_siblings() {
        let model = event_model(false);
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        handler
            .process_subprocess(&model, "Work", &AbstractLocation::node("main", "Work"), &mut ctx)
            .unwrap();
        ctx.events
            .fired
            .push(EventTrigger::new(TriggerKind::Signal, "cancel"));
        handler
            .process_subprocess(&model, "OnCancel", &AbstractLocation::node("main", "OnCancel"), &mut ctx)
            .unwrap();
        assert_eq!(ctx.subprocesses.active.len(), 2);
    }

    fn transaction_model() -> BpmnModel {
        BpmnModel::new(
            "main",
            vec![
                BpmnElement::new("Start", ElementKind::StartEvent),
                BpmnElement::new(
                    "Tx",
                    ElementKind::Transaction {
                        compensation_handler: Some("Refund".into()),
                    },
                ),
                BpmnElement::new("TxStart", ElementKind::StartEvent).inside("Tx"),
                BpmnElement::new(
                    "TxFail",
                    ElementKind::EndEvent {
                        error_code: Some("PAYMENT_DECLINED".into()),
                    },
                )
                .inside("Tx"),
                BpmnElement::new("End", ElementKind::EndEvent { error_code: None }),
            ],
            vec![
                SequenceFlow::new("f1", "Start", "Tx"),
                SequenceFlow::new("f2", "Tx", "End"),
                SequenceFlow::new("t1", "TxStart", "TxFail"),
            ],
        )
    }

    #[test]
    fn test_failed_transaction_registers_compensation() {
        let model = transaction_model();
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        let start = handler
            .process_subprocess(&model, "Tx", &AbstractLocation::node("main", "Tx"), &mut ctx)
            .unwrap()
            .remove(0);

        let next = handler
            .complete_subprocess(&model, &start.sibling("TxFail"), &mut ctx)
            .unwrap()
            .unwrap();

        assert_eq!(next[0].node_id, "End");
        let tx = &ctx.subprocesses.completed[0];
        assert_eq!(tx.status, SubprocessStatus::Failed);
        assert_eq!(ctx.compensation_handlers[0].handler_id, "Refund");
        let errors = ctx.variables[ERRORS_VARIABLE].as_array().unwrap();
        assert_eq!(errors[0]["code"], "PAYMENT_DECLINED");
        assert!(ctx.events.has_fired(&EventTrigger::new(TriggerKind::Error, "PAYMENT_DECLINED")));
    }

    #[test]
    fn test_complete_ignores_top_level_end() {
        let model = embedded_model();
        let mut ctx = ExecutionContext::new("main");
        let result = BpmnSubprocessHandler::new()
            .complete_subprocess(&model, &AbstractLocation::node("main", "MainEnd"), &mut ctx)
            .unwrap();
        assert!(result.is_none());
    }

    fn ad_hoc_model(ordering: AdHocOrdering, completion: Option<&str>) -> BpmnModel {
        BpmnModel::new(
            "main",
            vec![
                BpmnElement::new("Start", ElementKind::StartEvent),
                BpmnElement::new(
                    "Checks",
                    ElementKind::AdHocSubProcess {
                        ordering,
                        completion_condition: completion.map(str::to_string),
                    },
                ),
                BpmnElement::new("A", ElementKind::Task).inside("Checks"),
                BpmnElement::new("B", ElementKind::Task).inside("Checks"),
                BpmnElement::new("End", ElementKind::EndEvent { error_code: None }),
            ],
            vec![
                SequenceFlow::new("f1", "Start", "Checks"),
                SequenceFlow::new("f2", "Checks", "End"),
            ],
        )
    }

    #[test]
    fn test_parallel_ad_hoc_completes_when_all_done() {
        let model = ad_hoc_model(AdHocOrdering::Parallel, None);
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        let started = handler
            .process_subprocess(&model, "Checks", &AbstractLocation::node("main", "Checks"), &mut ctx)
            .unwrap();
        assert_eq!(started.len(), 2);

        let after_a = handler.advance_ad_hoc(&model, &started[0], &mut ctx).unwrap().unwrap();
        assert!(after_a.is_empty());
        let after_b = handler.advance_ad_hoc(&model, &started[1], &mut ctx).unwrap().unwrap();
        assert_eq!(after_b[0].node_id, "End");
        assert!(ctx.subprocesses.active.is_empty());
    }

    #[test]
    fn test_sequential_ad_hoc_enables_one_at_a_time() {
        let model = ad_hoc_model(AdHocOrdering::Sequential, None);
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        let started = handler
            .process_subprocess(&model, "Checks", &AbstractLocation::node("main", "Checks"), &mut ctx)
            .unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].node_id, "A");

        let next = handler.advance_ad_hoc(&model, &started[0], &mut ctx).unwrap().unwrap();
        assert_eq!(next[0].node_id, "B");
    }

    #[test]
    fn test_ad_hoc_completion_condition() {
        let model = ad_hoc_model(AdHocOrdering::Parallel, Some("enough"));
        let handler = BpmnSubprocessHandler::new();
        let mut ctx = ExecutionContext::new("main");
        let started = handler
            .process_subprocess(&model, "Checks", &AbstractLocation::node("main", "Checks"), &mut ctx)
            .unwrap();
        ctx.set_variable(started[0].metadata.subprocess_context_id, "enough", json!(true));

        let next = handler.advance_ad_hoc(&model, &started[0], &mut ctx).unwrap().unwrap();
        assert_eq!(next[0].node_id, "End");
        assert_eq!(ctx.variables["enough"], json!(true));
    }
}
