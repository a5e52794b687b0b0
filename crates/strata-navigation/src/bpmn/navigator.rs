//! Navigator for BPMN-style graphs.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use strata_types::{
    AbstractLocation, Branch, EventTrigger, ExecutionContext, LocationType, RoutineFormat,
    StepDescriptor, SubprocessContextId, TriggerKind, Variables,
};

use super::model::{BpmnElement, BpmnModel, ElementKind};
use super::subprocess::BpmnSubprocessHandler;
use crate::error::{NavigationError, Result};
use crate::navigator::{Navigator, NodeAction, resolve_parameters};

/// Walks a [`BpmnModel`], delegating subprocess constructs to a
/// [`BpmnSubprocessHandler`].
///
/// Parallel gateways fork one branch per outgoing flow and join once every
/// incoming flow delivered a token. Branch ids nest as
/// `outer/gateway:target` so that an inner join restores the outer branch.
#[derive(Debug, Clone)]
pub struct BpmnNavigator {
    model: Arc<BpmnModel>,
    handler: BpmnSubprocessHandler,
}

impl BpmnNavigator {
    pub fn new(model: impl Into<Arc<BpmnModel>>) -> Self {
        Self {
            model: model.into(),
            handler: BpmnSubprocessHandler::default(),
        }
    }

    pub fn with_handler(mut self, handler: BpmnSubprocessHandler) -> Self {
        self.handler = handler;
        self
    }

    pub fn model(&self) -> &BpmnModel {
        &self.model
    }

    pub fn handler(&self) -> &BpmnSubprocessHandler {
        &self.handler
    }

    /// Follow the outgoing flows of `location`, inside or outside a
    /// subprocess. A dead end inside an ad-hoc subprocess counts as the
    /// completion of one of its activities.
    fn follow(
        &self,
        element: &BpmnElement,
        location: &AbstractLocation,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let nested = location.metadata.subprocess_context_id.is_some() || element.parent.is_some();
        let next = if nested {
            self.handler
                .navigate_within_subprocess(&self.model, location, ctx)?
        } else {
            self.model
                .select_flows(&location.node_id, &ctx.variables)?
                .into_iter()
                .map(|f| location.sibling(f.target.clone()))
                .collect()
        };

        if next.is_empty()
            && let Some(done) = self.handler.advance_ad_hoc(&self.model, location, ctx)?
        {
            return Ok(done);
        }
        Ok(next)
    }

    fn parallel_gateway(
        &self,
        element: &BpmnElement,
        location: &AbstractLocation,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let mut branch = location.metadata.branch_id.clone();
        let incoming = self.model.incoming_flows(&element.id).len();

        if incoming > 1 {
            if let Some(id) = &branch {
                ctx.parallel.complete_branch(id);
            }
            let arrived = ctx.parallel.arrive(&element.id) as usize;
            if arrived < incoming {
                tracing::debug!(gateway = %element.id, arrived, incoming, "Waiting at join");
                return Ok(Vec::new());
            }
            ctx.parallel.reset_join(&element.id);
            branch = branch.and_then(|b| b.rsplit_once('/').map(|(outer, _)| outer.to_string()));
        }

        let mut at = location.clone();
        at.metadata.branch_id = branch.clone();
        let mut next = self.follow(element, &at, ctx)?;
        if next.len() > 1 {
            for loc in &mut next {
                let id = match &branch {
                    Some(outer) => format!("{outer}/{}:{}", element.id, loc.node_id),
                    None => format!("{}:{}", element.id, loc.node_id),
                };
                ctx.parallel.active_branches.push(Branch {
                    id: id.clone(),
                    gateway_id: element.id.clone(),
                    started_at: Utc::now(),
                });
                loc.metadata.branch_id = Some(id);
            }
        }
        Ok(next)
    }

    fn end_event(
        &self,
        element: &BpmnElement,
        error_code: Option<&str>,
        location: &AbstractLocation,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        if element.parent.is_some() {
            return Ok(self
                .handler
                .complete_subprocess(&self.model, location, ctx)?
                .unwrap_or_default());
        }
        if let Some(code) = error_code {
            ctx.record_error(None, json!({ "code": code, "element": element.id }));
            ctx.events
                .fired
                .push(EventTrigger::new(TriggerKind::Error, code));
        }
        Ok(Vec::new())
    }
}

impl Navigator for BpmnNavigator {
    fn routine_id(&self) -> &str {
        self.model.id()
    }

    fn format(&self) -> RoutineFormat {
        RoutineFormat::Bpmn
    }

    fn start(&self, ctx: &mut ExecutionContext) -> Result<Vec<AbstractLocation>> {
        let start = self
            .model
            .start_event(None)
            .ok_or_else(|| NavigationError::MissingStartEvent(self.model.id().to_string()))?;
        let location = AbstractLocation::node(self.model.id(), start.id.clone());
        let mut locations = vec![location.clone()];
        locations.extend(
            self.handler
                .arm_event_subprocesses(&self.model, None, &location, ctx)?,
        );
        Ok(locations)
    }

    fn action(&self, location: &AbstractLocation, ctx: &ExecutionContext) -> Result<NodeAction> {
        let element = self.model.require(&location.node_id)?;
        let scope = location.metadata.subprocess_context_id;

        Ok(match &element.kind {
            ElementKind::ServiceTask(task) => NodeAction::Step(StepDescriptor {
                step_id: element.id.clone(),
                tool: task.tool.clone(),
                parameters: resolve_parameters(&task.parameters, &ctx.variables_in_scope(scope)),
            }),
            ElementKind::CallActivity { called_element, .. }
                if location.location_type == LocationType::CallActivity =>
            {
                let context_id = scope.ok_or_else(|| {
                    NavigationError::invalid(format!("call activity location {location} has no activation"))
                })?;
                let activation = ctx
                    .subprocesses
                    .get(context_id)
                    .ok_or(NavigationError::UnknownActivation(context_id))?;
                NodeAction::Call {
                    called_element: called_element.clone(),
                    context_id,
                    inputs: activation.variables.clone(),
                }
            }
            ElementKind::EndEvent { error_code: None } if element.parent.is_none() => {
                NodeAction::End
            }
            _ => NodeAction::Pass,
        })
    }

    fn advance(
        &self,
        location: &AbstractLocation,
        output: Option<&Value>,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let element = self.model.require(&location.node_id)?;
        let scope = location.metadata.subprocess_context_id;

        if let ElementKind::ServiceTask(task) = &element.kind {
            ctx.bump_loop_counter(&element.id);
            if let (Some(var), Some(value)) = (&task.result_variable, output) {
                ctx.set_variable(scope, var.clone(), value.clone());
            }
        }

        let mut next = match &element.kind {
            kind if kind.subprocess_kind().is_some() => {
                self.handler
                    .process_subprocess(&self.model, &element.id, location, ctx)?
            }
            ElementKind::EndEvent { error_code } => {
                self.end_event(element, error_code.as_deref(), location, ctx)?
            }
            ElementKind::ParallelGateway => self.parallel_gateway(element, location, ctx)?,
            ElementKind::ExclusiveGateway { .. } => {
                let next = self.follow(element, location, ctx)?;
                let state = ctx.gateway_states.entry(element.id.clone()).or_default();
                state.activations += 1;
                state.last_taken = next.iter().map(|l| l.node_id.clone()).collect();
                next
            }
            _ => self.follow(element, location, ctx)?,
        };

        next.extend(self.handler.start_triggered(&self.model, ctx)?);
        Ok(next)
    }

    fn complete_call(
        &self,
        _location: &AbstractLocation,
        context_id: SubprocessContextId,
        outputs: Variables,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AbstractLocation>> {
        let mut next = self
            .handler
            .complete_call_activity(&self.model, context_id, outputs, ctx)?;
        next.extend(self.handler.start_triggered(&self.model, ctx)?);
        Ok(next)
    }

    fn fail_call(
        &self,
        _location: &AbstractLocation,
        context_id: SubprocessContextId,
        reason: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        self.handler.fail_call_activity(context_id, reason, ctx)
    }
}
