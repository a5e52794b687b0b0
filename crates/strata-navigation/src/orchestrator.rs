//! Tier-2 orchestrator.
//!
//! Provides [`TierTwoOrchestrator`] which keeps the registry of routines,
//! forwards step requests to tier 3 and walks whole routines with their
//! navigator.
//!
//! A routine run processes its frontier in waves: every location of the
//! current wave is resolved to a [`NodeAction`], pass-through nodes advance
//! immediately, and the wave's steps run concurrently on tier 3. Their
//! outputs are fed back to the navigator in frontier order, so the result
//! does not depend on which step finished first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, join_all};
use parking_lot::Mutex;
use serde_json::{Value, json};
use strata_types::{
    AbstractLocation, ExecutionContext, ExecutionId, ExecutionResult, RequestType, ResourceUsage,
    SharedEventBus, SharedTierCommunication, SubprocessStatus, TierCommunication,
    TierExecutionRequest, TierMetrics, Variables,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bpmn::{BpmnModel, BpmnNavigator, BpmnSubprocessHandler, DEFAULT_MAX_SUBPROCESS_DEPTH};
use crate::error::NavigationError;
use crate::native::{NativeNavigator, NativeRoutine};
use crate::navigator::{Navigator, NodeAction, SharedNavigator};

/// Default cap on locations visited by one routine run.
pub const DEFAULT_MAX_STEPS: usize = 1000;

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct NavigationConfig {
    /// Maximum subprocess nesting, also applied to nested routine calls.
    pub max_subprocess_depth: usize,

    /// Maximum locations visited by one routine run.
    pub max_steps: usize,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            max_subprocess_depth: DEFAULT_MAX_SUBPROCESS_DEPTH,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

/// Why a routine run stopped early.
#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error("Step '{step_id}' failed: {error}")]
    Step { step_id: String, error: String },

    #[error("Step limit of {0} exceeded")]
    StepLimit(usize),

    #[error("Called routine '{routine}' failed: {error}")]
    Call { routine: String, error: String },
}

/// Bookkeeping of one routine run.
#[derive(Default)]
struct RunState {
    usage: ResourceUsage,
    visited: usize,
    announced_branches: HashSet<String>,
    completed_branches_seen: usize,
}

/// Mid-tier coordinator.
///
/// Routines are registered up front (`register_*`); requests then name the
/// routine by id. Step requests bypass navigation and go straight to tier 3.
pub struct TierTwoOrchestrator {
    tier3: SharedTierCommunication,
    events: SharedEventBus,
    config: NavigationConfig,
    routines: RwLock<HashMap<String, SharedNavigator>>,
    metrics: Mutex<TierMetrics>,
}

impl TierTwoOrchestrator {
    pub fn new(
        tier3: SharedTierCommunication,
        events: SharedEventBus,
        config: NavigationConfig,
    ) -> Self {
        Self {
            tier3,
            events,
            config,
            routines: RwLock::new(HashMap::new()),
            metrics: Mutex::new(TierMetrics::default()),
        }
    }

    pub fn config(&self) -> &NavigationConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────

    /// Register a navigator under its routine id, replacing any previous one.
    pub async fn register_routine(&self, navigator: SharedNavigator) {
        let id = navigator.routine_id().to_string();
        info!(routine = %id, format = %navigator.format(), "Registered routine");
        self.routines.write().await.insert(id, navigator);
    }

    /// Register a BPMN model with this orchestrator's nesting limit.
    pub async fn register_bpmn(&self, model: BpmnModel) {
        let handler =
            BpmnSubprocessHandler::new().with_max_depth(self.config.max_subprocess_depth);
        let navigator = BpmnNavigator::new(model).with_handler(handler);
        self.register_routine(Arc::new(navigator)).await;
    }

    pub async fn register_native(&self, routine: NativeRoutine) {
        self.register_routine(Arc::new(NativeNavigator::new(routine)))
            .await;
    }

    pub async fn has_routine(&self, routine_id: &str) -> bool {
        self.routines.read().await.contains_key(routine_id)
    }

    /// Registered routine ids, sorted.
    pub async fn routines(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routines.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn navigator(&self, routine_id: &str) -> Option<SharedNavigator> {
        self.routines.read().await.get(routine_id).cloned()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────

    /// Dispatch by request type.
    ///
    /// Step requests already carry a resolved [`StepDescriptor`](strata_types::StepDescriptor), so they go
    /// to tier 3 as is, without a registered routine or navigator. Only
    /// routine requests resolve a navigator, by routine id and format.
    async fn handle(&self, request: TierExecutionRequest) -> ExecutionResult {
        match request.request_type {
            RequestType::Step => self.forward_step(request).await,
            RequestType::Routine => self.run_routine(request).await,
        }
    }

    /// Hand a step request to tier 3. Tier-3 errors become failed results.
    async fn forward_step(&self, request: TierExecutionRequest) -> ExecutionResult {
        let execution_id = request.execution_id;
        let step_id = request.step.as_ref().map(|s| s.step_id.clone());
        match self.tier3.execute(request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(%execution_id, step = ?step_id, error = %e, "Tier 3 rejected step");
                self.publish(
                    "run.failure.detected",
                    json!({
                        "execution_id": execution_id.to_string(),
                        "step_id": step_id,
                        "error": e.to_string(),
                    }),
                )
                .await;
                ExecutionResult::failed(execution_id, e.to_string())
            }
        }
    }

    /// Walk a registered routine end to end.
    ///
    /// Fails (as a value) when the routine is unknown, its format does not
    /// match the request, navigation fails, a step fails, or the run visits
    /// more than `max_steps` locations.
    pub async fn run_routine(&self, request: TierExecutionRequest) -> ExecutionResult {
        let Some(navigator) = self.navigator(&request.routine_id).await else {
            let err = NavigationError::RoutineNotFound(request.routine_id.clone());
            return ExecutionResult::failed(request.execution_id, err.to_string());
        };
        if navigator.format() != request.format {
            let err = NavigationError::UnsupportedFormat(request.format.clone());
            return ExecutionResult::failed(
                request.execution_id,
                format!("{err} (routine '{}' is {})", request.routine_id, navigator.format()),
            );
        }
        self.walk(navigator, request, 0).await
    }

    fn walk(
        &self,
        navigator: SharedNavigator,
        request: TierExecutionRequest,
        call_depth: usize,
    ) -> BoxFuture<'_, ExecutionResult> {
        async move {
            let started = Instant::now();
            let routine_id = navigator.routine_id().to_string();
            info!(execution_id = %request.execution_id, routine = %routine_id, call_depth, "Routine started");

            let mut ctx = ExecutionContext::new(routine_id.clone())
                .with_variables(request.inputs.clone())
                .with_execution_id(request.execution_id);
            let mut state = RunState::default();
            let outcome = self
                .drive(navigator.as_ref(), &request, call_depth, &mut ctx, &mut state)
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(()) => {
                    info!(
                        execution_id = %request.execution_id,
                        routine = %routine_id,
                        visited = state.visited,
                        elapsed_ms,
                        "Routine completed"
                    );
                    ExecutionResult::completed(
                        request.execution_id,
                        json!({
                            "variables": ctx.variables,
                            "visited": state.visited,
                            "completed_subprocesses": ctx.subprocesses.completed.len(),
                        }),
                    )
                    .with_usage(state.usage)
                    .with_duration(elapsed_ms)
                }
                Err(e) => {
                    warn!(execution_id = %request.execution_id, routine = %routine_id, error = %e, "Routine failed");
                    self.publish(
                        "run.failure.detected",
                        json!({
                            "execution_id": request.execution_id.to_string(),
                            "routine_id": routine_id,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                    let mut result = ExecutionResult::failed(request.execution_id, e.to_string())
                        .with_usage(state.usage)
                        .with_duration(elapsed_ms);
                    let failed_subprocesses: Vec<&str> = ctx
                        .subprocesses
                        .completed
                        .iter()
                        .filter(|s| s.status == SubprocessStatus::Failed)
                        .map(|s| s.subprocess_id.as_str())
                        .collect();
                    result.data = Some(json!({
                        "variables": ctx.variables,
                        "failed_subprocesses": failed_subprocesses,
                    }));
                    result
                }
            }
        }
        .boxed()
    }

    async fn drive(
        &self,
        navigator: &dyn Navigator,
        request: &TierExecutionRequest,
        call_depth: usize,
        ctx: &mut ExecutionContext,
        state: &mut RunState,
    ) -> Result<(), RunError> {
        let mut frontier = navigator.start(ctx)?;

        while !frontier.is_empty() {
            let wave: Vec<AbstractLocation> = std::mem::take(&mut frontier)
                .into_iter()
                .filter(|loc| {
                    let live = navigator.is_live(loc, ctx);
                    if !live {
                        debug!(location = %loc, "Dropping location of a finished scope");
                    }
                    live
                })
                .collect();

            let mut steps = Vec::new();
            for location in wave {
                state.visited += 1;
                if state.visited > self.config.max_steps {
                    return Err(RunError::StepLimit(self.config.max_steps));
                }
                match navigator.action(&location, ctx)? {
                    NodeAction::Step(step) => steps.push((location, step)),
                    NodeAction::Pass => frontier.extend(navigator.advance(&location, None, ctx)?),
                    NodeAction::End => debug!(location = %location, "Token reached end"),
                    NodeAction::Call {
                        called_element,
                        context_id,
                        inputs,
                    } => {
                        let outputs = match self
                            .call_routine(&called_element, inputs, request, call_depth, state)
                            .await
                        {
                            Ok(outputs) => outputs,
                            Err(e) => {
                                navigator.fail_call(&location, context_id, &e.to_string(), ctx)?;
                                return Err(e);
                            }
                        };
                        frontier.extend(navigator.complete_call(&location, context_id, outputs, ctx)?);
                    }
                }
            }

            if !steps.is_empty() {
                let requests: Vec<TierExecutionRequest> = steps
                    .iter()
                    .map(|(location, step)| {
                        request
                            .step_of(step.clone(), location.clone())
                            .with_inputs(ctx.variables_in_scope(location.metadata.subprocess_context_id))
                    })
                    .collect();
                let results = join_all(requests.into_iter().map(|r| self.forward_step(r))).await;

                for result in &results {
                    if let Some(usage) = &result.usage {
                        state.usage.merge(usage);
                    }
                }
                for ((location, step), result) in steps.into_iter().zip(results) {
                    if !result.is_success() {
                        return Err(RunError::Step {
                            step_id: step.step_id,
                            error: result.error.unwrap_or_else(|| "unknown error".to_string()),
                        });
                    }
                    frontier.extend(navigator.advance(&location, result.data.as_ref(), ctx)?);
                }

                self.publish(
                    "run.context.updated",
                    json!({
                        "execution_id": ctx.execution_id.to_string(),
                        "variables": ctx.variables,
                    }),
                )
                .await;
                self.publish(
                    "run.checkpoint.created",
                    json!({
                        "execution_id": ctx.execution_id.to_string(),
                        "routine_id": ctx.routine_id,
                        "visited": state.visited,
                        "frontier": frontier,
                    }),
                )
                .await;
            }

            self.publish_branch_events(ctx, state).await;
        }
        Ok(())
    }

    /// Run `routine` as a nested call and return its final variables.
    async fn call_routine(
        &self,
        routine: &str,
        inputs: Variables,
        parent: &TierExecutionRequest,
        call_depth: usize,
        state: &mut RunState,
    ) -> Result<Variables, RunError> {
        let depth = call_depth + 1;
        if depth > self.config.max_subprocess_depth {
            return Err(NavigationError::NestingTooDeep {
                depth,
                max: self.config.max_subprocess_depth,
            }
            .into());
        }
        let navigator = self
            .navigator(routine)
            .await
            .ok_or_else(|| NavigationError::RoutineNotFound(routine.to_string()))?;

        let mut request = parent.clone();
        request.execution_id = ExecutionId::new();
        request.routine_id = routine.to_string();
        request.format = navigator.format();
        request.inputs = inputs;
        request.location = None;

        let result = self.walk(navigator, request, depth).await;
        if let Some(usage) = &result.usage {
            state.usage.merge(usage);
        }
        if !result.is_success() {
            return Err(RunError::Call {
                routine: routine.to_string(),
                error: result.error.unwrap_or_default(),
            });
        }
        Ok(result_variables(result.data.as_ref()))
    }

    async fn publish_branch_events(&self, ctx: &ExecutionContext, state: &mut RunState) {
        let started: Vec<String> = ctx
            .parallel
            .active_branches
            .iter()
            .filter(|b| !state.announced_branches.contains(&b.id))
            .map(|b| b.id.clone())
            .collect();
        for branch in started {
            self.publish(
                "run.branch.started",
                json!({ "execution_id": ctx.execution_id.to_string(), "branch_id": branch }),
            )
            .await;
            state.announced_branches.insert(branch);
        }

        let completed = &ctx.parallel.completed_branches;
        for branch in completed.iter().skip(state.completed_branches_seen) {
            self.publish(
                "run.branch.completed",
                json!({ "execution_id": ctx.execution_id.to_string(), "branch_id": branch }),
            )
            .await;
        }
        state.completed_branches_seen = completed.len();
    }

    async fn publish(&self, topic: &str, payload: Value) {
        if let Err(e) = self.events.publish(topic, payload).await {
            warn!(topic, error = %e, "Failed to publish run event");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────

    fn begin(&self) {
        self.metrics.lock().active_executions += 1;
    }

    fn finish(&self, result: &ExecutionResult, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as f64;
        let mut metrics = self.metrics.lock();
        metrics.active_executions = metrics.active_executions.saturating_sub(1);
        metrics.total_executions += 1;
        if result.is_success() {
            metrics.successful_executions += 1;
        } else {
            metrics.failed_executions += 1;
        }
        let n = metrics.total_executions as f64;
        metrics.average_execution_time_ms += (elapsed_ms - metrics.average_execution_time_ms) / n;
    }
}

/// Variables of a finished routine result.
fn result_variables(data: Option<&Value>) -> Variables {
    data.and_then(|d| d.get("variables"))
        .and_then(Value::as_object)
        .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

#[async_trait]
impl TierCommunication for TierTwoOrchestrator {
    /// Never returns `Err`: every failure is reported as a failed result.
    async fn execute(&self, request: TierExecutionRequest) -> strata_types::Result<ExecutionResult> {
        self.begin();
        let started = Instant::now();
        let result = self.handle(request).await;
        self.finish(&result, started);
        Ok(result)
    }

    fn metrics(&self) -> TierMetrics {
        self.metrics.lock().clone()
    }
}

impl std::fmt::Debug for TierTwoOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierTwoOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
