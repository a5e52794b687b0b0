//! Tier-3 step executor.
//!
//! Runs one step's tool under a budget reservation. Failures are classified
//! and handed to the recovery provider, which decides whether and when the
//! step is attempted again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use strata_tools::{IntegratedToolRegistry, ToolContext, ToolError, ToolOutput};
use strata_types::{
    Error, ErrorClassification, ExecutionResult, RecoveryContext, RecoveryOutcome,
    RecoveryStrategy, ReservationId, Result, StepDescriptor, Tier, TierCommunication,
    TierExecutionRequest, TierMetrics,
};

use crate::manager::ResourceManager;
use crate::recovery::SharedRecoveryProvider;

/// Quota bucket every step is checked against.
const STEPS_RESOURCE: &str = "steps";

/// Executes leaf steps for tier 2.
pub struct TierThreeExecutor {
    registry: Arc<IntegratedToolRegistry>,
    resources: Arc<ResourceManager>,
    recovery: SharedRecoveryProvider,
    metrics: Mutex<TierMetrics>,
}

/// A step that eventually succeeded.
struct StepSuccess {
    output: ToolOutput,
    attempts: u32,
    /// Last failure before success and the strategy that retried it.
    recovered: Option<(ErrorClassification, RecoveryStrategy)>,
}

/// A step that recovery gave up on.
struct StepFailure {
    error: ToolError,
    classification: ErrorClassification,
    strategy: RecoveryStrategy,
    attempts: u32,
}

impl TierThreeExecutor {
    pub fn new(
        registry: Arc<IntegratedToolRegistry>,
        resources: Arc<ResourceManager>,
        recovery: SharedRecoveryProvider,
    ) -> Self {
        Self {
            registry,
            resources,
            recovery,
            metrics: Mutex::new(TierMetrics::default()),
        }
    }

    pub fn registry(&self) -> &Arc<IntegratedToolRegistry> {
        &self.registry
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    async fn run_step(
        &self,
        request: &TierExecutionRequest,
        step: &StepDescriptor,
    ) -> ExecutionResult {
        let execution_id = request.execution_id;

        let quota = self
            .resources
            .check_quota(STEPS_RESOURCE, request.constraints.max_cost.unwrap_or(0.0))
            .await;
        if !quota.allowed {
            let reason = quota.reason.unwrap_or_else(|| "quota exceeded".to_string());
            tracing::warn!(step = %step.step_id, reason = %reason, "Step refused by quota");
            return ExecutionResult::failed(execution_id, reason);
        }

        let reservation = self
            .resources
            .reserve_budget(
                &step.step_id,
                &request.available,
                &request.constraints,
                request.user_id.as_deref(),
                request.swarm_id.as_deref(),
            )
            .await;
        let Some(reservation_id) = reservation.reservation_id.filter(|_| reservation.approved)
        else {
            let reason = reservation
                .reason
                .unwrap_or_else(|| "budget reservation rejected".to_string());
            return ExecutionResult::failed(execution_id, reason);
        };

        let started = Instant::now();
        match self.attempt_with_recovery(request, step).await {
            Ok(output) => self.succeed(request, step, reservation_id, output, started).await,
            Err(failure) => self.fail(request, step, reservation_id, failure, started).await,
        }
    }

    /// Run the tool until it succeeds or the recovery strategy stops retrying.
    async fn attempt_with_recovery(
        &self,
        request: &TierExecutionRequest,
        step: &StepDescriptor,
    ) -> std::result::Result<StepSuccess, StepFailure> {
        let mut timeout = request.constraints.max_time_ms.map(Duration::from_millis);
        let mut recovered: Option<(ErrorClassification, RecoveryStrategy)> = None;
        let mut attempt: u32 = 1;

        loop {
            let ctx = ToolContext::new(request.execution_id, step.step_id.clone())
                .with_attempt(attempt)
                .with_variables(request.inputs.clone());
            let result = self
                .registry
                .execute_with_timeout(&step.tool, step.parameters.clone(), &ctx, timeout)
                .await;

            let error = match result {
                Ok(output) => {
                    return Ok(StepSuccess {
                        output,
                        attempts: attempt,
                        recovered,
                    });
                }
                Err(e) => e,
            };

            let classification = error.classify();
            let context = RecoveryContext::new(Tier::Three, step.tool.clone())
                .with_attempts(attempt - 1)
                .with_execution(request.execution_id);
            let strategy = self.recovery.get_strategy(&classification, &context).await;

            if !(strategy.strategy_type.retries() && strategy.max_attempts > 1) {
                return Err(StepFailure {
                    error,
                    classification,
                    strategy,
                    attempts: attempt,
                });
            }

            let delay = strategy.backoff.delay_for(attempt);
            tracing::info!(
                step = %step.step_id,
                tool = %step.tool,
                attempt,
                error = %error,
                strategy = %strategy.strategy_type,
                delay_ms = delay.as_millis() as u64,
                "Retrying step"
            );
            tokio::time::sleep(delay).await;

            if request.constraints.max_time_ms.is_none() {
                timeout = Some(Duration::from_millis(strategy.timeout_ms));
            }
            recovered = Some((classification, strategy));
            attempt += 1;
        }
    }

    async fn succeed(
        &self,
        request: &TierExecutionRequest,
        step: &StepDescriptor,
        reservation_id: ReservationId,
        success: StepSuccess,
        started: Instant,
    ) -> ExecutionResult {
        let StepSuccess {
            output,
            attempts,
            recovered,
        } = success;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.resources
            .track_reservation_usage(reservation_id, &output.usage)
            .await;

        let mut actual = output.usage;
        actual.compute_time_ms = actual.compute_time_ms.max(elapsed_ms);
        let usage = match self.resources.finalize_usage(reservation_id, actual).await {
            Ok(usage) => usage,
            Err(e) => {
                tracing::warn!(step = %step.step_id, error = %e, "Failed to finalize usage");
                actual
            }
        };

        if let Some((classification, strategy)) = recovered {
            self.recovery
                .record_outcome(RecoveryOutcome {
                    classification,
                    strategy_type: strategy.strategy_type,
                    success: true,
                    attempts,
                    duration_ms: elapsed_ms,
                    resource_cost: usage.cost,
                })
                .await;
        }

        tracing::debug!(step = %step.step_id, attempts, elapsed_ms, "Step completed");
        ExecutionResult::completed(request.execution_id, output.data)
            .with_usage(usage)
            .with_duration(elapsed_ms)
    }

    async fn fail(
        &self,
        request: &TierExecutionRequest,
        step: &StepDescriptor,
        reservation_id: ReservationId,
        failure: StepFailure,
        started: Instant,
    ) -> ExecutionResult {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.recovery
            .record_outcome(RecoveryOutcome {
                classification: failure.classification.clone(),
                strategy_type: failure.strategy.strategy_type,
                success: false,
                attempts: failure.attempts,
                duration_ms: elapsed_ms,
                resource_cost: 0.0,
            })
            .await;

        if let Err(e) = self.resources.release_reservation(reservation_id).await {
            tracing::warn!(step = %step.step_id, error = %e, "Failed to release reservation");
        }

        tracing::warn!(
            step = %step.step_id,
            tool = %step.tool,
            attempts = failure.attempts,
            error = %failure.error,
            strategy = %failure.strategy.strategy_type,
            "Step failed"
        );

        let mut result = ExecutionResult::failed(request.execution_id, failure.error.to_string())
            .with_duration(elapsed_ms);
        result.data = Some(json!({
            "classification": failure.classification,
            "strategy": failure.strategy,
            "attempts": failure.attempts,
        }));
        result
    }
}

#[async_trait]
impl TierCommunication for TierThreeExecutor {
    async fn execute(&self, request: TierExecutionRequest) -> Result<ExecutionResult> {
        let step = request.step.clone().ok_or_else(|| {
            Error::invalid_input(format!(
                "step request {} carries no step descriptor",
                request.execution_id
            ))
        })?;

        self.metrics.lock().active_executions += 1;
        let started = Instant::now();
        let result = self.run_step(&request, &step).await;
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

        Ok(result)
    }

    fn metrics(&self) -> TierMetrics {
        self.metrics.lock().clone()
    }
}

impl std::fmt::Debug for TierThreeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierThreeExecutor")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
