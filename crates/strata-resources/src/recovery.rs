//! Recovery strategy selection.
//!
//! [`SimpleRecoveryProvider`] is a deterministic function from an error
//! classification and its context to a [`RecoveryStrategy`]. Rules are
//! checked in order and the first match wins:
//!
//! 1. `FATAL` severity or `NONE` recoverability: emergency stop
//! 2. security risk: escalate to a human
//! 3. `TRANSIENT`: retry with exponential backoff
//! 4. `RESOURCE`: wait and retry with jittered backoff
//! 5. anything else: retry
//!
//! `CRITICAL` severity caps the attempt budget at two for rules 3-5, and
//! every prior attempt reduces the budget by one (never below one).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strata_types::{
    BackoffStrategy, ErrorCategory, ErrorClassification, RecoveryContext, RecoveryOutcome,
    RecoveryRequirements, RecoveryStrategy, Recoverability, SharedEventBus, Severity,
    StrategyType,
};

/// Timeout of an emergency stop.
const EMERGENCY_STOP_TIMEOUT_MS: u64 = 1000;

/// Attempt cap for critical errors.
const CRITICAL_MAX_ATTEMPTS: u32 = 2;

/// Smallest fresh budget of a retrying strategy: the first try plus one retry.
const MIN_RETRY_ATTEMPTS: u32 = 2;

/// Smallest initial delay when waiting out a resource shortage.
const RESOURCE_MIN_INITIAL_DELAY_MS: u64 = 1000;

/// Time a human gets to look at an escalated failure.
const ESCALATION_TIMEOUT_MS: u64 = 15 * 60 * 1000;

/// Maps classified errors to recovery strategies.
#[async_trait]
pub trait RecoveryStrategyProvider: Send + Sync {
    /// Select a strategy for a failure.
    async fn get_strategy(
        &self,
        classification: &ErrorClassification,
        context: &RecoveryContext,
    ) -> RecoveryStrategy;

    /// Record how applying a strategy turned out.
    async fn record_outcome(&self, outcome: RecoveryOutcome);
}

/// Shared recovery provider handle.
pub type SharedRecoveryProvider = Arc<dyn RecoveryStrategyProvider>;

/// Recovery provider configuration.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempt budget for a fresh failure. Retrying strategies get at
    /// least two attempts whatever this is set to.
    pub max_attempts: u32,
    /// Timeout of a retried attempt.
    pub timeout_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 3,
            timeout_ms: 30_000,
        }
    }
}

/// Aggregated outcomes for one classification key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub total: u64,
    pub successes: u64,
    pub total_duration_ms: u64,
    pub total_cost: f64,
}

impl OutcomeStats {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total as f64
        }
    }
}

/// Rule-based recovery provider.
pub struct SimpleRecoveryProvider {
    config: RecoveryConfig,
    events: SharedEventBus,
    stats: Mutex<HashMap<String, OutcomeStats>>,
}

impl SimpleRecoveryProvider {
    pub fn new(config: RecoveryConfig, events: SharedEventBus) -> Self {
        Self {
            config,
            events,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Select a strategy without publishing anything.
    pub fn select(
        &self,
        classification: &ErrorClassification,
        context: &RecoveryContext,
    ) -> RecoveryStrategy {
        if classification.severity == Severity::Fatal
            || classification.recoverability == Recoverability::None
        {
            return RecoveryStrategy {
                strategy_type: StrategyType::EmergencyStop,
                max_attempts: 1,
                backoff: BackoffStrategy::none(),
                timeout_ms: EMERGENCY_STOP_TIMEOUT_MS,
                resource_requirements: RecoveryRequirements::default(),
            };
        }

        if classification.security_risk {
            return RecoveryStrategy {
                strategy_type: StrategyType::EscalateToHuman,
                max_attempts: 1,
                backoff: BackoffStrategy::none(),
                timeout_ms: ESCALATION_TIMEOUT_MS,
                resource_requirements: RecoveryRequirements {
                    human_attention: true,
                    ..Default::default()
                },
            };
        }

        let (strategy_type, backoff) = match classification.category {
            ErrorCategory::Transient => (
                StrategyType::RetrySame,
                BackoffStrategy::exponential(self.config.base_delay_ms, self.config.max_delay_ms),
            ),
            ErrorCategory::Resource => {
                let initial = self
                    .config
                    .base_delay_ms
                    .saturating_mul(2)
                    .max(RESOURCE_MIN_INITIAL_DELAY_MS);
                (
                    StrategyType::WaitAndRetry,
                    BackoffStrategy::exponential_jitter(
                        initial,
                        self.config.max_delay_ms.max(initial),
                    ),
                )
            }
            ErrorCategory::Logic | ErrorCategory::Security | ErrorCategory::Unknown => (
                StrategyType::RetrySame,
                BackoffStrategy::exponential(self.config.base_delay_ms, self.config.max_delay_ms),
            ),
        };

        let mut budget = self.config.max_attempts.max(MIN_RETRY_ATTEMPTS);
        if classification.severity == Severity::Critical {
            budget = budget.min(CRITICAL_MAX_ATTEMPTS);
        }
        let max_attempts = budget.saturating_sub(context.attempt_count).max(1);

        RecoveryStrategy {
            strategy_type,
            max_attempts,
            backoff,
            timeout_ms: self.config.timeout_ms,
            resource_requirements: RecoveryRequirements::default(),
        }
    }

    /// Aggregated outcomes for a `"{severity}:{category}"` key.
    pub fn outcome_stats(&self, key: &str) -> Option<OutcomeStats> {
        self.stats.lock().get(key).cloned()
    }

    /// Aggregated outcomes for every key seen so far.
    pub fn all_outcome_stats(&self) -> HashMap<String, OutcomeStats> {
        self.stats.lock().clone()
    }
}

#[async_trait]
impl RecoveryStrategyProvider for SimpleRecoveryProvider {
    async fn get_strategy(
        &self,
        classification: &ErrorClassification,
        context: &RecoveryContext,
    ) -> RecoveryStrategy {
        let strategy = self.select(classification, context);
        let key = classification.key();
        tracing::debug!(
            key = %key,
            strategy = %strategy.strategy_type,
            max_attempts = strategy.max_attempts,
            attempt_count = context.attempt_count,
            "Recovery strategy selected"
        );

        let payload = json!({
            "key": key,
            "classification": classification,
            "context": context,
            "strategy": strategy,
        });
        if let Err(e) = self.events.publish("recovery/strategy_selected", payload).await {
            tracing::warn!(error = %e, "Failed to publish strategy selection");
        }
        strategy
    }

    async fn record_outcome(&self, outcome: RecoveryOutcome) {
        let key = outcome.classification.key();
        {
            let mut stats = self.stats.lock();
            let entry = stats.entry(key.clone()).or_default();
            entry.total += 1;
            if outcome.success {
                entry.successes += 1;
            }
            entry.total_duration_ms += outcome.duration_ms;
            entry.total_cost += outcome.resource_cost;
        }

        let payload = json!({
            "key": key,
            "strategy_type": outcome.strategy_type,
            "success": outcome.success,
            "attempts": outcome.attempts,
            "duration_ms": outcome.duration_ms,
            "resource_cost": outcome.resource_cost,
        });
        if let Err(e) = self.events.publish("recovery/outcome", payload).await {
            tracing::warn!(error = %e, "Failed to publish recovery outcome");
        }
    }
}

impl std::fmt::Debug for SimpleRecoveryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleRecoveryProvider")
            .field("config", &self.config)
            .finish()
    }
}
