//! Recovery strategy records.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::classification::ErrorClassification;
use crate::ids::ExecutionId;

/// What to do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyType {
    RetrySame,
    WaitAndRetry,
    EscalateToHuman,
    EmergencyStop,
}

impl StrategyType {
    /// Whether the strategy allows another attempt.
    pub fn retries(&self) -> bool {
        matches!(self, StrategyType::RetrySame | StrategyType::WaitAndRetry)
    }
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyType::RetrySame => write!(f, "RETRY_SAME"),
            StrategyType::WaitAndRetry => write!(f, "WAIT_AND_RETRY"),
            StrategyType::EscalateToHuman => write!(f, "ESCALATE_TO_HUMAN"),
            StrategyType::EmergencyStop => write!(f, "EMERGENCY_STOP"),
        }
    }
}

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    None,
    Fixed,
    Linear,
    Exponential,
    ExponentialJitter,
}

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffStrategy {
    #[serde(rename = "type")]
    pub backoff_type: BackoffType,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl BackoffStrategy {
    /// No delay between attempts.
    pub fn none() -> Self {
        Self {
            backoff_type: BackoffType::None,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            backoff_type: BackoffType::Fixed,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
        }
    }

    pub fn exponential(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            backoff_type: BackoffType::Exponential,
            initial_delay_ms,
            max_delay_ms,
            multiplier: 2.0,
        }
    }

    pub fn exponential_jitter(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            backoff_type: BackoffType::ExponentialJitter,
            initial_delay_ms,
            max_delay_ms,
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let initial = self.initial_delay_ms as f64;
        let delay = match self.backoff_type {
            BackoffType::None => 0.0,
            BackoffType::Fixed => initial,
            BackoffType::Linear => initial * attempt.max(1) as f64,
            BackoffType::Exponential | BackoffType::ExponentialJitter => {
                let exp = attempt.saturating_sub(1).min(20) as i32;
                initial * self.multiplier.powi(exp)
            }
        };
        (delay as u64).min(self.max_delay_ms.max(self.initial_delay_ms))
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Exponential-jitter adds up to 50% of the base delay at random, still
    /// bounded by `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt);
        let delay = match self.backoff_type {
            BackoffType::ExponentialJitter if base > 0 => {
                let jitter = rand::rng().random_range(0..=base / 2);
                (base + jitter).min(self.max_delay_ms.max(self.initial_delay_ms))
            }
            _ => base,
        };
        Duration::from_millis(delay)
    }
}

/// Resources a strategy needs to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRequirements {
    /// A human must look at the failure.
    #[serde(default)]
    pub human_attention: bool,
    #[serde(default)]
    pub credits: f64,
    #[serde(default)]
    pub compute_time_ms: u64,
}

/// A recovery strategy selected for one failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub strategy_type: StrategyType,
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub timeout_ms: u64,
    #[serde(default)]
    pub resource_requirements: RecoveryRequirements,
}

/// Execution tier a failure was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[serde(rename = "tier1")]
    One,
    #[serde(rename = "tier2")]
    Two,
    #[serde(rename = "tier3")]
    Three,
}

/// Where a failure happened and how often it has been retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryContext {
    /// Attempts already made for this failure.
    pub attempt_count: u32,
    pub tier: Tier,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
}

impl RecoveryContext {
    pub fn new(tier: Tier, component: impl Into<String>) -> Self {
        Self {
            attempt_count: 0,
            tier,
            component: component.into(),
            execution_id: None,
        }
    }

    pub fn with_attempts(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        self
    }

    pub fn with_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }
}

/// Result of applying a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub classification: ErrorClassification,
    pub strategy_type: StrategyType,
    pub success: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    pub resource_cost: f64,
}
