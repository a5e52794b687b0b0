//! Resource budget vocabulary shared by the tiers.

use serde::{Deserialize, Serialize};

/// Availability of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAvailability {
    pub name: String,
    pub available: bool,
}

/// Resources available to a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvailableResources {
    pub credits: f64,
    /// Wall-clock budget in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
    #[serde(default)]
    pub models: Vec<ModelAvailability>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// API names with remaining quota.
    #[serde(default)]
    pub apis: Vec<String>,
}

impl AvailableResources {
    pub fn with_credits(credits: f64) -> Self {
        Self {
            credits,
            ..Default::default()
        }
    }

    pub fn with_time_limit(mut self, time_limit_ms: u64) -> Self {
        self.time_limit_ms = Some(time_limit_ms);
        self
    }

    pub fn with_model(mut self, name: impl Into<String>, available: bool) -> Self {
        self.models.push(ModelAvailability {
            name: name.into(),
            available,
        });
        self
    }

    /// Whether `model` is present and marked available.
    pub fn model_available(&self, model: &str) -> bool {
        self.models.iter().any(|m| m.name == model && m.available)
    }
}

/// An execution strategy a step may use, with the models it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyProfile {
    pub name: String,
    #[serde(default)]
    pub required_models: Vec<String>,
}

/// Limits a step must respect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub allowed_strategies: Vec<StrategyProfile>,
}

impl ResourceConstraints {
    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    pub fn with_max_time(mut self, max_time_ms: u64) -> Self {
        self.max_time_ms = Some(max_time_ms);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_strategy(mut self, name: impl Into<String>, models: &[&str]) -> Self {
        self.allowed_strategies.push(StrategyProfile {
            name: name.into(),
            required_models: models.iter().map(|m| m.to_string()).collect(),
        });
        self
    }

    /// Every model required by any allowed strategy.
    pub fn required_models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = self
            .allowed_strategies
            .iter()
            .flat_map(|s| s.required_models.iter().map(|m| m.as_str()))
            .collect();
        models.sort_unstable();
        models.dedup();
        models
    }
}

/// Resource usage, either estimated or measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub api_calls: u64,
    #[serde(default)]
    pub compute_time_ms: u64,
    #[serde(default)]
    pub memory_mb: u64,
}

impl ResourceUsage {
    /// Merge incremental usage: sum cost/tokens/API calls, keep the max of
    /// compute time and memory.
    pub fn merge(&mut self, other: &ResourceUsage) {
        self.cost += other.cost;
        self.tokens += other.tokens;
        self.api_calls += other.api_calls;
        self.compute_time_ms = self.compute_time_ms.max(other.compute_time_ms);
        self.memory_mb = self.memory_mb.max(other.memory_mb);
    }
}
