//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [resources]              # budget ledger and rate limits
//! [resources.rate_limits.api_calls]
//! [resources.user_credits]
//! [recovery]               # default backoff parameters
//! [navigation]             # depth and step caps
//! [tools]                  # approval gate
//! [logging]
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strata_types::RiskLevel;

use crate::error::ConfigError;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub resources: Option<ResourcesConfig>,
    pub recovery: Option<RecoveryConfigSection>,
    pub navigation: Option<NavigationConfigSection>,
    pub tools: Option<ToolsConfig>,
    pub logging: Option<LoggingConfig>,
}

impl StrataConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        let config: StrataConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced whole; the exception is `resources.user_credits`
    /// and `resources.rate_limits`, whose entries are merged by key.
    pub fn merge(&mut self, other: StrataConfig) {
        match (self.resources.as_mut(), other.resources) {
            (Some(base), Some(top)) => {
                let mut user_credits = std::mem::take(&mut base.user_credits);
                let mut rate_limits = std::mem::take(&mut base.rate_limits);
                user_credits.extend(top.user_credits.clone());
                rate_limits.extend(top.rate_limits.clone());
                *base = ResourcesConfig {
                    user_credits,
                    rate_limits,
                    ..top
                };
            }
            (None, Some(top)) => self.resources = Some(top),
            (_, None) => {}
        }

        if other.recovery.is_some() {
            self.recovery = other.recovery;
        }

        if other.navigation.is_some() {
            self.navigation = other.navigation;
        }

        if other.tools.is_some() {
            self.tools = other.tools;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(ref resources) = self.resources {
            resources.validate()?;
        }
        if let Some(ref navigation) = self.navigation
            && navigation.max_subprocess_depth == 0
        {
            return Err(ConfigError::invalid(
                "navigation.max_subprocess_depth",
                "must be at least 1",
            ));
        }
        if let Some(ref recovery) = self.recovery
            && recovery.max_attempts == 0
        {
            return Err(ConfigError::invalid(
                "recovery.max_attempts",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// The resources section, or defaults.
    pub fn resources(&self) -> ResourcesConfig {
        self.resources.clone().unwrap_or_default()
    }

    /// The recovery section, or defaults.
    pub fn recovery(&self) -> RecoveryConfigSection {
        self.recovery.clone().unwrap_or_default()
    }

    /// The navigation section, or defaults.
    pub fn navigation(&self) -> NavigationConfigSection {
        self.navigation.clone().unwrap_or_default()
    }

    /// The tools section, or defaults.
    pub fn tools(&self) -> ToolsConfig {
        self.tools.clone().unwrap_or_default()
    }

    /// The logging section, or defaults.
    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resources
// ─────────────────────────────────────────────────────────────────────────────

/// Default global credit pool.
pub const DEFAULT_GLOBAL_CREDITS: f64 = 10_000.0;

/// `[resources]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Global credit pool shared by all executions.
    pub global_credits: f64,
    /// Seconds a finalized allocation is kept for inspection.
    pub retention_secs: u64,
    /// Usage ratio that emits `resource.warning`.
    pub warning_threshold: f64,
    /// Usage ratio that marks an allocation exceeded.
    pub critical_threshold: f64,
    /// Default share of a parent allocation given to child work.
    pub child_allocation_ratio: f64,
    /// Sliding-window limits per resource type.
    pub rate_limits: HashMap<String, RateLimitConfig>,
    /// Initial tracked credit balance per user.
    pub user_credits: HashMap<String, f64>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            global_credits: DEFAULT_GLOBAL_CREDITS,
            retention_secs: 60,
            warning_threshold: 0.8,
            critical_threshold: 0.95,
            child_allocation_ratio: 0.3,
            rate_limits: HashMap::new(),
            user_credits: HashMap::new(),
        }
    }
}

impl ResourcesConfig {
    fn validate(&self) -> crate::Result<()> {
        if self.global_credits < 0.0 {
            return Err(ConfigError::invalid(
                "resources.global_credits",
                "must not be negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.child_allocation_ratio) {
            return Err(ConfigError::invalid(
                "resources.child_allocation_ratio",
                "must be between 0 and 1",
            ));
        }
        if self.warning_threshold > self.critical_threshold {
            return Err(ConfigError::invalid(
                "resources.warning_threshold",
                format!(
                    "{} is above critical_threshold {}",
                    self.warning_threshold, self.critical_threshold
                ),
            ));
        }
        for (name, limit) in &self.rate_limits {
            if limit.window_secs == 0 {
                return Err(ConfigError::invalid(
                    &format!("resources.rate_limits.{name}.window_secs"),
                    "must be at least 1",
                ));
            }
        }
        Ok(())
    }
}

/// One sliding-window rate limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum units per window.
    pub limit: u64,
    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

// ─────────────────────────────────────────────────────────────────────────────
// Recovery
// ─────────────────────────────────────────────────────────────────────────────

/// `[recovery]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfigSection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempt budget for a fresh failure.
    pub max_attempts: u32,
    /// Timeout of a retried attempt.
    pub timeout_ms: u64,
}

impl Default for RecoveryConfigSection {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 3,
            timeout_ms: 30_000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Navigation
// ─────────────────────────────────────────────────────────────────────────────

/// `[navigation]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfigSection {
    pub max_subprocess_depth: usize,
    /// Steps a single routine run may take before it is aborted.
    pub max_steps: usize,
}

impl Default for NavigationConfigSection {
    fn default() -> Self {
        Self {
            max_subprocess_depth: 32,
            max_steps: 1000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tools
// ─────────────────────────────────────────────────────────────────────────────

/// `[tools]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Tools at or above this risk level need approval.
    pub approval_threshold: RiskLevel,
    /// Approve everything without asking.
    pub auto_approve: bool,
    /// Default per-tool timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            approval_threshold: RiskLevel::High,
            auto_approve: false,
            timeout_ms: 30_000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Write JSON logs to a daily rolling file.
    pub file_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_logging: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = StrataConfig::from_toml(
            r#"
[resources]
global_credits = 500.0
retention_secs = 5

[resources.rate_limits.api_calls]
limit = 10
window_secs = 1

[resources.user_credits]
alice = 100.0

[recovery]
base_delay_ms = 10

[navigation]
max_subprocess_depth = 4

[tools]
approval_threshold = "critical"
auto_approve = true

[logging]
level = "debug"
file_logging = false
"#,
        )
        .unwrap();

        let resources = config.resources();
        assert_eq!(resources.global_credits, 500.0);
        assert_eq!(resources.retention_secs, 5);
        assert_eq!(resources.warning_threshold, 0.8);
        assert_eq!(resources.rate_limits["api_calls"].limit, 10);
        assert_eq!(resources.user_credits["alice"], 100.0);
        assert_eq!(config.recovery().base_delay_ms, 10);
        assert_eq!(config.recovery().max_attempts, 3);
        assert_eq!(config.navigation().max_subprocess_depth, 4);
        assert_eq!(config.navigation().max_steps, 1000);
        assert_eq!(config.tools().approval_threshold, RiskLevel::Critical);
        assert!(!config.logging().file_logging);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = StrataConfig::from_toml("").unwrap();
        assert!(config.resources.is_none());
        assert_eq!(config.resources().retention_secs, 60);
        assert_eq!(config.resources().child_allocation_ratio, 0.3);
        assert_eq!(config.tools().approval_threshold, RiskLevel::High);
        assert_eq!(config.navigation().max_subprocess_depth, 32);
    }

    #[test]
    fn test_merge_overrides_sections() {
        let mut base = StrataConfig::from_toml(
            r#"
[navigation]
max_steps = 10

[logging]
level = "warn"
"#,
        )
        .unwrap();
        let top = StrataConfig::from_toml(
            r#"
[navigation]
max_steps = 20
"#,
        )
        .unwrap();
        base.merge(top);
        assert_eq!(base.navigation().max_steps, 20);
        assert_eq!(base.logging().level, "warn");
    }

    #[test]
    fn test_merge_combines_user_credits() {
        let mut base = StrataConfig::from_toml(
            r#"
[resources.user_credits]
alice = 10.0
bob = 20.0
"#,
        )
        .unwrap();
        let top = StrataConfig::from_toml(
            r#"
[resources]
global_credits = 42.0

[resources.user_credits]
bob = 99.0
"#,
        )
        .unwrap();
        base.merge(top);
        let resources = base.resources();
        assert_eq!(resources.global_credits, 42.0);
        assert_eq!(resources.user_credits["alice"], 10.0);
        assert_eq!(resources.user_credits["bob"], 99.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = StrataConfig::from_toml("[navigation]\nmax_subprocess_depth = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = StrataConfig::from_toml(
            "[resources]\nwarning_threshold = 0.99\ncritical_threshold = 0.9\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("warning_threshold"));

        let err =
            StrataConfig::from_toml("[resources]\nchild_allocation_ratio = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("child_allocation_ratio"));
    }

    #[test]
    fn test_toml_roundtrip_keeps_sections() {
        let config = StrataConfig {
            tools: Some(ToolsConfig::default()),
            ..Default::default()
        };
        let text = config.to_toml().unwrap();
        assert!(text.contains("[tools]"));
        assert_eq!(StrataConfig::from_toml(&text).unwrap(), config);
    }
}
