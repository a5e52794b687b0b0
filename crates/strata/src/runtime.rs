//! Composition root: turns a [`StrataConfig`] into a wired engine.
//!
//! This is the only place that sees both the config sections and the runtime
//! config structs of the library crates.

use std::sync::Arc;
use std::time::Duration;

use strata_config::{
    NavigationConfigSection, RecoveryConfigSection, ResourcesConfig, StrataConfig, ToolsConfig,
};
use strata_navigation::{NavigationConfig, TierTwoOrchestrator};
use strata_resources::{
    RateLimit, RecoveryConfig, ResourceManager, ResourceManagerConfig, SimpleRecoveryProvider,
    TierThreeExecutor,
};
use strata_tools::{IntegratedToolRegistry, RegistryConfig, register_builtins};
use strata_types::InMemoryEventBus;

/// Every component of a running engine.
pub struct Runtime {
    pub events: Arc<InMemoryEventBus>,
    pub registry: Arc<IntegratedToolRegistry>,
    pub resources: Arc<ResourceManager>,
    pub recovery: Arc<SimpleRecoveryProvider>,
    pub executor: Arc<TierThreeExecutor>,
    pub orchestrator: Arc<TierTwoOrchestrator>,
}

impl Runtime {
    /// Build the engine with the built-in tools registered.
    pub fn build(config: &StrataConfig) -> Self {
        let events = InMemoryEventBus::shared();

        let registry = Arc::new(IntegratedToolRegistry::new(registry_config(&config.tools())));
        register_builtins(&registry);

        let resources = Arc::new(ResourceManager::new(
            resource_manager_config(&config.resources()),
            events.clone(),
        ));
        let recovery = Arc::new(SimpleRecoveryProvider::new(
            recovery_config(&config.recovery()),
            events.clone(),
        ));
        let executor = Arc::new(TierThreeExecutor::new(
            registry.clone(),
            resources.clone(),
            recovery.clone(),
        ));
        let orchestrator = Arc::new(TierTwoOrchestrator::new(
            executor.clone(),
            events.clone(),
            navigation_config(&config.navigation()),
        ));

        tracing::debug!(tools = registry.len(), "Runtime ready");

        Self {
            events,
            registry,
            resources,
            recovery,
            executor,
            orchestrator,
        }
    }
}

pub fn resource_manager_config(section: &ResourcesConfig) -> ResourceManagerConfig {
    ResourceManagerConfig {
        global_credits: section.global_credits,
        retention: Duration::from_secs(section.retention_secs),
        warning_threshold: section.warning_threshold,
        critical_threshold: section.critical_threshold,
        child_allocation_ratio: section.child_allocation_ratio,
        rate_limits: section
            .rate_limits
            .iter()
            .map(|(resource, limit)| {
                (
                    resource.clone(),
                    RateLimit {
                        limit: limit.limit,
                        window: Duration::from_secs(limit.window_secs),
                    },
                )
            })
            .collect(),
        user_credits: section.user_credits.clone(),
    }
}

pub fn recovery_config(section: &RecoveryConfigSection) -> RecoveryConfig {
    RecoveryConfig {
        base_delay_ms: section.base_delay_ms,
        max_delay_ms: section.max_delay_ms,
        max_attempts: section.max_attempts,
        timeout_ms: section.timeout_ms,
    }
}

pub fn navigation_config(section: &NavigationConfigSection) -> NavigationConfig {
    NavigationConfig {
        max_subprocess_depth: section.max_subprocess_depth,
        max_steps: section.max_steps,
    }
}

pub fn registry_config(section: &ToolsConfig) -> RegistryConfig {
    RegistryConfig::default()
        .with_approval_threshold(section.approval_threshold)
        .with_auto_approve(section.auto_approve)
        .with_default_timeout(Duration::from_millis(section.timeout_ms))
}
