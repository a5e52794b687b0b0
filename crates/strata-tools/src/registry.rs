//! The integrated tool registry.
//!
//! One registry instance is built by the composition root and shared by
//! `Arc`. It keeps every tool tagged with the source it came from, so that
//! dynamic tools can be removed and external providers refreshed without
//! touching built-ins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_types::{ExecutionId, RiskLevel};

use crate::error::{Result, ToolError};
use crate::tool::{Tool, ToolContext, ToolOutput};

// ─────────────────────────────────────────────────────────────────────────────
// Sources and configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Where a registered tool came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "provider")]
pub enum ToolSource {
    BuiltIn,
    Dynamic,
    /// Discovered through the named external provider.
    External(String),
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Tools at or above this level go through the approval gate.
    pub approval_threshold: RiskLevel,
    /// Skip the approval gate entirely.
    pub auto_approve: bool,
    /// Timeout applied when the caller supplies none.
    pub default_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            approval_threshold: RiskLevel::High,
            auto_approve: false,
            default_timeout: Duration::from_secs(30),
        }
    }
}

impl RegistryConfig {
    pub fn with_approval_threshold(mut self, threshold: RiskLevel) -> Self {
        self.approval_threshold = threshold;
        self
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Summary of a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub risk_level: RiskLevel,
    pub source: ToolSource,
}

// ─────────────────────────────────────────────────────────────────────────────
// Approval gate
// ─────────────────────────────────────────────────────────────────────────────

/// A request to run a high-risk tool.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub tool: String,
    pub risk_level: RiskLevel,
    pub parameters: Value,
    pub execution_id: ExecutionId,
    pub step_id: String,
}

/// Verdict of an approval gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied(String),
}

/// Decides whether a high-risk tool may run.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn review(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Gate that approves every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn review(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}

/// Gate that denies every request. The default when nothing is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl ApprovalGate for DenyAll {
    async fn review(&self, request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Denied(format!(
            "no approver configured for {} risk tools",
            request.risk_level
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// External providers
// ─────────────────────────────────────────────────────────────────────────────

/// A source of tools that live outside the process's own code.
#[async_trait]
pub trait ExternalToolProvider: Send + Sync {
    /// Provider name, used to tag discovered tools.
    fn name(&self) -> &str;

    /// Discover the tools this provider currently offers.
    async fn discover(&self) -> Result<Vec<Arc<dyn Tool>>>;
}

/// Provider backed by a fixed list of tools.
pub struct StaticToolProvider {
    name: String,
    tools: Vec<Arc<dyn Tool>>,
}

impl StaticToolProvider {
    pub fn new(name: impl Into<String>, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            name: name.into(),
            tools,
        }
    }
}

#[async_trait]
impl ExternalToolProvider for StaticToolProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<Arc<dyn Tool>>> {
        Ok(self.tools.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Entry {
    tool: Arc<dyn Tool>,
    source: ToolSource,
}

/// Registry unifying built-in, dynamic and external tools.
pub struct IntegratedToolRegistry {
    tools: RwLock<HashMap<String, Entry>>,
    providers: RwLock<Vec<Arc<dyn ExternalToolProvider>>>,
    approval_gate: Arc<dyn ApprovalGate>,
    config: RegistryConfig,
}

impl IntegratedToolRegistry {
    /// Create an empty registry that denies high-risk tools.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            providers: RwLock::new(Vec::new()),
            approval_gate: Arc::new(DenyAll),
            config,
        }
    }

    /// Use a specific approval gate.
    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval_gate = gate;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a built-in tool, replacing any tool of the same name.
    pub fn register_builtin(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!(tool = %name, "Registered built-in tool");
        self.tools.write().insert(
            name,
            Entry {
                tool,
                source: ToolSource::BuiltIn,
            },
        );
    }

    /// Register a dynamic tool.
    ///
    /// Fails if the name is taken by a tool from another source.
    pub fn register_dynamic(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        let mut tools = self.tools.write();
        if let Some(existing) = tools.get(&name)
            && existing.source != ToolSource::Dynamic
        {
            return Err(ToolError::Conflict(format!(
                "'{name}' is already registered as {:?}",
                existing.source
            )));
        }
        tracing::debug!(tool = %name, "Registered dynamic tool");
        tools.insert(
            name,
            Entry {
                tool,
                source: ToolSource::Dynamic,
            },
        );
        Ok(())
    }

    /// Remove a dynamic tool. Built-in and external tools cannot be removed.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut tools = self.tools.write();
        match tools.get(name).map(|e| e.source.clone()) {
            None => Err(ToolError::NotFound(name.to_string())),
            Some(ToolSource::Dynamic) => {
                tools.remove(name);
                Ok(())
            }
            Some(source) => Err(ToolError::Conflict(format!(
                "'{name}' is a {source:?} tool and cannot be unregistered"
            ))),
        }
    }

    /// Add an external provider and register the tools it offers.
    ///
    /// Returns the number of tools registered. Names already taken by
    /// built-in or dynamic tools are skipped with a warning.
    pub async fn add_provider(&self, provider: Arc<dyn ExternalToolProvider>) -> Result<usize> {
        let count = self.sync_provider(provider.as_ref()).await?;
        self.providers.write().push(provider);
        Ok(count)
    }

    /// Re-run discovery on every provider.
    ///
    /// A failing provider keeps its previous tools and the error is logged.
    pub async fn refresh_providers(&self) -> usize {
        let providers: Vec<_> = self.providers.read().clone();
        let mut total = 0;
        for provider in providers {
            match self.sync_provider(provider.as_ref()).await {
                Ok(count) => total += count,
                Err(e) => {
                    tracing::warn!(provider = provider.name(), error = %e, "Tool discovery failed");
                }
            }
        }
        total
    }

    async fn sync_provider(&self, provider: &dyn ExternalToolProvider) -> Result<usize> {
        let discovered = provider
            .discover()
            .await
            .map_err(|e| ToolError::Provider {
                provider: provider.name().to_string(),
                message: e.to_string(),
            })?;
        let source = ToolSource::External(provider.name().to_string());

        let mut tools = self.tools.write();
        tools.retain(|_, e| e.source != source);
        let mut count = 0;
        for tool in discovered {
            let name = tool.name().to_string();
            if tools.contains_key(&name) {
                tracing::warn!(
                    tool = %name,
                    provider = provider.name(),
                    "Skipping external tool that shadows an existing tool"
                );
                continue;
            }
            tools.insert(
                name,
                Entry {
                    tool,
                    source: source.clone(),
                },
            );
            count += 1;
        }
        tracing::info!(provider = provider.name(), tools = count, "Synced external tools");
        Ok(count)
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).map(|e| Arc::clone(&e.tool))
    }

    /// Check if a tool exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// All tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Describe registered tools, optionally only those from one source.
    pub fn list(&self, source: Option<&ToolSource>) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self
            .tools
            .read()
            .iter()
            .filter(|(_, e)| source.is_none_or(|s| *s == e.source))
            .map(|(name, e)| ToolInfo {
                name: name.clone(),
                description: e.tool.description().to_string(),
                risk_level: e.tool.risk_level(),
                source: e.source.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Execute a tool by name under the default timeout.
    pub async fn execute(&self, name: &str, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        self.execute_with_timeout(name, params, ctx, None).await
    }

    /// Execute a tool by name.
    ///
    /// High-risk tools are reviewed by the approval gate first. The tool is
    /// cancelled if it does not finish within `timeout` (or the configured
    /// default).
    pub async fn execute_with_timeout(
        &self,
        name: &str,
        params: Value,
        ctx: &ToolContext,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let risk = tool.risk_level();
        if risk >= self.config.approval_threshold && !self.config.auto_approve {
            let request = ApprovalRequest {
                tool: name.to_string(),
                risk_level: risk,
                parameters: params.clone(),
                execution_id: ctx.execution_id,
                step_id: ctx.step_id.clone(),
            };
            if let ApprovalDecision::Denied(reason) = self.approval_gate.review(&request).await {
                tracing::warn!(tool = name, %risk, reason = %reason, "Tool execution denied");
                return Err(ToolError::ApprovalDenied {
                    tool: name.to_string(),
                    reason,
                });
            }
        }

        let timeout = timeout.unwrap_or(self.config.default_timeout);
        tracing::debug!(tool = name, step = %ctx.step_id, attempt = ctx.attempt, "Executing tool");
        match tokio::time::timeout(timeout, tool.execute(params, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool: name.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl std::fmt::Debug for IntegratedToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegratedToolRegistry")
            .field("tools", &self.names())
            .field("providers", &self.providers.read().len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::MockTool;
    use serde_json::json;

    fn ctx() -> ToolContext {
        ToolContext::new(ExecutionId::new(), "Task_1")
    }

    #[test]
    fn test_registry_empty() {
        let registry = IntegratedToolRegistry::new(RegistryConfig::default());
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.names().is_empty());
    }

    #[tokio::test]
    async fn test_register_and_execute_builtin() {
        let registry = IntegratedToolRegistry::new(RegistryConfig::default());
        let tool = Arc::new(MockTool::new("mock").with_response(json!({"x": 1})));
        registry.register_builtin(tool.clone());

        assert!(registry.contains("mock"));
        let out = registry.execute("mock", json!({"p": true}), &ctx()).await.unwrap();
        assert_eq!(out.data, json!({"x": 1}));
        assert_eq!(tool.calls(), vec![json!({"p": true})]);
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let registry = IntegratedToolRegistry::new(RegistryConfig::default());
        let err = registry.execute("missing", json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_high_risk_denied_by_default() {
        let registry = IntegratedToolRegistry::new(RegistryConfig::default());
        let tool = Arc::new(MockTool::new("dangerous").with_risk(RiskLevel::Critical));
        registry.register_builtin(tool.clone());

        let err = registry.execute("dangerous", json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::ApprovalDenied { .. }));
        assert_eq!(tool.call_count(), 0);
    }

    #[tokio::test]
    async fn test_high_risk_approved_by_gate() {
        let registry = IntegratedToolRegistry::new(RegistryConfig::default())
            .with_approval_gate(Arc::new(AutoApprove));
        let tool = Arc::new(MockTool::new("dangerous").with_risk(RiskLevel::High));
        registry.register_builtin(tool.clone());

        registry.execute("dangerous", json!({}), &ctx()).await.unwrap();
        assert_eq!(tool.call_count(), 1);
    }

    #[tokio::test]
    async fn test_below_threshold_skips_gate() {
        let registry = IntegratedToolRegistry::new(
            RegistryConfig::default().with_approval_threshold(RiskLevel::Critical),
        );
        registry.register_builtin(Arc::new(MockTool::new("medium").with_risk(RiskLevel::High)));
        assert!(registry.execute("medium", json!({}), &ctx()).await.is_ok());
    }

    #[tokio::test]
    async fn test_auto_approve_config() {
        let registry =
            IntegratedToolRegistry::new(RegistryConfig::default().with_auto_approve(true));
        registry.register_builtin(Arc::new(
            MockTool::new("dangerous").with_risk(RiskLevel::Critical),
        ));
        assert!(registry.execute("dangerous", json!({}), &ctx()).await.is_ok());
    }

    #[test]
    fn test_dynamic_tools_can_be_unregistered() {
        let registry = IntegratedToolRegistry::new(RegistryConfig::default());
        registry.register_builtin(Arc::new(MockTool::new("builtin")));
        registry
            .register_dynamic(Arc::new(MockTool::new("dynamic")))
            .unwrap();

        assert!(matches!(
            registry.register_dynamic(Arc::new(MockTool::new("builtin"))),
            Err(ToolError::Conflict(_))
        ));
        assert!(matches!(
            registry.unregister("builtin"),
            Err(ToolError::Conflict(_))
        ));
        registry.unregister("dynamic").unwrap();
        assert!(!registry.contains("dynamic"));
        assert!(matches!(
            registry.unregister("dynamic"),
            Err(ToolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_external_provider_discovery() {
        let registry = IntegratedToolRegistry::new(RegistryConfig::default());
        registry.register_builtin(Arc::new(MockTool::new("echo")));

        let provider = Arc::new(StaticToolProvider::new(
            "remote",
            vec![
                Arc::new(MockTool::new("search")) as Arc<dyn Tool>,
                Arc::new(MockTool::new("echo")) as Arc<dyn Tool>,
            ],
        ));
        let count = registry.add_provider(provider).await.unwrap();
        assert_eq!(count, 1);

        let external = registry.list(Some(&ToolSource::External("remote".into())));
        assert_eq!(external.len(), 1);
        assert_eq!(external[0].name, "search");
        assert_eq!(registry.list(Some(&ToolSource::BuiltIn)).len(), 1);
        assert_eq!(registry.list(None).len(), 2);

        assert_eq!(registry.refresh_providers().await, 1);
        assert_eq!(registry.len(), 2);
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Sleeps for a long time"
        }

        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ToolOutput::new(Value::Null))
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let registry = IntegratedToolRegistry::new(RegistryConfig::default());
        registry.register_builtin(Arc::new(SlowTool));
        let err = registry
            .execute_with_timeout("slow", json!({}), &ctx(), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { timeout_ms: 20, .. }));
    }
}
