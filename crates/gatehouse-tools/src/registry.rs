use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use gatehouse_core::error::{GatehouseError, Result};
use gatehouse_core::traits::Tool;
use gatehouse_core::types::{ToolContext, ToolDefinition, ToolResult};

/// Registry of available tools. Read-only once the engine starts.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Minimum timeout applied to every call.
    timeout_floor_secs: u64,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            timeout_floor_secs: 0,
        }
    }

    /// Raise every tool's timeout to at least `secs`.
    pub fn with_timeout_floor(mut self, secs: u64) -> Self {
        self.timeout_floor_secs = secs;
        self
    }

    /// Register a tool. A later registration with the same name replaces the earlier one.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Replacing previously registered tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Tool definitions for the model. An empty `allowed` slice means every tool.
    pub fn definitions(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| allowed.is_empty() || allowed.iter().any(|a| a == t.name()))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name, bounded by its timeout.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| GatehouseError::ToolNotFound(name.to_string()))?;

        let timeout_secs = tool.timeout_secs().max(self.timeout_floor_secs);
        debug!(tool = name, instance_id = %ctx.instance_id, node_id = %ctx.node_id, "Executing tool");

        match tokio::time::timeout(Duration::from_secs(timeout_secs), tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(GatehouseError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs,
            }),
        }
    }

    /// Execute and fold any failure into an error result, so callers always get output text.
    pub async fn execute_folded(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> ToolResult {
        match self.execute(name, input, ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = name, error = %e, "Tool call failed");
                ToolResult::error(e.to_string())
            }
        }
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::CalculatorTool);
        registry.register(crate::builtin::CurrentTimeTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
