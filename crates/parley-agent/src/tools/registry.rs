//! Registry of tools a persona may call.

use crate::error::{AgentError, Result};
use crate::llm::types::ToolDefinition;

/// Ordered set of [`ToolDefinition`]s with unique names.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from definitions, rejecting duplicates.
    pub fn with_tools(tools: impl IntoIterator<Item = ToolDefinition>) -> Result<Self> {
        let mut registry = Self::new();
        for tool in tools {
            registry.register(tool)?;
        }
        Ok(registry)
    }

    /// Register a definition.
    ///
    /// # Errors
    ///
    /// [`AgentError::DuplicateTool`] if the name is taken, and
    /// [`AgentError::ValidationError`] for an empty name.
    pub fn register(&mut self, tool: ToolDefinition) -> Result<()> {
        if tool.name.trim().is_empty() {
            return Err(AgentError::ValidationError {
                reason: "tool name must not be empty".into(),
            });
        }
        if self.contains(&tool.name) {
            return Err(AgentError::DuplicateTool {
                tool_name: tool.name,
            });
        }
        tracing::debug!(tool = %tool.name, params = tool.parameters.len(), "tool registered");
        self.tools.push(tool);
        Ok(())
    }

    /// Look a tool up by name.
    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Whether a tool with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All definitions in registration order.
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no tool is registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
