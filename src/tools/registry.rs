//! Tool registry for termpal
//!
//! Tools are collected with a [`ToolRegistryBuilder`] while the session is set
//! up, then frozen into a [`ToolRegistry`] that is read-only for the rest of
//! the session and cheap to share between the agent loop and the executor.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::error::{Result, TermpalError};
use crate::providers::ToolDefinition;

use super::schema::check_schema;
use super::Tool;

/// Collects tools before the registry is frozen.
///
/// # Example
///
/// ```rust
/// use termpal::tools::{ToolRegistryBuilder, EchoTool};
///
/// let registry = ToolRegistryBuilder::new()
///     .register(EchoTool)
///     .unwrap()
///     .build();
/// assert!(registry.has("echo"));
/// ```
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    ///
    /// Fails with a configuration error when the name is empty or already
    /// taken, or when the parameter schema is not a usable object schema.
    pub fn register<T: Tool + 'static>(self, tool: T) -> Result<Self> {
        self.register_arc(Arc::new(tool))
    }

    /// Register an already shared tool.
    pub fn register_arc(mut self, tool: Arc<dyn Tool>) -> Result<Self> {
        let name = tool.name().to_string();
        if name.trim().is_empty() {
            return Err(TermpalError::Config(
                "tool name must not be empty".to_string(),
            ));
        }
        if self.tools.contains_key(&name) {
            return Err(TermpalError::Config(format!(
                "tool '{}' is registered twice",
                name
            )));
        }
        check_schema(&name, &tool.parameters())?;
        info!(tool = %name, destructive = tool.is_destructive(), "Registering tool");
        self.tools.insert(name, tool);
        Ok(self)
    }

    /// Freeze the registry.
    pub fn build(self) -> ToolRegistry {
        ToolRegistry {
            tools: Arc::new(self.tools),
        }
    }
}

/// A frozen name-to-tool mapping.
///
/// Cloning is cheap; all clones share the same tools. Iteration order is
/// sorted by name so tool listings are stable.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<BTreeMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Registry without tools.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Get a tool by name.
    ///
    /// # Example
    /// ```
    /// use termpal::tools::{ToolRegistryBuilder, EchoTool};
    ///
    /// let registry = ToolRegistryBuilder::new().register(EchoTool).unwrap().build();
    /// assert_eq!(registry.get("echo").as_deref().map(|t| t.name()), Some("echo"));
    /// assert!(registry.get("missing").is_none());
    /// ```
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Definitions of every tool, in name order, for the model backend.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters()))
            .collect()
    }

    /// Names of all registered tools, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, ToolCategory, ToolContext, ToolOutput};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct NamedTool {
        name: &'static str,
        schema: Value,
    }

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "test tool"
        }

        fn parameters(&self) -> Value {
            self.schema.clone()
        }

        fn category(&self) -> ToolCategory {
            ToolCategory::General
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            Ok(ToolOutput::ok(self.name))
        }
    }

    fn object_schema() -> Value {
        json!({"type": "object", "properties": {}})
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ToolRegistryBuilder::new()
            .register(EchoTool)
            .unwrap()
            .build();
        assert_eq!(registry.len(), 1);
        assert!(registry.has("echo"));
        assert!(!registry.has("nope"));
        assert!(registry.get("echo").is_some());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = ToolRegistryBuilder::new()
            .register(EchoTool)
            .unwrap()
            .register(EchoTool);
        match result {
            Err(TermpalError::Config(msg)) => assert!(msg.contains("registered twice")),
            other => panic!("expected config error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let result = ToolRegistryBuilder::new().register(NamedTool {
            name: "bad",
            schema: json!({"type": "array"}),
        });
        assert!(matches!(result, Err(TermpalError::Config(_))));
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = ToolRegistryBuilder::new().register(NamedTool {
            name: "  ",
            schema: object_schema(),
        });
        assert!(matches!(result, Err(TermpalError::Config(_))));
    }

    #[test]
    fn test_definitions_sorted_by_name() {
        let registry = ToolRegistryBuilder::new()
            .register(NamedTool {
                name: "zeta",
                schema: object_schema(),
            })
            .unwrap()
            .register(NamedTool {
                name: "alpha",
                schema: object_schema(),
            })
            .unwrap()
            .build();
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_clones_share_tools() {
        let registry = ToolRegistryBuilder::new()
            .register(EchoTool)
            .unwrap()
            .build();
        let clone = registry.clone();
        assert!(clone.has("echo"));
        assert!(ToolRegistry::empty().is_empty());
    }
}
