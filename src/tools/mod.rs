//! Tool provider: named async callables resolved per engine instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Error type for tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),
}

/// Trait for tools an agent can run from a `call_tool` intent.
///
/// The contract is `(args: map) -> result | raises`; anything richer
/// (schemas, cost estimation, approval flows) belongs to the out-of-scope
/// model-facing layer.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name.
    fn name(&self) -> &str;

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: Value) -> Result<Value, ToolError>;
}

/// Registry mapping tool names to implementations.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the builtin tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(ClockTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }
}

/// Echoes back the `message` argument. Useful for wiring checks and tests.
#[derive(Debug)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'message' parameter".into()))?;
        Ok(Value::String(message.to_string()))
    }
}

/// Reports the current UTC time.
#[derive(Debug)]
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        Ok(serde_json::json!({ "now": chrono::Utc::now().to_rfc3339() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echo_tool_round_trips_message() {
        let tool = EchoTool;
        let result = tool.execute(json!({"message": "hello"})).await.unwrap();
        assert_eq!(result, json!("hello"));
    }

    #[tokio::test]
    async fn echo_tool_rejects_missing_message() {
        let tool = EchoTool;
        let err = tool.execute(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[test]
    fn registry_resolves_builtins() {
        let registry = ToolRegistry::with_builtins();
        assert!(registry.get("echo").is_some());
        assert!(registry.get("clock").is_some());
        assert!(registry.get("nope").is_none());
        let mut names = registry.names();
        names.sort_unstable();
        assert_eq!(names, vec!["clock", "echo"]);
    }
}
