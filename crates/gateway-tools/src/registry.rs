// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::tool::{Tool, ToolCall, ToolOutput};

/// Static description of a registered tool, independent of any live
/// invocation. Mirrors the Tool Descriptor data model.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
    pub category: String,
    pub execute: Arc<dyn Tool>,
}

/// Central registry holding every tool available to the agent loop.
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let tool: Arc<dyn Tool> = Arc::new(tool);
        let descriptor = ToolDescriptor {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameter_schema: tool.parameters_schema(),
            category: tool.category().to_string(),
            execute: tool,
        };
        self.tools.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Descriptors for every registered tool, sorted by name for stable
    /// presentation to the model and over the control API.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self.tools.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch a call to the named tool. Unknown tool names resolve to a
    /// `ToolOutput::err`, never a panic — the agent loop treats this as a
    /// non-fatal `ToolArgInvalid`-class failure.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(descriptor) => descriptor.execute.execute(call).await,
            None => ToolOutput::err(
                &call.id,
                "UNKNOWN_TOOL",
                format!("unknown tool: {}", call.name),
            ),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::policy::ApprovalPolicy;

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn default_policy(&self) -> ApprovalPolicy {
            ApprovalPolicy::Auto
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "echo" });
        assert!(registry.get("echo").is_some());
    }

    #[test]
    fn get_unknown_returns_none() {
        let registry = ToolRegistry::new();
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn names_returns_all_registered_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "b" });
        registry.register(EchoTool { name: "a" });
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn execute_dispatches_to_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "echo" });
        let call = ToolCall {
            id: "c1".into(),
            name: "echo".into(),
            args: json!({"text": "hi"}),
        };
        let output = registry.execute(&call).await;
        assert!(!output.is_error);
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_error_output() {
        let registry = ToolRegistry::new();
        let call = ToolCall {
            id: "c1".into(),
            name: "ghost".into(),
            args: json!({}),
        };
        let output = registry.execute(&call).await;
        assert!(output.is_error);
        assert_eq!(output.error_code.as_deref(), Some("UNKNOWN_TOOL"));
    }
}
