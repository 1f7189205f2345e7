// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::ApprovalPolicy;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed and schema-validated JSON arguments.
    pub args: Value,
}

/// Describes the shape of a tool's text output for context-aware
/// truncation. `gateway-core` picks the extraction strategy from this
/// category; no tool name is ever hard-coded outside the tool itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal/process output: keep head + tail so both the command
    /// preamble and final result remain visible.
    HeadTail,
    /// Ordered match list: keep the leading, highest-relevance matches.
    MatchList,
    /// File content: head + tail window with a separator.
    FileContent,
    /// Generic text: hard-truncate at the character boundary.
    #[default]
    Generic,
}

/// Internal, rich representation of a tool's result, prior to being
/// wrapped into the standard transcript envelope ([`ToolResult`]).
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
    pub error_code: Option<String>,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            error_code: None,
        }
    }

    pub fn err(call_id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: message.into(),
            is_error: true,
            error_code: Some(code.into()),
        }
    }
}

/// The standard result envelope every tool call resolves to (§6 Tool
/// contract). This is the only shape ever embedded in the transcript or
/// forwarded back to the model — free-form strings are never acceptable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolResultError>,
    pub meta: ToolResultMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultMeta {
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ToolResult {
    pub fn from_output(output: ToolOutput, duration_ms: u64, category: OutputCategory, max_chars: usize) -> Self {
        let meta = ToolResultMeta {
            duration_ms,
            timestamp: Utc::now(),
        };
        if output.is_error {
            return ToolResult {
                success: false,
                data: None,
                error: Some(ToolResultError {
                    code: output.error_code.unwrap_or_else(|| "TOOL_ERROR".to_string()),
                    message: output.content,
                }),
                meta,
            };
        }
        let truncated = smart_truncate(&output.content, category, max_chars);
        ToolResult {
            success: true,
            data: Some(Value::String(truncated)),
            error: None,
            meta,
        }
    }
}

/// Truncate oversized tool output while preserving structure, per category.
/// Below `max_chars` the content passes through unchanged.
pub fn smart_truncate(content: &str, category: OutputCategory, max_chars: usize) -> String {
    if content.len() <= max_chars {
        return content.to_string();
    }

    const MARKER: &str = "\n…[truncated]…\n";

    match category {
        OutputCategory::HeadTail | OutputCategory::FileContent => {
            let half = max_chars.saturating_sub(MARKER.len()) / 2;
            let head = take_chars(content, half);
            let tail = take_last_chars(content, half);
            format!("{head}{MARKER}{tail}")
        }
        OutputCategory::MatchList => {
            let budget = max_chars.saturating_sub(MARKER.len());
            let mut out = String::new();
            for line in content.lines() {
                if out.len() + line.len() + 1 > budget {
                    break;
                }
                out.push_str(line);
                out.push('\n');
            }
            out.push_str(MARKER.trim_start());
            out
        }
        OutputCategory::Generic => {
            let budget = max_chars.saturating_sub(MARKER.len());
            format!("{}{}", take_chars(content, budget), MARKER)
        }
    }
}

fn take_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn take_last_chars(s: &str, n: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    let start = chars.len().saturating_sub(n);
    chars[start..].iter().collect()
}

/// Trait every built-in and user-defined tool must implement. Concrete
/// tools (file, shell, browser, etc.) are out of this core's scope; only
/// the contract and registry live here.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters.
    fn parameters_schema(&self) -> Value;
    fn category(&self) -> &str {
        "general"
    }
    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Execute the tool. Errors should be wrapped in [`ToolOutput::err`],
    /// never panicked or bubbled as a bare string.
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, call.args["text"].as_str().unwrap_or(""))
        }
    }

    #[tokio::test]
    async fn tool_result_wraps_success_output() {
        let call = ToolCall {
            id: "c1".into(),
            name: "echo".into(),
            args: serde_json::json!({"text": "hi"}),
        };
        let out = EchoTool.execute(&call).await;
        let result = ToolResult::from_output(out, 5, OutputCategory::Generic, 1000);
        assert!(result.success);
        assert_eq!(result.data.unwrap(), serde_json::json!("hi"));
        assert!(result.error.is_none());
    }

    #[test]
    fn tool_result_wraps_error_output() {
        let out = ToolOutput::err("c2", "ARG_VALIDATION", "missing field 'path'");
        let result = ToolResult::from_output(out, 1, OutputCategory::Generic, 1000);
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, "ARG_VALIDATION");
        assert!(result.data.is_none());
    }

    #[test]
    fn smart_truncate_passes_through_under_budget() {
        let s = "short content";
        assert_eq!(smart_truncate(s, OutputCategory::Generic, 1000), s);
    }

    #[test]
    fn smart_truncate_head_tail_preserves_both_ends() {
        let content: String = (0..500).map(|i| format!("line{i}\n")).collect();
        let truncated = smart_truncate(&content, OutputCategory::HeadTail, 200);
        assert!(truncated.contains("line0"));
        assert!(truncated.contains("line499") || truncated.contains("line49"));
        assert!(truncated.contains("[truncated]"));
    }

    #[test]
    fn smart_truncate_match_list_keeps_leading_lines() {
        let content: String = (0..200).map(|i| format!("match-{i}\n")).collect();
        let truncated = smart_truncate(&content, OutputCategory::MatchList, 100);
        assert!(truncated.contains("match-0"));
        assert!(!truncated.contains("match-199"));
    }

    #[test]
    fn smart_truncate_generic_hard_cuts() {
        let content = "a".repeat(1000);
        let truncated = smart_truncate(&content, OutputCategory::Generic, 100);
        assert!(truncated.len() <= 100 + "\n…[truncated]…\n".len());
    }
}
