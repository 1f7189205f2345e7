// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Reason-act turn state machine (Plan → Act → Observe → Respond/Done),
//! generalized from the teacher's `run_agentic_loop_cancellable` in
//! `sven-core/src/agent.rs`: the cancellation race via `tokio::select!`
//! and the per-tool-call dispatch shape are kept; the provider call is
//! routed through `gateway-model`'s multi-provider fallback instead of a
//! single bound `ModelProvider`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gateway_model::{CompletionRequest, ErrorClass, Message as ModelMessage, ModelRouter, Role as ModelRole, StreamEvent, ToolSchema};
use gateway_tools::{OutputCategory, ToolCall, ToolRegistry, ToolResult};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{Event, EventBus, Topic};
use crate::memory;
use crate::session::{Message, Role, SessionState, SessionStore, ToolCallRef};

const DEFAULT_MAX_ITERATIONS: u32 = 10;
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Turn {
    pub run_id: Uuid,
    pub session_key: String,
    pub started_at: Instant,
    pub iteration: u32,
    pub provider_path: Vec<String>,
    pub tokens_in: usize,
    pub tokens_out: usize,
    pub aborted: bool,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("iteration bound exceeded ({0} iterations)")]
    IterationExhausted(u32),
    #[error("turn cancelled")]
    Cancelled,
    #[error("all providers exhausted: {0}")]
    ProvidersExhausted(String),
}

pub struct AgentLoop {
    pub session_store: Arc<SessionStore>,
    pub bus: Arc<EventBus>,
    pub router: Arc<ModelRouter>,
    pub tools: Arc<ToolRegistry>,
    pub workspace_root: PathBuf,
    pub max_iterations: u32,
    pub tool_timeout: Duration,
    pub recent_window: usize,
    pub summary_token_budget: usize,
    pub summary_threshold_percent: u8,
    pub context_window: usize,
    /// Model name (or provider id) to prefer for compaction summaries.
    /// `None` falls back to the lowest-priority configured provider.
    pub subagent_model: Option<String>,
}

impl AgentLoop {
    pub fn new(
        session_store: Arc<SessionStore>,
        bus: Arc<EventBus>,
        router: Arc<ModelRouter>,
        tools: Arc<ToolRegistry>,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            session_store,
            bus,
            router,
            tools,
            workspace_root,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            recent_window: 8,
            summary_token_budget: 800,
            summary_threshold_percent: 80,
            context_window: 128_000,
            subagent_model: None,
        }
    }

    fn to_wire_messages(&self, system_prompt: &str, history: &[Message]) -> Vec<ModelMessage> {
        let mut messages = vec![ModelMessage::system(system_prompt)];
        for m in history {
            let role = match m.role {
                Role::User => ModelRole::User,
                Role::Assistant => ModelRole::Assistant,
                Role::Tool => ModelRole::Tool,
                Role::System => ModelRole::System,
            };
            let wire = ModelMessage {
                role,
                content: m.content.clone(),
                tool_call_id: m.tool_result.as_ref().map(|r| r.call_id.clone()),
                name: None,
            };
            messages.push(wire);
        }
        messages
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .descriptors()
            .into_iter()
            .map(|d| ToolSchema { name: d.name, description: d.description, parameters: d.parameter_schema })
            .collect()
    }

    /// Drives one full user turn to completion. Runs under the session's
    /// own mutex (held by the caller across this call), which is what
    /// serializes concurrent turns on the same session.
    pub async fn run_turn(
        &self,
        session: &mut crate::session::Session,
        user_text: &str,
        cancel: CancellationToken,
    ) -> Result<Turn, AgentError> {
        session.push(Message::user(user_text));
        let run_id = session.begin_turn();
        let mut turn = Turn {
            run_id,
            session_key: session.key.clone(),
            started_at: Instant::now(),
            iteration: 0,
            provider_path: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
            aborted: false,
        };

        let mut compressed_once = false;

        let result = loop {
            if cancel.is_cancelled() {
                turn.aborted = true;
                session.push(Message::assistant("[cancelled]"));
                break Err(AgentError::Cancelled);
            }

            if turn.iteration >= self.max_iterations {
                break Err(AgentError::IterationExhausted(turn.iteration));
            }
            turn.iteration += 1;
            session.transition(SessionState::Thinking);

            let system_prompt = memory::system_prompt(&self.workspace_root, "You are Talon, a personal AI assistant gateway.", "Be precise and cite file paths when relevant.");
            let estimated = memory::estimated_tokens(&system_prompt, &session.messages, 1024);

            if memory::should_compress(estimated, self.context_window, self.summary_threshold_percent) && !compressed_once {
                session.transition(SessionState::Compressing);
                self.compress(session).await;
                compressed_once = true;
                session.transition(SessionState::Thinking);
            }

            let wire_messages = self.to_wire_messages(&system_prompt, &session.messages);
            let request = CompletionRequest {
                messages: wire_messages,
                tools: self.tool_schemas(),
                max_tokens: 4096,
                temperature: 0.2,
            };

            let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
            let bus = self.bus.clone();
            let session_key = session.key.clone();
            let stream_task = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let StreamEvent::TextDelta(text) = event {
                        bus.publish(
                            Topic::AgentStream,
                            Event { session_key: session_key.clone(), payload: serde_json::json!({ "text": text }) },
                        );
                    }
                }
            });

            let invoke = self.router.invoke(request, tx, cancel.clone()).await;
            let _ = stream_task.await;

            let (completion, provider_path) = match invoke {
                Ok(ok) => ok,
                Err(exhausted) => {
                    turn.provider_path = exhausted.provider_path;
                    if exhausted.last.class == ErrorClass::ContextOverflow && !compressed_once {
                        session.transition(SessionState::Compressing);
                        self.compress(session).await;
                        compressed_once = true;
                        turn.iteration -= 1;
                        continue;
                    }
                    if exhausted.last.class == ErrorClass::Cancelled {
                        turn.aborted = true;
                        session.push(Message::assistant("[cancelled]"));
                        break Err(AgentError::Cancelled);
                    }
                    break Err(AgentError::ProvidersExhausted(exhausted.last.message));
                }
            };
            turn.provider_path = provider_path;
            turn.tokens_in += completion.usage.tokens_in;
            turn.tokens_out += completion.usage.tokens_out;

            if completion.tool_calls.is_empty() {
                session.transition(SessionState::Responding);
                session.push(Message::assistant(completion.text.clone()));
                break Ok(());
            }

            let tool_refs: Vec<ToolCallRef> = completion
                .tool_calls
                .iter()
                .map(|c| ToolCallRef { id: c.call_id.clone(), name: c.name.clone() })
                .collect();
            session.push(Message::assistant_with_tool_calls(completion.text.clone(), tool_refs));
            session.transition(SessionState::ToolRunning);

            let mut cancelled_mid_tools = false;
            for call in &completion.tool_calls {
                if cancel.is_cancelled() {
                    turn.aborted = true;
                    session.push(Message::assistant("[cancelled]"));
                    cancelled_mid_tools = true;
                    break;
                }

                self.bus.publish(
                    Topic::AgentToolCall,
                    Event {
                        session_key: session.key.clone(),
                        payload: serde_json::json!({ "callId": call.call_id, "name": call.name }),
                    },
                );

                let tool_call = ToolCall { id: call.call_id.clone(), name: call.name.clone(), args: call.arguments.clone() };
                let result = self.dispatch_tool(tool_call, cancel.clone()).await;

                self.bus.publish(
                    Topic::AgentToolResult,
                    Event {
                        session_key: session.key.clone(),
                        payload: serde_json::json!({ "callId": call.call_id, "result": result }),
                    },
                );

                let content = result.data.as_ref().and_then(|v| v.as_str()).map(|s| s.to_string()).unwrap_or_else(|| {
                    result.error.as_ref().map(|e| e.message.clone()).unwrap_or_default()
                });
                session.push(Message::tool_result(call.call_id.clone(), content, !result.success));
            }
            if cancelled_mid_tools {
                break Err(AgentError::Cancelled);
            }
            // Observe: loop back to Plan.
        };

        match &result {
            Ok(_) => session.end_turn(),
            Err(_) => session.fail_turn(),
        }
        self.bus.publish(
            Topic::AgentDone,
            Event {
                session_key: turn.session_key.clone(),
                payload: serde_json::json!({ "usage": { "in": turn.tokens_in, "out": turn.tokens_out } }),
            },
        );

        result.map(|_| turn.clone()).or_else(|e| {
            self.bus.publish(
                Topic::AgentError,
                Event { session_key: turn.session_key.clone(), payload: serde_json::json!({ "message": e.to_string() }) },
            );
            Err(e)
        })
    }

    async fn dispatch_tool(&self, call: ToolCall, cancel: CancellationToken) -> ToolResult {
        let started = Instant::now();
        let category = self
            .tools
            .get(&call.name)
            .map(|d| d.execute.output_category())
            .unwrap_or(OutputCategory::Generic);

        let tools = self.tools.clone();
        let call_for_task = call.clone();
        let timeout = self.tool_timeout;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(timeout, async move { tools.execute(&call_for_task).await }) => result.ok(),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Some(output) => ToolResult::from_output(output, duration_ms, category, 4000),
            None => ToolResult::from_output(
                gateway_tools::ToolOutput::err(&call.id, "TOOL_TIMEOUT_OR_CANCELLED", "tool call timed out or was cancelled"),
                duration_ms,
                category,
                4000,
            ),
        }
    }

    /// Compresses `session`'s history in place: builds the structured
    /// summary prompt via [`memory::build_summary_request`], runs it
    /// through the cheapest configured provider, and folds the result
    /// back in via [`memory::apply_summary`]. Falls back to the
    /// deterministic, no-model-call [`memory::emergency_compact`] when no
    /// provider is available or the summarization call itself fails —
    /// compaction must always succeed, even offline.
    async fn compress(&self, session: &mut crate::session::Session) {
        if memory::already_compacted(&session.messages) {
            return;
        }
        let (recent, summary_prompt) = memory::build_summary_request(&session.messages, self.recent_window, self.summary_token_budget);

        let outcome = match self.run_summary_prompt(&summary_prompt).await {
            Some(summary_text) => memory::apply_summary(recent, &summary_text),
            None => memory::emergency_compact(&session.messages, self.recent_window),
        };

        session.replace_messages(outcome.messages);
        self.bus.publish(
            Topic::AgentError,
            Event {
                session_key: session.key.clone(),
                payload: serde_json::json!({ "compacted": true, "tokensBefore": outcome.tokens_before, "tokensAfter": outcome.tokens_after }),
            },
        );
    }

    /// Runs the summarization prompt through the cheapest available
    /// provider, returning `None` (rather than propagating the error) so
    /// the caller can fall back to emergency compaction.
    async fn run_summary_prompt(&self, prompt: &Message) -> Option<String> {
        let provider = self.router.select(self.subagent_model.as_deref())?;
        let request = CompletionRequest {
            messages: vec![
                ModelMessage::system("You produce terse, structured conversation summaries for context compaction. Reply with only the requested sections."),
                ModelMessage::user(prompt.content.clone()),
            ],
            tools: Vec::new(),
            max_tokens: (self.summary_token_budget as u32).max(256),
            temperature: 0.0,
        };
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(8);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        match provider.complete(request, tx, CancellationToken::new()).await {
            Ok(result) => Some(result.text),
            Err(err) => {
                tracing::warn!(provider = provider.id(), error = %err, "compaction summary call failed, falling back to emergency compaction");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_model::{CompletionResult, ModelProvider, ProviderError, Usage};
    use gateway_tools::Tool;
    use serde_json::json;

    struct StubProvider;

    #[async_trait]
    impl ModelProvider for StubProvider {
        fn id(&self) -> &str {
            "stub"
        }
        fn model_name(&self) -> &str {
            "stub-model"
        }
        async fn complete(
            &self,
            _request: CompletionRequest,
            sink: mpsc::Sender<StreamEvent>,
            _cancel: CancellationToken,
        ) -> Result<CompletionResult, ProviderError> {
            let _ = sink.send(StreamEvent::TextDelta("hello".into())).await;
            Ok(CompletionResult { text: "hello".into(), tool_calls: vec![], usage: Usage::default() })
        }
    }

    struct NoopTool;

    #[async_trait]
    impl Tool for NoopTool {
        fn name(&self) -> &str {
            "noop"
        }
        fn description(&self) -> &str {
            "does nothing"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall) -> gateway_tools::ToolOutput {
            gateway_tools::ToolOutput::ok(&call.id, "ok")
        }
    }

    fn make_loop(workspace: PathBuf) -> AgentLoop {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(SessionStore::new(chrono::Duration::hours(24)));
        let router = Arc::new(ModelRouter::new(vec![Arc::new(StubProvider)]));
        let mut registry = ToolRegistry::new();
        registry.register(NoopTool);
        AgentLoop::new(store, bus, router, Arc::new(registry), workspace)
    }

    #[tokio::test]
    async fn run_turn_with_no_tool_calls_responds_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let agent = make_loop(dir.path().to_path_buf());
        let mut session = crate::session::Session::new_for_test("k", "local");
        let turn = agent.run_turn(&mut session, "hello", CancellationToken::new()).await.unwrap();
        assert_eq!(turn.iteration, 1);
        let assistant_messages = session.messages.iter().filter(|m| m.role == Role::Assistant).count();
        assert_eq!(assistant_messages, 1);
    }

    #[tokio::test]
    async fn cancelled_turn_appends_cancelled_marker() {
        let dir = tempfile::tempdir().unwrap();
        let agent = make_loop(dir.path().to_path_buf());
        let mut session = crate::session::Session::new_for_test("k", "local");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = agent.run_turn(&mut session, "hello", cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(session.messages.iter().any(|m| m.content == "[cancelled]"));
    }

    #[tokio::test]
    async fn compress_summarizes_via_provider_and_preserves_the_recent_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = make_loop(dir.path().to_path_buf());
        agent.recent_window = 2;

        let mut session = crate::session::Session::new_for_test("k", "local");
        for i in 0..6 {
            session.push(Message::user(format!("message {i}")));
        }

        agent.compress(&mut session).await;

        assert!(memory::already_compacted(&session.messages));
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.messages[0].content, "[compacted]\nhello");
        assert_eq!(session.messages[1].content, "message 4");
        assert_eq!(session.messages[2].content, "message 5");
    }

    #[tokio::test]
    async fn run_turn_transitions_through_thinking_and_responding() {
        let dir = tempfile::tempdir().unwrap();
        let agent = make_loop(dir.path().to_path_buf());
        let mut session = crate::session::Session::new_for_test("k", "local");
        assert_eq!(session.state, crate::session::SessionState::Idle);

        agent.run_turn(&mut session, "hello", CancellationToken::new()).await.unwrap();

        // StubProvider never calls tools, so a successful turn ends on
        // Responding and then Idle once the turn is finalized.
        assert_eq!(session.state, crate::session::SessionState::Idle);
        assert!(session.active_run_id.is_none());
    }
}
