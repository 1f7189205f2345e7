// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible and Anthropic-messages wire-shape providers. Both
//! speak SSE streaming over `reqwest`; the only real difference is the
//! request envelope and the auth header, selected from [`ApiShape`].

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio::time::timeout;
use std::time::Duration;

use crate::error::{ErrorClass, ProviderError};
use crate::provider::{ApiShape, CredentialRef, ModelProvider};
use crate::types::{CompletionRequest, CompletionResult, Message, Role, StreamEvent, ToolCallRequest, Usage};

const CHUNK_DEADLINE: Duration = Duration::from_secs(30);
const CALL_DEADLINE: Duration = Duration::from_secs(180);

pub struct HttpModelProvider {
    id: String,
    model: String,
    chat_url: String,
    credential: CredentialRef,
    api_shape: ApiShape,
    client: reqwest::Client,
}

impl HttpModelProvider {
    pub fn new(id: impl Into<String>, model: impl Into<String>, base_url: &str, credential: CredentialRef, api_shape: ApiShape) -> Self {
        let base = base_url.trim_end_matches('/');
        let chat_url = match api_shape {
            ApiShape::AnthropicMessages => format!("{base}/messages"),
            _ => format!("{base}/chat/completions"),
        };
        Self {
            id: id.into(),
            model: model.into(),
            chat_url,
            credential,
            api_shape,
            client: reqwest::Client::new(),
        }
    }

    fn apply_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let key = match &self.credential {
            CredentialRef::Literal(k) => k.clone(),
            CredentialRef::None => return req,
        };
        req = match self.api_shape {
            ApiShape::OpenAiChat => req.bearer_auth(&key),
            ApiShape::AnthropicMessages => req.header("x-api-key", &key).header("anthropic-version", "2023-06-01"),
            ApiShape::CustomNoAuth => req,
        };
        req
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        match self.api_shape {
            ApiShape::AnthropicMessages => {
                let system = request
                    .messages
                    .iter()
                    .find(|m| m.role == Role::System)
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                let messages: Vec<Value> = request
                    .messages
                    .iter()
                    .filter(|m| m.role != Role::System)
                    .map(anthropic_message)
                    .collect();
                json!({
                    "model": self.model,
                    "system": system,
                    "messages": messages,
                    "max_tokens": request.max_tokens,
                    "temperature": request.temperature,
                    "stream": true,
                    "tools": request.tools.iter().map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })).collect::<Vec<_>>(),
                })
            }
            ApiShape::OpenAiChat | ApiShape::CustomNoAuth => {
                let messages: Vec<Value> = request.messages.iter().map(openai_message).collect();
                let mut body = json!({
                    "model": self.model,
                    "messages": messages,
                    "max_tokens": request.max_tokens,
                    "temperature": request.temperature,
                    "stream": true,
                    "stream_options": { "include_usage": true },
                });
                if !request.tools.is_empty() {
                    body["tools"] = json!(request
                        .tools
                        .iter()
                        .map(|t| json!({
                            "type": "function",
                            "function": { "name": t.name, "description": t.description, "parameters": t.parameters },
                        }))
                        .collect::<Vec<_>>());
                }
                body
            }
        }
    }
}

fn openai_message(m: &Message) -> Value {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    if m.role == Role::Tool {
        return json!({ "role": role, "tool_call_id": m.tool_call_id, "content": m.content });
    }
    json!({ "role": role, "content": m.content })
}

fn anthropic_message(m: &Message) -> Value {
    let role = if m.role == Role::Assistant { "assistant" } else { "user" };
    json!({ "role": role, "content": m.content })
}

#[async_trait]
impl ModelProvider for HttpModelProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<CompletionResult, ProviderError> {
        let body = self.build_body(&request);
        let mut req = self.client.post(&self.chat_url).json(&body);
        req = self.apply_auth(req);

        let send_fut = req.send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::new(ErrorClass::Cancelled, "cancelled before response")),
            result = timeout(CALL_DEADLINE, send_fut) => result
                .map_err(|_| ProviderError::new(ErrorClass::Timeout, "call deadline exceeded"))?
                .map_err(|e| ProviderError::new(ErrorClass::ProviderDown, e.to_string()))?,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| Duration::from_secs(secs.min(10)));
            let text = response.text().await.unwrap_or_default();
            let mut err = ProviderError::from_http_status(status, text);
            if let Some(retry_after) = retry_after {
                err = err.with_retry_after(retry_after);
            }
            return Err(err);
        }

        let mut stream = response.bytes_stream();
        let mut text = String::new();
        let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
        let mut usage = Usage::default();
        let mut buf = String::new();

        loop {
            use futures::StreamExt;
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::new(ErrorClass::Cancelled, "cancelled mid-stream")),
                chunk = timeout(CHUNK_DEADLINE, stream.next()) => chunk
                    .map_err(|_| ProviderError::new(ErrorClass::Timeout, "chunk deadline exceeded"))?,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| ProviderError::new(ErrorClass::ProviderDown, e.to_string()))?;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(idx) = buf.find('\n') {
                let line = buf[..idx].trim_end_matches('\r').to_string();
                buf.drain(..=idx);
                let Some(payload) = line.strip_prefix("data: ") else { continue };
                if payload == "[DONE]" {
                    continue;
                }
                let Ok(event): Result<Value, _> = serde_json::from_str(payload) else { continue };
                apply_delta(&event, self.api_shape, &mut text, &mut tool_calls, &mut usage, &sink).await;
            }
        }

        let _ = sink.send(StreamEvent::Done(usage.clone())).await;
        Ok(CompletionResult { text, tool_calls, usage })
    }
}

async fn apply_delta(
    event: &Value,
    shape: ApiShape,
    text: &mut String,
    tool_calls: &mut Vec<ToolCallRequest>,
    usage: &mut Usage,
    sink: &mpsc::Sender<StreamEvent>,
) {
    match shape {
        ApiShape::AnthropicMessages => {
            if let Some(delta_text) = event["delta"]["text"].as_str() {
                text.push_str(delta_text);
                let _ = sink.send(StreamEvent::TextDelta(delta_text.to_string())).await;
            }
            if let Some(input_tokens) = event["usage"]["input_tokens"].as_u64() {
                usage.tokens_in = input_tokens as usize;
            }
            if let Some(output_tokens) = event["usage"]["output_tokens"].as_u64() {
                usage.tokens_out = output_tokens as usize;
            }
        }
        ApiShape::OpenAiChat | ApiShape::CustomNoAuth => {
            if let Some(delta_text) = event["choices"][0]["delta"]["content"].as_str() {
                text.push_str(delta_text);
                let _ = sink.send(StreamEvent::TextDelta(delta_text.to_string())).await;
            }
            if let Some(calls) = event["choices"][0]["delta"]["tool_calls"].as_array() {
                for call in calls {
                    let index = call["index"].as_u64().unwrap_or(0) as usize;
                    let call_id = call["id"].as_str().map(|s| s.to_string());
                    let name_delta = call["function"]["name"].as_str().map(|s| s.to_string());
                    let arguments_delta = call["function"]["arguments"].as_str().map(|s| s.to_string());
                    let _ = sink
                        .send(StreamEvent::ToolCallDelta {
                            index,
                            call_id: call_id.clone(),
                            name_delta: name_delta.clone(),
                            arguments_delta: arguments_delta.clone(),
                        })
                        .await;
                    while tool_calls.len() <= index {
                        tool_calls.push(ToolCallRequest {
                            call_id: String::new(),
                            name: String::new(),
                            arguments: Value::String(String::new()),
                        });
                    }
                    let slot = &mut tool_calls[index];
                    if let Some(id) = call_id {
                        slot.call_id = id;
                    }
                    if let Some(n) = name_delta {
                        slot.name.push_str(&n);
                    }
                    if let Some(a) = arguments_delta {
                        if let Value::String(existing) = &mut slot.arguments {
                            existing.push_str(&a);
                        }
                    }
                }
            }
            if let Some(prompt_tokens) = event["usage"]["prompt_tokens"].as_u64() {
                usage.tokens_in = prompt_tokens as usize;
            }
            if let Some(completion_tokens) = event["usage"]["completion_tokens"].as_u64() {
                usage.tokens_out = completion_tokens as usize;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolSchema;

    #[test]
    fn openai_body_omits_tools_when_none_requested() {
        let provider = HttpModelProvider::new("openai", "gpt-4o", "https://api.openai.com/v1", CredentialRef::Literal("k".into()), ApiShape::OpenAiChat);
        let request = CompletionRequest {
            messages: vec![Message::user("hi")],
            tools: vec![],
            max_tokens: 100,
            temperature: 0.2,
        };
        let body = provider.build_body(&request);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn openai_body_includes_tool_schemas() {
        let provider = HttpModelProvider::new("openai", "gpt-4o", "https://api.openai.com/v1", CredentialRef::Literal("k".into()), ApiShape::OpenAiChat);
        let request = CompletionRequest {
            messages: vec![Message::user("hi")],
            tools: vec![ToolSchema { name: "echo".into(), description: "d".into(), parameters: json!({}) }],
            max_tokens: 100,
            temperature: 0.2,
        };
        let body = provider.build_body(&request);
        assert_eq!(body["tools"][0]["function"]["name"], "echo");
    }

    #[test]
    fn anthropic_body_splits_system_message_out() {
        let provider = HttpModelProvider::new("anthropic", "claude-3-5-sonnet", "https://api.anthropic.com/v1", CredentialRef::Literal("k".into()), ApiShape::AnthropicMessages);
        let request = CompletionRequest {
            messages: vec![Message::system("be terse"), Message::user("hi")],
            tools: vec![],
            max_tokens: 100,
            temperature: 0.2,
        };
        let body = provider.build_body(&request);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn custom_no_auth_sends_no_authorization_header() {
        let provider = HttpModelProvider::new("local", "llama3", "http://localhost:8080/v1", CredentialRef::None, ApiShape::CustomNoAuth);
        let req = provider.apply_auth(provider.client.get("http://localhost:8080/v1/models"));
        let built = req.build().unwrap();
        assert!(built.headers().get("authorization").is_none());
    }
}
