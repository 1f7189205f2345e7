// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end exercise of a full turn: a loopback channel message flows
/// through session creation, the agent loop, a stub provider, and back out
/// through the channel — the same path `gateway-bin`'s orchestrator wires
/// up for real transports.
use std::sync::Arc;

use async_trait::async_trait;
use gateway_channels::{ChannelRegistry, LoopbackChannel, NormalizedMessage};
use gateway_core::{key, AgentLoop, EventBus, SessionStore};
use gateway_model::{
    CompletionRequest, CompletionResult, ModelProvider, ModelRouter, ProviderError, StreamEvent, Usage,
};
use gateway_tools::ToolRegistry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    fn id(&self) -> &str {
        "echo"
    }
    fn model_name(&self) -> &str {
        "echo-model"
    }
    async fn complete(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<StreamEvent>,
        _cancel: CancellationToken,
    ) -> Result<CompletionResult, ProviderError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == gateway_model::Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let reply = format!("echo: {last_user}");
        let _ = sink.send(StreamEvent::TextDelta(reply.clone())).await;
        Ok(CompletionResult { text: reply, tool_calls: vec![], usage: Usage::default() })
    }
}

#[tokio::test]
async fn a_loopback_message_round_trips_through_the_agent_loop() {
    let bus = Arc::new(EventBus::new());
    let session_store = Arc::new(SessionStore::new(chrono::Duration::hours(24)));
    let router = Arc::new(ModelRouter::new(vec![Arc::new(EchoProvider)]));
    let tools = Arc::new(ToolRegistry::new());
    let workspace = tempfile::tempdir().unwrap();
    let agent = Arc::new(AgentLoop::new(session_store.clone(), bus.clone(), router, tools, workspace.path().to_path_buf()));

    let loopback = Arc::new(LoopbackChannel::new("local"));
    let mut registry = ChannelRegistry::new();
    registry.register(loopback.clone());
    let registry = Arc::new(registry);

    let (done_tx, mut done_rx) = mpsc::channel::<String>(1);
    let session_store_cb = session_store.clone();
    let bus_cb = bus.clone();
    let agent_cb = agent.clone();
    let registry_cb = registry.clone();
    let on_inbound: gateway_channels::InboundCallback = Arc::new(move |message: NormalizedMessage| {
        let session_store = session_store_cb.clone();
        let bus = bus_cb.clone();
        let agent = agent_cb.clone();
        let registry = registry_cb.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let session_key = key::direct_message(&message.channel, &message.sender_id);
            let session = session_store.get_or_create(&session_key, &message.channel, &bus).await;
            let mut session = session.lock().await;
            let turn = agent.run_turn(&mut session, &message.text, CancellationToken::new()).await.unwrap();
            assert_eq!(turn.session_key, session_key);
            let reply = session.messages.last().unwrap().content.clone();
            drop(session);
            registry.send(&message.channel, &session_key, &reply).await.unwrap();
            let _ = done_tx.send(reply).await;
        });
    });

    registry.start_all(on_inbound.clone()).await.unwrap();
    loopback.deliver(
        &on_inbound,
        NormalizedMessage {
            channel: "local".to_string(),
            sender_id: "u1".to_string(),
            sender_name: "operator".to_string(),
            text: "hello".to_string(),
            is_group: false,
            group_id: None,
            media: None,
        },
    );

    let reply = done_rx.recv().await.unwrap();
    assert_eq!(reply, "echo: hello");
    assert_eq!(loopback.sent().last().unwrap().1, "echo: hello");
}

#[tokio::test]
async fn resetting_a_session_clears_its_transcript() {
    let bus = Arc::new(EventBus::new());
    let session_store = Arc::new(SessionStore::new(chrono::Duration::hours(24)));
    let session_key = key::direct_message("local", "u1");
    let session = session_store.get_or_create(&session_key, "local", &bus).await;
    session.lock().await.push(gateway_core::Message::user("hi"));

    session_store.reset(&session_key, &bus).await;

    let session = session_store.get_or_create(&session_key, "local", &bus).await;
    assert!(session.lock().await.messages.is_empty());
}
