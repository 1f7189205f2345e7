// SPDX-License-Identifier: MIT
//! WebSocket bridge at `/ws` — translates browser WebSocket connections
//! into turns on the agent loop. Generalizes the teacher's `ws_handler`/
//! `handle_socket` bridge (one `agent.subscribe()` broadcast receiver
//! relayed into JSON text frames) to this gateway's multi-session bus:
//! each connection filters the shared topics down to its own session key
//! rather than relying on a single bound agent handle.
//!
//! Turn execution is spawned onto its own task rather than awaited inline
//! in the connection's read/relay loop: the loop must keep polling the
//! event-bus branches *while* a turn is in flight so `agent.stream`
//! deltas reach the browser as they're produced, not in a burst once the
//! turn returns.
//!
//! Authentication happens before the WebSocket upgrade, via [`crate::auth`]
//! middleware on the `/ws` route — by the time [`handle_socket`] runs the
//! connection is already authenticated.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use gateway_core::{Event, Message as SessionMessage, Role as SessionRole, Topic};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::{ChannelMessagePayload, InboundFrame, OutboundFrame, UsagePayload};
use crate::AppState;

type Sink = futures::stream::SplitSink<WebSocket, Message>;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    let handler_id = format!("ws-{connection_id}");
    state.ws_clients.fetch_add(1, Ordering::Relaxed);

    let (sink, mut receiver) = socket.split();
    let sink = Arc::new(Mutex::new(sink));

    let mut stream_rx = state.bus.subscribe(Topic::AgentStream, &handler_id);
    let mut tool_call_rx = state.bus.subscribe(Topic::AgentToolCall, &handler_id);
    let mut tool_result_rx = state.bus.subscribe(Topic::AgentToolResult, &handler_id);
    let mut error_rx = state.bus.subscribe(Topic::AgentError, &handler_id);

    let cancel = CancellationToken::new();
    let active_session_key = Arc::new(Mutex::new(None::<String>));

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundFrame>(&text) {
                            Ok(InboundFrame::ChannelMessage(payload)) => {
                                let key = session_key_for(&payload);
                                *active_session_key.lock().await = Some(key.clone());
                                spawn_turn(state.clone(), key, payload, cancel.clone(), sink.clone());
                            }
                            Ok(InboundFrame::AdminReset) => {
                                if let Some(key) = active_session_key.lock().await.clone() {
                                    state.session_store.reset(&key, &state.bus).await;
                                }
                            }
                            Ok(InboundFrame::AdminShutdown) => {
                                state.shutdown.cancel();
                            }
                            Err(e) => {
                                send_frame(&sink, &OutboundFrame::GatewayError { code: 400, message: format!("invalid frame: {e}") }).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket recv error: {e}");
                        break;
                    }
                }
            }

            event = stream_rx.recv() => {
                let key = active_session_key.lock().await.clone();
                if let Some(frame) = relay_stream(event, key.as_deref()) {
                    send_frame(&sink, &frame).await;
                }
            }
            event = tool_call_rx.recv() => {
                let key = active_session_key.lock().await.clone();
                if let Some(frame) = relay_tool_call(event, key.as_deref()) {
                    send_frame(&sink, &frame).await;
                }
            }
            event = tool_result_rx.recv() => {
                let key = active_session_key.lock().await.clone();
                if let Some(frame) = relay_tool_result(event, key.as_deref()) {
                    send_frame(&sink, &frame).await;
                }
            }
            event = error_rx.recv() => {
                let key = active_session_key.lock().await.clone();
                if let Some(frame) = relay_error(event, key.as_deref()) {
                    send_frame(&sink, &frame).await;
                }
            }
        }
    }

    state.bus.unsubscribe(Topic::AgentStream, &handler_id);
    state.bus.unsubscribe(Topic::AgentToolCall, &handler_id);
    state.bus.unsubscribe(Topic::AgentToolResult, &handler_id);
    state.bus.unsubscribe(Topic::AgentError, &handler_id);
    state.ws_clients.fetch_sub(1, Ordering::Relaxed);
    debug!("WebSocket connection closed");
}

fn spawn_turn(state: AppState, key: String, payload: ChannelMessagePayload, cancel: CancellationToken, sink: Arc<Mutex<Sink>>) {
    tokio::spawn(async move {
        let session = state.session_store.get_or_create(&key, &payload.channel, &state.bus).await;
        let mut session = session.lock().await;
        let result = state.agent.run_turn(&mut session, &payload.text, cancel).await;

        match result {
            Ok(turn) => {
                let text = session
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == SessionRole::Assistant)
                    .map(|m: &SessionMessage| m.content.clone())
                    .unwrap_or_default();
                drop(session);

                send_frame(&sink, &OutboundFrame::AgentResponse { text }).await;
                send_frame(
                    &sink,
                    &OutboundFrame::AgentDone {
                        usage: UsagePayload { input: turn.tokens_in, out: turn.tokens_out, total_estimate: turn.tokens_in + turn.tokens_out },
                    },
                )
                .await;
            }
            Err(e) => {
                drop(session);
                send_frame(&sink, &OutboundFrame::GatewayError { code: 500, message: e.to_string() }).await;
            }
        }
    });
}

fn session_key_for(payload: &ChannelMessagePayload) -> String {
    if payload.is_group {
        if let Some(group_id) = &payload.group_id {
            return gateway_core::key::group(&payload.channel, group_id);
        }
    }
    gateway_core::key::direct_message(&payload.channel, &payload.sender_id)
}

fn matches_session(event: &Event, session_key: Option<&str>) -> bool {
    session_key.map(|key| key == event.session_key).unwrap_or(false)
}

fn relay_stream(event: Option<Arc<Event>>, session_key: Option<&str>) -> Option<OutboundFrame> {
    let event = event?;
    if !matches_session(&event, session_key) {
        return None;
    }
    let text = event.payload.get("text")?.as_str()?.to_string();
    Some(OutboundFrame::AgentStream { text })
}

fn relay_tool_call(event: Option<Arc<Event>>, session_key: Option<&str>) -> Option<OutboundFrame> {
    let event = event?;
    if !matches_session(&event, session_key) {
        return None;
    }
    let call_id = event.payload.get("callId")?.as_str()?.to_string();
    let name = event.payload.get("name")?.as_str()?.to_string();
    Some(OutboundFrame::ToolCall { call_id, name, args: serde_json::Value::Null })
}

fn relay_tool_result(event: Option<Arc<Event>>, session_key: Option<&str>) -> Option<OutboundFrame> {
    let event = event?;
    if !matches_session(&event, session_key) {
        return None;
    }
    let call_id = event.payload.get("callId")?.as_str()?.to_string();
    let result = event.payload.get("result")?;
    let is_error = result.get("success").and_then(|v| v.as_bool()).map(|ok| !ok).unwrap_or(false);
    let duration_ms = result.get("meta").and_then(|m| m.get("duration_ms")).and_then(|v| v.as_u64()).unwrap_or(0);
    Some(OutboundFrame::ToolResult { call_id, result_json: result.clone(), is_error, duration_ms })
}

fn relay_error(event: Option<Arc<Event>>, session_key: Option<&str>) -> Option<OutboundFrame> {
    let event = event?;
    if !matches_session(&event, session_key) {
        return None;
    }
    if event.payload.get("compacted").is_some() {
        return None;
    }
    let message = event.payload.get("message")?.as_str()?.to_string();
    Some(OutboundFrame::GatewayError { code: 500, message })
}

async fn send_frame(sink: &Arc<Mutex<Sink>>, frame: &OutboundFrame) {
    if let Ok(json) = serde_json::to_string(frame) {
        let _ = sink.lock().await.send(Message::Text(json)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_for_direct_message_uses_dm_derivation() {
        let payload = ChannelMessagePayload {
            channel: "local".into(),
            sender_id: "u1".into(),
            sender_name: None,
            text: "hi".into(),
            is_group: false,
            group_id: None,
        };
        assert_eq!(session_key_for(&payload), "local:dm:u1");
    }

    #[test]
    fn session_key_for_group_message_uses_group_derivation() {
        let payload = ChannelMessagePayload {
            channel: "local".into(),
            sender_id: "u1".into(),
            sender_name: None,
            text: "hi".into(),
            is_group: true,
            group_id: Some("g1".into()),
        };
        assert_eq!(session_key_for(&payload), "local:group:g1");
    }
}
