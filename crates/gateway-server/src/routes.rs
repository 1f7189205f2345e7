// SPDX-License-Identifier: MIT
//! `/api/*` HTTP surface: health, session enumeration, and admin actions.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
struct Stats {
    sessions: usize,
    #[serde(rename = "wsClients")]
    ws_clients: u64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    #[serde(rename = "uptimeSeconds")]
    uptime_seconds: u64,
    stats: Stats,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.session_store.list().await.len();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        stats: Stats { sessions, ws_clients: state.ws_clients.load(std::sync::atomic::Ordering::Relaxed) },
    })
}

#[derive(Serialize)]
struct SessionSummary {
    id: String,
    channel: String,
    state: &'static str,
    #[serde(rename = "messageCount")]
    message_count: usize,
}

pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.session_store.list().await;
    let summaries: Vec<SessionSummary> = sessions
        .into_iter()
        .map(|(key, channel, session_state, message_count)| SessionSummary {
            id: key,
            channel,
            state: match session_state {
                gateway_core::SessionState::Idle => "idle",
                gateway_core::SessionState::Thinking => "thinking",
                gateway_core::SessionState::ToolRunning => "tool_running",
                gateway_core::SessionState::Compressing => "compressing",
                gateway_core::SessionState::Responding => "responding",
                gateway_core::SessionState::Error => "error",
            },
            message_count,
        })
        .collect();
    Json(summaries)
}

#[derive(serde::Deserialize)]
pub struct ResetSessionRequest {
    #[serde(rename = "sessionKey")]
    pub session_key: String,
}

pub async fn reset_session(State(state): State<AppState>, Json(req): Json<ResetSessionRequest>) -> impl IntoResponse {
    state.session_store.reset(&req.session_key, &state.bus).await;
    StatusCode::NO_CONTENT
}

pub async fn reload_config(State(state): State<AppState>) -> impl IntoResponse {
    state.reload_config.notify_one();
    StatusCode::ACCEPTED
}

pub async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    state.shutdown.cancel();
    StatusCode::ACCEPTED
}
