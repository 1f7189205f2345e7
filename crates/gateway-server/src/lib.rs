// SPDX-License-Identifier: MIT
//! HTTP + WebSocket surface (C8). Assembles the axum router the way the
//! teacher's `gateway.rs`/`http` module does: bearer-auth middleware,
//! security headers, CSRF guard, then the health/session/admin routes and
//! the `/ws` bridge.

mod auth;
mod envelope;
mod routes;
mod security;
mod token;
mod ws;

pub use auth::{validate_none_mode_bind_addr, AuthMode, AuthState};
pub use token::StoredSecret;

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use gateway_core::{AgentLoop, EventBus, SessionStore};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub session_store: Arc<SessionStore>,
    pub bus: Arc<EventBus>,
    pub agent: Arc<AgentLoop>,
    pub auth: AuthState,
    pub started_at: Instant,
    pub ws_clients: Arc<AtomicU64>,
    pub shutdown: CancellationToken,
    pub reload_config: Arc<Notify>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/sessions", get(routes::list_sessions))
        .route("/api/admin/reset-session", post(routes::reset_session))
        .route("/api/admin/reload-config", post(routes::reload_config))
        .route("/api/admin/shutdown", post(routes::shutdown))
        .route("/ws", get(ws::ws_handler));

    api.layer(middleware::from_fn(security::csrf_guard))
        .layer(middleware::from_fn(security::security_headers))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_mw))
        .with_state(state)
}

/// Binds and serves the router until `shutdown` is cancelled. Mirrors the
/// teacher's `crate::http::serve` entry point, minus the TLS listener —
/// this gateway terminates TLS at a reverse proxy per the Non-goal on
/// in-process certificate management.
pub async fn serve(host: &str, port: u16, state: AppState) -> anyhow::Result<()> {
    auth::validate_none_mode_bind_addr(state.auth.mode(), host)?;

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let shutdown = state.shutdown.clone();
    let app = router(state);

    info!(%addr, "starting gateway HTTP/WS server");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
