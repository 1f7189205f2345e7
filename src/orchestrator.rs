// SPDX-License-Identifier: MIT
//! Boot sequence, config hot-reload, graceful shutdown, and cron (C9).
//! Generalizes the teacher's `gateway.rs` boot-then-serve shape (load
//! config, build the agent, open the listener) into the ordered,
//! idempotent sequence named by the component design: config → session
//! store/bus → tool registry → providers → channels → HTTP/WS listener →
//! cron/watcher.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use cron::Schedule;
use gateway_channels::{ChannelRegistry, InboundCallback, LoopbackChannel, NormalizedMessage};
use gateway_config::{Config, ProviderConfig};
use gateway_core::{key, AgentLoop, EventBus, SessionStore};
use gateway_model::{ApiShape, CredentialRef, HttpModelProvider, ModelProvider, ModelRouter};
use gateway_server::{AppState, AuthMode, AuthState};
use gateway_tools::ToolRegistry;
use notify::Watcher;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static BOOTED: AtomicBool = AtomicBool::new(false);

/// Outcome of comparing a previous [`Config`] against a freshly loaded
/// one, per subsystem. Mirrors the orchestrator's hot-reload contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    RequiresRestart(String),
}

/// Everything the running gateway needs to shut down or re-schedule
/// itself. Held by `main` for the lifetime of the process.
pub struct Running {
    pub bus: Arc<EventBus>,
    pub session_store: Arc<SessionStore>,
    pub channels: Arc<ChannelRegistry>,
    pub shutdown: CancellationToken,
    pub reload_config: Arc<Notify>,
    schedule_tasks: Vec<tokio::task::JoinHandle<()>>,
    config_watcher: Option<(notify::RecommendedWatcher, tokio::task::JoinHandle<()>)>,
}

impl Running {
    /// Reverse-order shutdown: stop accepting new scheduled/channel work
    /// first, drain in-flight turns up to `deadline`, then tear down the
    /// bus. The HTTP/WS listener's own graceful shutdown is driven by
    /// `self.shutdown` directly (see [`gateway_server::serve`]).
    pub async fn shutdown_gracefully(self, deadline: std::time::Duration) {
        for task in &self.schedule_tasks {
            task.abort();
        }
        if let Some((_watcher, task)) = &self.config_watcher {
            task.abort();
        }
        if let Err(_) = tokio::time::timeout(deadline, self.channels.stop_all()).await {
            warn!("channel shutdown exceeded the drain deadline, forcing stop");
        }
        self.bus.shutdown();
        info!("gateway shut down");
    }
}

fn parse_api_shape(raw: &str) -> ApiShape {
    match raw {
        "anthropic-messages" => ApiShape::AnthropicMessages,
        "custom-noauth" => ApiShape::CustomNoAuth,
        _ => ApiShape::OpenAiChat,
    }
}

/// Builds the prioritized provider list from config. Opens no network —
/// `HttpModelProvider` only holds a lazily-used `reqwest::Client`. One
/// `ProviderConfig` with N configured models fans out into N providers
/// sharing that provider's base URL/credential/wire shape, each
/// addressable as `"<provider-id>/<model>"`.
pub fn build_providers(config: &Config) -> Vec<Arc<dyn ModelProvider>> {
    let mut entries: Vec<(u32, String, ProviderConfig)> = config
        .agent
        .providers
        .iter()
        .map(|(id, cfg)| (cfg.priority, id.clone(), cfg.clone()))
        .collect();
    entries.sort_by_key(|(priority, id, _)| (*priority, id.clone()));

    let mut providers: Vec<Arc<dyn ModelProvider>> = Vec::new();
    for (_, id, cfg) in entries {
        let base_url = cfg.base_url.clone().unwrap_or_default();
        let credential = match cfg.api_key {
            Some(key) if !key.is_empty() => CredentialRef::Literal(key),
            _ => CredentialRef::None,
        };
        let api_shape = parse_api_shape(&cfg.api_shape);
        let models = if cfg.models.is_empty() {
            vec![id.clone()]
        } else {
            cfg.models.clone()
        };
        for model in models {
            let provider_id = format!("{id}/{model}");
            providers.push(Arc::new(HttpModelProvider::new(provider_id, model, &base_url, credential.clone(), api_shape)));
        }
    }
    providers
}

/// Conservative reconcile: anything that feeds a value baked into an
/// already-constructed `AgentLoop`/`ModelRouter` (both plain `Arc`s, not
/// hot-swappable by design — see DESIGN.md) requires a restart. Schedule
/// and channel-enablement changes are the orchestrator's own state and
/// can be applied without touching the agent loop.
pub fn reconcile(old: &Config, new: &Config) -> ReconcileOutcome {
    if old.gateway.host != new.gateway.host || old.gateway.port != new.gateway.port {
        return ReconcileOutcome::RequiresRestart("gateway.host/port changed".to_string());
    }
    if old.gateway.auth.mode != new.gateway.auth.mode
        || old.gateway.auth.token != new.gateway.auth.token
        || old.gateway.auth.password != new.gateway.auth.password
    {
        return ReconcileOutcome::RequiresRestart("gateway.auth credentials changed".to_string());
    }
    if old.agent.model != new.agent.model
        || old.agent.providers != new.agent.providers
        || old.agent.subagent_model != new.agent.subagent_model
    {
        return ReconcileOutcome::RequiresRestart("agent.model/providers/subagent_model changed".to_string());
    }
    if old.workspace.root != new.workspace.root {
        return ReconcileOutcome::RequiresRestart("workspace.root changed".to_string());
    }
    if old.memory != new.memory {
        return ReconcileOutcome::RequiresRestart("memory tuning changed".to_string());
    }
    ReconcileOutcome::Applied
}

fn build_inbound_callback(
    bus: Arc<EventBus>,
    session_store: Arc<SessionStore>,
    agent: Arc<AgentLoop>,
    channels: Arc<ChannelRegistry>,
    shutdown: CancellationToken,
) -> InboundCallback {
    Arc::new(move |message: NormalizedMessage| {
        let bus = bus.clone();
        let session_store = session_store.clone();
        let agent = agent.clone();
        let channels = channels.clone();
        let cancel = shutdown.clone();

        let session_key = if message.is_group {
            match &message.group_id {
                Some(group_id) => key::group(&message.channel, group_id),
                None => key::direct_message(&message.channel, &message.sender_id),
            }
        } else {
            key::direct_message(&message.channel, &message.sender_id)
        };

        bus.publish(
            gateway_core::Topic::Inbound,
            gateway_core::Event { session_key: session_key.clone(), payload: serde_json::json!({ "text": message.text }) },
        );

        let channel_id = message.channel.clone();
        tokio::spawn(async move {
            let session = session_store.get_or_create(&session_key, &channel_id, &bus).await;
            let mut session = session.lock().await;
            match agent.run_turn(&mut session, &message.text, cancel).await {
                Ok(_turn) => {
                    let reply = session
                        .messages
                        .iter()
                        .rev()
                        .find(|m| m.role == gateway_core::Role::Assistant)
                        .map(|m| m.content.clone())
                        .unwrap_or_default();
                    drop(session);
                    bus.publish_outbound(gateway_core::Event {
                        session_key: session_key.clone(),
                        payload: serde_json::json!({ "text": reply }),
                    })
                    .await;
                    if let Err(e) = channels.send(&channel_id, &session_key, &reply).await {
                        warn!(error = %e, channel = %channel_id, "failed to deliver reply to channel");
                    }
                }
                Err(e) => {
                    drop(session);
                    warn!(error = %e, session = %session_key, "turn failed");
                }
            }
        });
    })
}

/// One cron-triggered job loop: sleeps until each upcoming fire time,
/// drives a synthetic turn, and forwards the reply through the entry's
/// channel — the same outbound path a normal inbound message takes.
fn spawn_schedule_task(
    entry: gateway_config::ScheduleEntry,
    bus: Arc<EventBus>,
    session_store: Arc<SessionStore>,
    agent: Arc<AgentLoop>,
    channels: Arc<ChannelRegistry>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let schedule = Schedule::from_str(&entry.cron).with_context(|| format!("parsing cron expression for schedule entry {:?}", entry.name))?;

    Ok(tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(chrono::Utc).next() else {
                warn!(entry = %entry.name, "cron schedule has no further occurrences, stopping");
                return;
            };
            let now = chrono::Utc::now();
            let wait = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(wait).await;

            debug!(entry = %entry.name, "firing scheduled turn");
            let session = session_store.get_or_create(&entry.session_key, &entry.channel, &bus).await;
            let mut session = session.lock().await;
            match agent.run_turn(&mut session, &entry.prompt, CancellationToken::new()).await {
                Ok(_) => {
                    let reply = session
                        .messages
                        .iter()
                        .rev()
                        .find(|m| m.role == gateway_core::Role::Assistant)
                        .map(|m| m.content.clone())
                        .unwrap_or_default();
                    drop(session);
                    if let Err(e) = channels.send(&entry.channel, &entry.session_key, &reply).await {
                        warn!(error = %e, entry = %entry.name, "failed to deliver scheduled reply");
                    }
                }
                Err(e) => {
                    drop(session);
                    warn!(error = %e, entry = %entry.name, "scheduled turn failed");
                }
            }
        }
    }))
}

/// Watches every path `config_search_paths` would read and triggers a
/// reload+reconcile on change. Bridges `notify`'s synchronous callback
/// into async code via an `mpsc` channel — same shape as the file-index
/// watcher this is grounded on, minus the index-rebuild payload.
fn spawn_config_watcher(
    explicit: Option<std::path::PathBuf>,
    reload_config: Arc<Notify>,
    shutdown: CancellationToken,
) -> anyhow::Result<(notify::RecommendedWatcher, tokio::task::JoinHandle<()>)> {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<notify::Event>(64);

    let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
        Ok(event) => {
            let _ = event_tx.blocking_send(event);
        }
        Err(e) => warn!(error = %e, "config watcher error"),
    })
    .context("creating config file watcher")?;

    for path in gateway_config::config_search_paths(explicit.as_deref()) {
        if path.exists() {
            if let Err(e) = watcher.watch(&path, notify::RecursiveMode::NonRecursive) {
                warn!(path = %path.display(), error = %e, "failed to watch config file");
            }
        }
    }

    let mut previous = gateway_config::load(explicit.as_deref()).ok();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = event_rx.recv() => {
                    let Some(event) = event else { return };
                    if !matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                        continue;
                    }
                    match gateway_config::load(explicit.as_deref()) {
                        Ok(new_config) => {
                            if let Some(old_config) = &previous {
                                match reconcile(old_config, &new_config) {
                                    ReconcileOutcome::Applied => {
                                        info!("config reloaded: changes applied in place");
                                        reload_config.notify_waiters();
                                    }
                                    ReconcileOutcome::RequiresRestart(reason) => {
                                        warn!(%reason, "config changed but requires a restart to take effect");
                                    }
                                }
                            }
                            previous = Some(new_config);
                        }
                        Err(e) => warn!(error = %e, "config reload failed to parse, keeping previous config"),
                    }
                }
            }
        }
    });

    Ok((watcher, handle))
}

/// Runs the full ordered boot sequence and serves until `shutdown` fires.
/// Re-entrant calls within the same process are a warning + no-op — the
/// latch guards against a supervisor accidentally invoking this twice.
pub async fn run(config: Config, explicit_config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    if BOOTED.swap(true, Ordering::SeqCst) {
        warn!("orchestrator boot requested twice in the same process, ignoring");
        return Ok(());
    }

    gateway_config::validate(&config).context("validating configuration")?;

    // 2. Session store + event bus.
    let bus = Arc::new(EventBus::new());
    let session_store = Arc::new(SessionStore::new(chrono::Duration::hours(config.memory.idle_ttl_hours as i64)));

    // 3. Tool registry. Concrete tool implementations are out of this
    // core's scope (see DESIGN.md) — the registry contract is wired up
    // empty, ready for whatever host process registers tools into it.
    let tools = Arc::new(ToolRegistry::new());

    // 4. Provider list. No network opened yet.
    let providers = build_providers(&config);
    if providers.is_empty() {
        warn!("no model providers configured; every turn will fail over an empty router");
    }
    let router = Arc::new(ModelRouter::new(providers));

    let workspace_root = config
        .workspace
        .root
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    let mut agent_loop = AgentLoop::new(session_store.clone(), bus.clone(), router, tools, workspace_root);
    agent_loop.recent_window = config.memory.recent_window;
    agent_loop.summary_token_budget = config.memory.summary_token_budget;
    agent_loop.summary_threshold_percent = config.memory.summary_threshold_percent;
    agent_loop.max_iterations = config.agent.max_iterations;
    agent_loop.subagent_model = config.agent.subagent_model.clone();
    let agent = Arc::new(agent_loop);

    // 5. Channels. Only the in-memory loopback adapter is wired
    // concretely today; transport-specific adapters (Slack, Discord,
    // ...) register into the same `ChannelRegistry` when added.
    let mut channel_registry = ChannelRegistry::new();
    channel_registry.register(Arc::new(LoopbackChannel::new("local")));
    let channels = Arc::new(channel_registry);

    let shutdown = CancellationToken::new();
    let on_inbound = build_inbound_callback(bus.clone(), session_store.clone(), agent.clone(), channels.clone(), shutdown.clone());
    channels.start_all(on_inbound).await.context("starting channel adapters")?;

    // 6. HTTP/WS listener.
    let auth_mode = AuthMode::parse(&config.gateway.auth.mode);
    let secret = resolve_auth_secret(&config);
    let reload_config = Arc::new(Notify::new());
    let app_state = AppState {
        session_store: session_store.clone(),
        bus: bus.clone(),
        agent: agent.clone(),
        auth: AuthState::new(auth_mode, secret),
        started_at: std::time::Instant::now(),
        ws_clients: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        shutdown: shutdown.clone(),
        reload_config: reload_config.clone(),
    };

    // 7. Cron scheduler.
    let mut schedule_tasks = Vec::new();
    for entry in &config.schedule {
        match spawn_schedule_task(entry.clone(), bus.clone(), session_store.clone(), agent.clone(), channels.clone()) {
            Ok(handle) => schedule_tasks.push(handle),
            Err(e) => error!(entry = %entry.name, error = %e, "failed to schedule cron entry"),
        }
    }

    let config_watcher = match spawn_config_watcher(explicit_config_path, reload_config.clone(), shutdown.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "config hot-reload watcher could not start; restart required to pick up config changes");
            None
        }
    };

    info!(host = %config.gateway.host, port = config.gateway.port, "booting Talon Gateway");

    let running = Running {
        bus: bus.clone(),
        session_store,
        channels,
        shutdown: shutdown.clone(),
        reload_config,
        schedule_tasks,
        config_watcher,
    };

    let host = config.gateway.host.clone();
    let port = config.gateway.port;
    let serve_result = gateway_server::serve(&host, port, app_state).await;

    running.shutdown_gracefully(std::time::Duration::from_secs(5)).await;
    serve_result
}

/// `TALON_GATEWAY_TOKEN`, when set, overrides the on-disk stored secret
/// for `token` auth mode (per the external-interface env var contract).
/// `password` mode reads `gateway.auth.password` directly — both values
/// already passed through `${NAME}` secret resolution by the config
/// loader.
fn resolve_auth_secret(config: &Config) -> Option<gateway_server::StoredSecret> {
    match config.gateway.auth.mode.as_str() {
        "none" => None,
        "password" => config.gateway.auth.password.as_deref().map(gateway_server::StoredSecret::from_plain),
        _ => std::env::var("TALON_GATEWAY_TOKEN")
            .ok()
            .or_else(|| config.gateway.auth.token.clone())
            .as_deref()
            .map(gateway_server::StoredSecret::from_plain),
    }
}
