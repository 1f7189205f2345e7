// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::bus::{Event, EventBus, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultRef {
    pub call_id: String,
    pub is_error: bool,
}

/// One message in a session's transcript. Never mutated after append —
/// compaction replaces the whole `Vec<Message>`, it never edits in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultRef>,
    pub tokens: usize,
    pub timestamp: DateTime<Utc>,
}

/// Character-per-token heuristic shared by every token-budgeted
/// calculation in this crate: 4 characters ≈ 1 token.
pub fn approx_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            tokens: approx_tokens(&content),
            role,
            content,
            tool_calls: Vec::new(),
            tool_result: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCallRef>) -> Self {
        let mut m = Self::new(Role::Assistant, content);
        m.tool_calls = tool_calls;
        m
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        let mut m = Self::new(Role::Tool, content);
        m.tool_result = Some(ToolResultRef { call_id: call_id.into(), is_error });
        m
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Thinking,
    ToolRunning,
    Compressing,
    Responding,
    Error,
}

/// One conversation. `active_run_id = None` whenever `state` is `Idle` or
/// `Error` (a failed turn leaves no run in flight); every other state
/// carries a run id. Enforced by every mutator in this module, never by
/// callers directly poking fields.
#[derive(Debug)]
pub struct Session {
    pub key: String,
    pub id: Uuid,
    pub messages: Vec<Message>,
    pub state: SessionState,
    pub tokens: usize,
    pub active_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub channel: String,
}

impl Session {
    /// Constructs a detached session outside the store, for agent-loop
    /// tests that need a `Session` without going through
    /// `SessionStore::get_or_create`.
    #[doc(hidden)]
    pub fn new_for_test(key: impl Into<String>, channel: impl Into<String>) -> Self {
        Self::new(key, channel)
    }

    fn new(key: impl Into<String>, channel: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            id: Uuid::new_v4(),
            messages: Vec::new(),
            state: SessionState::Idle,
            tokens: 0,
            active_run_id: None,
            created_at: now,
            last_activity_at: now,
            channel: channel.into(),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.tokens += message.tokens;
        self.messages.push(message);
        self.last_activity_at = Utc::now();
    }

    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.tokens = messages.iter().map(|m| m.tokens).sum();
        self.messages = messages;
    }

    /// Begin a turn. Panics (a programmer error, not a runtime condition)
    /// if a turn is already active — callers must check `state` first via
    /// the store's per-session mutex, which already serializes this.
    /// Starting from `Error` is allowed: a failed turn leaves the session
    /// idle-for-dispatch-purposes even though it reports `Error` until the
    /// next turn begins.
    pub fn begin_turn(&mut self) -> Uuid {
        assert!(
            matches!(self.state, SessionState::Idle | SessionState::Error),
            "begin_turn called while a turn is already active"
        );
        let run_id = Uuid::new_v4();
        self.active_run_id = Some(run_id);
        self.state = SessionState::Thinking;
        run_id
    }

    /// Advances the state of a turn already begun. Never used to reach
    /// `Idle` or `Error` — those are only reached via `end_turn`/`fail_turn`.
    pub fn transition(&mut self, state: SessionState) {
        assert!(self.active_run_id.is_some(), "transition called outside an active turn");
        assert!(
            !matches!(state, SessionState::Idle | SessionState::Error),
            "use end_turn/fail_turn to leave an active turn"
        );
        self.state = state;
    }

    /// Successful completion of a turn.
    pub fn end_turn(&mut self) {
        self.active_run_id = None;
        self.state = SessionState::Idle;
    }

    /// Terminal failure of a turn: no run remains in flight, but the
    /// session reports `Error` (rather than `Idle`) until the next turn
    /// starts, so `/api/sessions` can surface the failure.
    pub fn fail_turn(&mut self) {
        self.active_run_id = None;
        self.state = SessionState::Error;
    }
}

/// Derives the session key for each supported interaction surface.
pub mod key {
    pub fn direct_message(channel: &str, sender_id: &str) -> String {
        format!("{channel}:dm:{sender_id}")
    }

    pub fn group(channel: &str, group_id: &str) -> String {
        format!("{channel}:group:{group_id}")
    }

    pub fn local_cli() -> String {
        "local:cli".to_string()
    }
}

/// Per-key `Mutex<Session>` behind a `RwLock` map: map-shape reads (e.g.
/// `/api/sessions` enumeration) take a read lock while turn execution
/// holds only the per-session mutex.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    idle_ttl: chrono::Duration,
}

impl SessionStore {
    pub fn new(idle_ttl: chrono::Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_ttl,
        }
    }

    pub async fn get_or_create(&self, key: &str, channel: &str, bus: &EventBus) -> Arc<Mutex<Session>> {
        if let Some(existing) = self.sessions.read().await.get(key) {
            return existing.clone();
        }
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(key) {
            return existing.clone();
        }
        let session = Arc::new(Mutex::new(Session::new(key, channel)));
        sessions.insert(key.to_string(), session.clone());
        bus.publish(
            Topic::SessionCreated,
            Event { session_key: key.to_string(), payload: serde_json::Value::Null },
        );
        session
    }

    /// Rotates `id`, clears `messages`, preserves `key`.
    pub async fn reset(&self, key: &str, bus: &EventBus) {
        let sessions = self.sessions.read().await;
        if let Some(session) = sessions.get(key) {
            let mut session = session.lock().await;
            session.id = Uuid::new_v4();
            session.messages.clear();
            session.tokens = 0;
            session.active_run_id = None;
            session.state = SessionState::Idle;
        }
        drop(sessions);
        bus.publish(
            Topic::SessionReset,
            Event { session_key: key.to_string(), payload: serde_json::Value::Null },
        );
    }

    pub async fn touch(&self, key: &str) {
        if let Some(session) = self.sessions.read().await.get(key) {
            session.lock().await.last_activity_at = Utc::now();
        }
    }

    pub async fn list(&self) -> Vec<(String, String, SessionState, usize)> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            let session = session.lock().await;
            out.push((session.key.clone(), session.channel.clone(), session.state, session.messages.len()));
        }
        out
    }

    /// Evicts sessions whose `last_activity_at` has exceeded the idle TTL.
    /// Eviction drops in-memory state only. Intended to run as a periodic
    /// background task owned by the orchestrator.
    pub async fn evict_idle(&self, now: DateTime<Utc>, bus: &EventBus) {
        let expired_keys: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut expired = Vec::new();
            for (key, session) in sessions.iter() {
                let session = session.lock().await;
                if now.signed_duration_since(session.last_activity_at) > self.idle_ttl {
                    expired.push(key.clone());
                }
            }
            expired
        };
        if expired_keys.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write().await;
        for key in expired_keys {
            sessions.remove(&key);
            bus.publish(
                Topic::SessionReset,
                Event { session_key: key, payload: serde_json::Value::Null },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_matches_each_surface() {
        assert_eq!(key::direct_message("slack", "u1"), "slack:dm:u1");
        assert_eq!(key::group("slack", "g1"), "slack:group:g1");
        assert_eq!(key::local_cli(), "local:cli");
    }

    #[test]
    fn session_state_idle_iff_no_active_run() {
        let mut session = Session::new("k", "local");
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.active_run_id.is_none());
        session.begin_turn();
        assert_eq!(session.state, SessionState::Thinking);
        assert!(session.active_run_id.is_some());
        session.transition(SessionState::ToolRunning);
        assert_eq!(session.state, SessionState::ToolRunning);
        assert!(session.active_run_id.is_some());
        session.end_turn();
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.active_run_id.is_none());
    }

    #[test]
    fn failed_turn_reports_error_until_next_turn_begins() {
        let mut session = Session::new("k", "local");
        session.begin_turn();
        session.fail_turn();
        assert_eq!(session.state, SessionState::Error);
        assert!(session.active_run_id.is_none());
        session.begin_turn();
        assert_eq!(session.state, SessionState::Thinking);
    }

    #[tokio::test]
    async fn get_or_create_returns_same_session_for_same_key() {
        let bus = EventBus::new();
        let store = SessionStore::new(chrono::Duration::hours(24));
        let a = store.get_or_create("k", "local", &bus).await;
        let b = store.get_or_create("k", "local", &bus).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn reset_preserves_key_but_rotates_id_and_clears_messages() {
        let bus = EventBus::new();
        let store = SessionStore::new(chrono::Duration::hours(24));
        let session = store.get_or_create("k", "local", &bus).await;
        let original_id = { session.lock().await.id };
        session.lock().await.push(Message::user("hi"));

        store.reset("k", &bus).await;

        let session = session.lock().await;
        assert_eq!(session.key, "k");
        assert_ne!(session.id, original_id);
        assert!(session.messages.is_empty());
    }

    #[tokio::test]
    async fn evict_idle_removes_sessions_past_ttl() {
        let bus = EventBus::new();
        let store = SessionStore::new(chrono::Duration::seconds(1));
        store.get_or_create("k", "local", &bus).await;

        let future = Utc::now() + chrono::Duration::seconds(10);
        store.evict_idle(future, &bus).await;

        assert!(store.list().await.is_empty());
    }

    #[test]
    fn messages_are_never_mutated_after_append_by_construction() {
        let m = Message::user("hi");
        assert_eq!(m.content, "hi");
    }
}
