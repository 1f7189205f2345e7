// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-process topic broker. Generalizes the teacher's single-consumer
//! `AgentHandle::subscribe() -> broadcast::Receiver<_>` pattern (used only
//! for the WebSocket bridge in the teacher) into a named multi-topic,
//! multi-subscriber registry — this crate's true pub/sub backbone.
//!
//! Backed by one bounded `mpsc` channel per subscriber rather than a
//! shared `broadcast` sender: `broadcast::Sender::send` never blocks and
//! silently overwrites the oldest buffered item for a lagging receiver,
//! which cannot honor a "never drop outbound" guarantee no matter how a
//! caller wraps it in a timeout. A bounded `mpsc::Sender` genuinely
//! exerts back-pressure on `send().await`, which is what `publish_outbound`
//! needs to block on up to its deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 256;
const DEFAULT_OUTBOUND_DEADLINE: Duration = Duration::from_millis(50);

/// The closed set of topics the bus ever carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Inbound,
    Outbound,
    AgentStream,
    AgentToolCall,
    AgentToolResult,
    AgentDone,
    AgentError,
    SessionCreated,
    SessionReset,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_key: String,
    pub payload: Value,
}

type Subscriber = (String, mpsc::Sender<Arc<Event>>);

pub struct EventBus {
    subscribers: Mutex<HashMap<Topic, Vec<Subscriber>>>,
    outbound_deadline: Duration,
    dropped_outbound: AtomicU64,
    dropped_lagging: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            outbound_deadline: DEFAULT_OUTBOUND_DEADLINE,
            dropped_outbound: AtomicU64::new(0),
            dropped_lagging: AtomicU64::new(0),
        }
    }

    /// Register a named subscriber on `topic`. Re-subscribing the same
    /// `(topic, handler_id)` pair replaces the previous registration (its
    /// receiver is orphaned) and logs a warning — guards the historical
    /// duplicate-listener bug.
    pub fn subscribe(&self, topic: Topic, handler_id: &str) -> mpsc::Receiver<Arc<Event>> {
        let (tx, rx) = mpsc::channel(DEFAULT_CAPACITY);
        let mut subscribers = self.subscribers.lock().unwrap();
        let list = subscribers.entry(topic).or_default();
        if list.iter().any(|(id, _)| id == handler_id) {
            warn!(handler = handler_id, ?topic, "duplicate subscription, replacing");
        }
        list.retain(|(id, _)| id != handler_id);
        list.push((handler_id.to_string(), tx));
        rx
    }

    pub fn unsubscribe(&self, topic: Topic, handler_id: &str) {
        if let Some(list) = self.subscribers.lock().unwrap().get_mut(&topic) {
            list.retain(|(id, _)| id != handler_id);
        }
    }

    fn subscribers_for(&self, topic: Topic) -> Vec<Subscriber> {
        self.subscribers.lock().unwrap().get(&topic).cloned().unwrap_or_default()
    }

    /// Non-blocking publish. A subscriber whose channel is full has its
    /// newest event dropped — there is no producer-side primitive to
    /// evict an already-buffered item from a plain `mpsc` channel — and a
    /// warning is logged at the moment of the drop, unlike `broadcast`'s
    /// silent overwrite-oldest behavior.
    pub fn publish(&self, topic: Topic, event: Event) {
        let event = Arc::new(event);
        for (handler_id, tx) in self.subscribers_for(topic) {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                self.dropped_lagging.fetch_add(1, Ordering::SeqCst);
                warn!(handler = handler_id, ?topic, "subscriber lagging, dropping event");
            }
        }
    }

    /// Outbound publication blocks the caller, per subscriber, up to
    /// `outbound_deadline` — genuine back-pressure, not a no-op timeout
    /// wrapper around a send that never blocks. Only a subscriber that
    /// fails to drain within the deadline loses an event, and that loss is
    /// counted and logged.
    pub async fn publish_outbound(&self, event: Event) {
        let event = Arc::new(event);
        for (handler_id, tx) in self.subscribers_for(Topic::Outbound) {
            let event = event.clone();
            if timeout(self.outbound_deadline, tx.send(event)).await.is_err() {
                self.dropped_outbound.fetch_add(1, Ordering::SeqCst);
                warn!(handler = handler_id, "outbound publish exceeded deadline, dropping");
            }
        }
    }

    pub fn dropped_outbound_count(&self) -> u64 {
        self.dropped_outbound.load(Ordering::SeqCst)
    }

    pub fn dropped_lagging_count(&self) -> u64 {
        self.dropped_lagging.load(Ordering::SeqCst)
    }

    /// Publish `Shutdown` and drop every tracked subscription. Live
    /// receivers see their channel close once their sender is dropped
    /// along with the bus itself.
    pub fn shutdown(&self) {
        self.publish(
            Topic::Shutdown,
            Event {
                session_key: String::new(),
                payload: Value::Null,
            },
        );
        self.subscribers.lock().unwrap().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Topic::SessionCreated, "handler-a");
        bus.publish(
            Topic::SessionCreated,
            Event { session_key: "k".into(), payload: Value::Null },
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_key, "k");
    }

    #[tokio::test]
    async fn independent_topics_do_not_cross_deliver() {
        let bus = EventBus::new();
        let mut inbound_rx = bus.subscribe(Topic::Inbound, "h");
        bus.publish(
            Topic::SessionCreated,
            Event { session_key: "k".into(), payload: Value::Null },
        );
        assert!(inbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_their_own_copy() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe(Topic::AgentDone, "h1");
        let mut rx2 = bus.subscribe(Topic::AgentDone, "h2");
        bus.publish(
            Topic::AgentDone,
            Event { session_key: "k".into(), payload: Value::Null },
        );
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn duplicate_subscription_replaces_prior_registration() {
        let bus = EventBus::new();
        let _rx1 = bus.subscribe(Topic::Inbound, "h1");
        let _rx2 = bus.subscribe(Topic::Inbound, "h1");
        let subs = bus.subscribers.lock().unwrap();
        assert_eq!(subs.get(&Topic::Inbound).unwrap().iter().filter(|(id, _)| id == "h1").count(), 1);
    }

    #[tokio::test]
    async fn publish_outbound_delivers_within_deadline() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Topic::Outbound, "ws-1");
        bus.publish_outbound(Event { session_key: "k".into(), payload: Value::Null }).await;
        assert!(rx.recv().await.is_some());
        assert_eq!(bus.dropped_outbound_count(), 0);
    }

    #[tokio::test]
    async fn publish_drops_newest_and_warns_when_subscriber_is_full() {
        let bus = EventBus::new();
        let rx = bus.subscribe(Topic::AgentStream, "slow");
        for i in 0..DEFAULT_CAPACITY + 1 {
            bus.publish(
                Topic::AgentStream,
                Event { session_key: format!("k{i}"), payload: Value::Null },
            );
        }
        assert_eq!(bus.dropped_lagging_count(), 1);
        drop(rx);
    }
}
