// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::channel::{Channel, InboundCallback};

/// Holds every configured channel adapter and fans inbound messages out
/// to a single registered callback (C1's inbound publication path).
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn Channel>>,
    started: Mutex<HashSet<String>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            started: Mutex::new(HashSet::new()),
        }
    }

    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.id().to_string(), channel);
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start every registered channel. A channel already marked started is
    /// skipped with a warning rather than re-invoked — satisfies the
    /// idempotent-start testable property owned by the orchestrator.
    pub async fn start_all(&self, on_inbound: InboundCallback) -> anyhow::Result<()> {
        for (id, channel) in &self.channels {
            let already_started = {
                let mut started = self.started.lock().unwrap();
                !started.insert(id.clone())
            };
            if already_started {
                warn!(channel = id.as_str(), "channel already started, skipping duplicate start");
                continue;
            }
            channel.start(on_inbound.clone()).await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) -> anyhow::Result<()> {
        for (id, channel) in &self.channels {
            channel.stop().await?;
            self.started.lock().unwrap().remove(id);
        }
        Ok(())
    }

    pub async fn send(&self, channel_id: &str, session_key: &str, content: &str) -> anyhow::Result<()> {
        let channel = self
            .channels
            .get(channel_id)
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {channel_id}"))?;
        channel.send(session_key, content).await
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackChannel;

    #[tokio::test]
    async fn start_all_is_idempotent_per_channel() {
        let mut registry = ChannelRegistry::new();
        let loopback = Arc::new(LoopbackChannel::new("local"));
        registry.register(loopback.clone());

        let cb: InboundCallback = Arc::new(|_msg| {});
        registry.start_all(cb.clone()).await.unwrap();
        registry.start_all(cb).await.unwrap();

        assert_eq!(loopback.start_count(), 1, "second start_all must not re-invoke the channel");
    }

    #[tokio::test]
    async fn send_routes_to_the_named_channel() {
        let mut registry = ChannelRegistry::new();
        let loopback = Arc::new(LoopbackChannel::new("local"));
        registry.register(loopback.clone());
        registry.send("local", "local:cli", "hello").await.unwrap();
        assert_eq!(loopback.sent().len(), 1);
    }

    #[tokio::test]
    async fn send_to_unknown_channel_errors() {
        let registry = ChannelRegistry::new();
        assert!(registry.send("ghost", "k", "hi").await.is_err());
    }
}
