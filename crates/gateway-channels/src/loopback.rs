// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-memory channel adapter used by the local CLI/TUI entrypoint and by
//! tests. Grounded on the fixed `local:cli` session key the core reserves
//! for non-transport interaction.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::channel::{Channel, InboundCallback, NormalizedMessage};

pub struct LoopbackChannel {
    id: String,
    start_count: AtomicUsize,
    sent: Mutex<Vec<(String, String)>>,
}

impl LoopbackChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start_count: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Deliver a message as if it came from the transport, for driving
    /// the local CLI/TUI and for tests.
    pub fn deliver(&self, on_inbound: &InboundCallback, message: NormalizedMessage) {
        on_inbound(message);
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, _on_inbound: InboundCallback) -> anyhow::Result<()> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(&self, session_key: &str, content: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((session_key.to_string(), content.to_string()));
        Ok(())
    }
}
