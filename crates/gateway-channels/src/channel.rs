// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A message normalized away from any transport-specific payload shape.
/// This is the only form the core ever sees — channel adapters own the
/// translation in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub channel: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<serde_json::Value>,
}

pub type InboundCallback = Arc<dyn Fn(NormalizedMessage) + Send + Sync>;

/// A transport adapter (Slack, Discord, local CLI, ...). The core never
/// names a concrete transport; it only drives this trait.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> &str;

    /// Start the adapter. Must be idempotent: calling `start` on an
    /// already-started channel logs a warning and returns `Ok(())`.
    async fn start(&self, on_inbound: InboundCallback) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    async fn send(&self, session_key: &str, content: &str) -> anyhow::Result<()>;
}
