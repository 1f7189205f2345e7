// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::types::{CompletionRequest, CompletionResult, StreamEvent};

/// Wire shape a provider speaks. Drives which translation module the
/// router hands a [`CompletionRequest`] to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiShape {
    OpenAiChat,
    AnthropicMessages,
    /// No authorization header at all — local/no-credential servers such
    /// as Ollama or llama.cpp.
    CustomNoAuth,
}

/// Where a provider's API key comes from. Resolution happens in
/// `gateway-config`; by the time a [`ProviderDescriptor`] reaches this
/// crate the credential is already a literal value (or absent).
#[derive(Debug, Clone)]
pub enum CredentialRef {
    Literal(String),
    None,
}

#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub id: String,
    pub base_url: String,
    pub credential: CredentialRef,
    pub api_shape: ApiShape,
    pub priority: u32,
    pub model_ids: Vec<String>,
    pub supports_streaming: bool,
    pub supports_tools: bool,
}

/// One LLM backend the router can dispatch a turn to.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> &str;
    fn model_name(&self) -> &str;

    /// Issue a completion call, forwarding streaming deltas to `sink` as
    /// they arrive. Returns the fully assembled result on success, or a
    /// classified [`ProviderError`] on failure. Must observe `cancel` and
    /// return `ErrorClass::Cancelled` promptly when it fires.
    async fn complete(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<CompletionResult, ProviderError>;
}
