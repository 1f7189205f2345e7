// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Priority-ordered dispatch across providers with the error-classification
//! driven fallback table. This orchestration layer has no teacher
//! counterpart — it is new code grounded on the component design's error
//! classification table, generalizing the single-provider call in the
//! teacher's CLI entrypoint into a list with retry/fallback semantics.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorClass, ProviderError};
use crate::provider::ModelProvider;
use crate::types::{CompletionRequest, CompletionResult, StreamEvent};

pub struct ModelRouter {
    providers: Vec<Arc<dyn ModelProvider>>,
    disabled_for_session: std::sync::Mutex<HashSet<String>>,
}

#[derive(Debug, thiserror::Error)]
#[error("every provider in the priority list failed; last error: {last}")]
pub struct RouterExhausted {
    pub last: ProviderError,
    pub provider_path: Vec<String>,
}

impl ModelRouter {
    /// `providers` must already be sorted ascending by priority.
    pub fn new(providers: Vec<Arc<dyn ModelProvider>>) -> Self {
        Self {
            providers,
            disabled_for_session: std::sync::Mutex::new(HashSet::new()),
        }
    }

    fn is_disabled(&self, id: &str) -> bool {
        self.disabled_for_session.lock().unwrap().contains(id)
    }

    fn disable(&self, id: &str) {
        self.disabled_for_session.lock().unwrap().insert(id.to_string());
    }

    /// Drive one turn across the provider list, applying the
    /// classification table: `Auth`/`Billing` disable the provider for the
    /// rest of the session and move on; `RateLimit` moves on to the next
    /// provider immediately, recording the error; `Timeout`/`ProviderDown`
    /// move on; `ContextOverflow` is handed back to the caller (which must
    /// compact and ask for a same-provider retry via `retry_same`);
    /// `Cancelled` aborts immediately with no further attempts. If the
    /// list is exhausted and the last recorded error was a `RateLimit`,
    /// wait `retry_after` (capped at 10s) and retry the head of the list
    /// exactly once before giving up.
    pub async fn invoke(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<(CompletionResult, Vec<String>), RouterExhausted> {
        let mut provider_path = Vec::new();
        let mut last_err: Option<ProviderError> = None;

        for provider in &self.providers {
            if self.is_disabled(provider.id()) {
                continue;
            }
            if provider_path.contains(&provider.id().to_string()) {
                continue;
            }

            match self.try_provider(provider, &request, &sink, &cancel).await {
                Ok(result) => {
                    provider_path.push(provider.id().to_string());
                    return Ok((result, provider_path));
                }
                Err(err) => {
                    provider_path.push(provider.id().to_string());
                    match err.class {
                        ErrorClass::Auth | ErrorClass::Billing => {
                            warn!(provider = provider.id(), class = ?err.class, "disabling provider for session");
                            self.disable(provider.id());
                        }
                        ErrorClass::Cancelled => {
                            return Err(RouterExhausted { last: err, provider_path });
                        }
                        ErrorClass::RateLimit => {
                            debug!(provider = provider.id(), "rate limited, trying next provider immediately");
                        }
                        ErrorClass::Timeout | ErrorClass::ProviderDown | ErrorClass::Fatal => {}
                        ErrorClass::ContextOverflow | ErrorClass::ToolArgInvalid | ErrorClass::ToolExecFailed => {}
                    }
                    last_err = Some(err);
                }
            }
        }

        if let Some(ProviderError { class: ErrorClass::RateLimit, retry_after: Some(retry_after), .. }) = &last_err {
            if let Some(head) = self.providers.first() {
                if !self.is_disabled(head.id()) {
                    let capped = (*retry_after).min(Duration::from_secs(10));
                    debug!(provider = head.id(), ?capped, "providers exhausted on rate limit, retrying head of list once");
                    tokio::time::sleep(capped).await;
                    match self.try_provider(head, &request, &sink, &cancel).await {
                        Ok(result) => {
                            provider_path.push(head.id().to_string());
                            return Ok((result, provider_path));
                        }
                        Err(err) => {
                            provider_path.push(head.id().to_string());
                            last_err = Some(err);
                        }
                    }
                }
            }
        }

        Err(RouterExhausted {
            last: last_err.unwrap_or_else(|| ProviderError::new(ErrorClass::Fatal, "no providers configured")),
            provider_path,
        })
    }

    /// Picks a provider for cheap background work (e.g. compaction
    /// summaries): the provider whose `model_name()` matches `model_hint`
    /// (typically `agent.subagent_model` from config) if one is
    /// configured and present, otherwise the lowest-priority provider in
    /// the list (the last entry, since the list is sorted ascending by
    /// priority).
    pub fn select(&self, model_hint: Option<&str>) -> Option<Arc<dyn ModelProvider>> {
        if let Some(hint) = model_hint {
            if let Some(found) = self.providers.iter().find(|p| p.model_name() == hint || p.id() == hint) {
                return Some(found.clone());
            }
        }
        self.providers.last().cloned()
    }

    /// Retry a single already-attempted provider once more, used for the
    /// `ContextOverflow` same-provider-retry path after compaction. Does
    /// not consult `disabled_for_session` — an overflow is not an auth or
    /// billing failure.
    pub async fn retry_same(
        &self,
        provider_id: &str,
        request: CompletionRequest,
        sink: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<CompletionResult, ProviderError> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.id() == provider_id)
            .ok_or_else(|| ProviderError::new(ErrorClass::Fatal, "retry target not in provider list"))?;
        self.try_provider(provider, &request, &sink, &cancel).await
    }

    async fn try_provider(
        &self,
        provider: &Arc<dyn ModelProvider>,
        request: &CompletionRequest,
        sink: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResult, ProviderError> {
        provider.complete(request.clone(), sink.clone(), cancel.clone()).await
    }
}
