// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use thiserror::Error;

/// Closed classification of everything that can go wrong calling a
/// provider. The router's fallback/retry behavior is keyed entirely off
/// this enum — never off provider-specific error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    RateLimit,
    Timeout,
    ContextOverflow,
    Billing,
    ProviderDown,
    ToolArgInvalid,
    ToolExecFailed,
    Cancelled,
    Fatal,
}

#[derive(Debug, Error)]
#[error("{class:?}: {message}")]
pub struct ProviderError {
    pub class: ErrorClass,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Classify a raw HTTP status code the way every OpenAI-compatible
    /// provider reports it.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let class = match status {
            401 | 403 => ErrorClass::Auth,
            402 => ErrorClass::Billing,
            408 => ErrorClass::Timeout,
            409 | 422 => ErrorClass::ToolArgInvalid,
            429 => ErrorClass::RateLimit,
            500..=599 => ErrorClass::ProviderDown,
            _ => ErrorClass::Fatal,
        };
        Self::new(class, message)
    }
}
