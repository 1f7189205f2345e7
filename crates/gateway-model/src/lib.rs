// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod error;
mod http_provider;
mod provider;
mod router;
mod types;

pub use error::{ErrorClass, ProviderError};
pub use http_provider::HttpModelProvider;
pub use provider::{ApiShape, CredentialRef, ModelProvider, ProviderDescriptor};
pub use router::{ModelRouter, RouterExhausted};
pub use types::{
    CompletionRequest, CompletionResult, Message, Role, StreamEvent, ToolCallRequest, ToolSchema,
    Usage,
};
