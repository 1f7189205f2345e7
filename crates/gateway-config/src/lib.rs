// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod schema;

pub use loader::{config_search_paths, load, merge_yaml, validate, ConfigError};
pub use schema::{
    AgentConfig, AuthConfig, ChannelConfig, Config, GatewayConfig, MemoryConfig, ProviderConfig,
    ScheduleEntry, ToolCategoryConfig, ToolsConfig, WorkspaceConfig,
};
