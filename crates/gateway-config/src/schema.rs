// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    10
}

fn default_temperature() -> f32 {
    0.7
}

fn default_recent_window() -> usize {
    8
}

fn default_summary_threshold_percent() -> u8 {
    80
}

fn default_summary_token_budget() -> usize {
    800
}

fn default_idle_ttl_hours() -> u64 {
    24
}

fn default_port() -> u16 {
    8787
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Root configuration document. Sections mirror the external interface
/// exactly: agent / gateway / channels / tools / workspace / memory /
/// schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

/// One cron-triggered job. Fires a synthetic turn against `session_key`
/// on `channel` and forwards the assistant's reply through that channel,
/// the same path a normal inbound message takes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    /// Standard 5 or 6-field cron expression, parsed by the `cron` crate.
    pub cron: String,
    pub channel: String,
    pub session_key: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default model reference, e.g. "anthropic/claude-opus-4-5".
    pub model: String,
    /// Named provider configurations, keyed by provider id.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Model used for cheap background work (compaction summaries).
    pub subagent_model: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            providers: HashMap::new(),
            subagent_model: None,
            max_iterations: default_max_iterations(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Secret values of the form `${NAME}` are resolved against the process
    /// environment by the loader before this struct is used.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    /// Wire shape: "openai-chat" | "anthropic-messages" | "custom-noauth".
    #[serde(default = "default_api_shape")]
    pub api_shape: String,
    #[serde(default)]
    pub priority: u32,
}

fn default_api_shape() -> String {
    "openai-chat".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// "none" | "token" | "password".
    #[serde(default = "default_auth_mode")]
    pub mode: String,
    pub token: Option<String>,
    pub password: Option<String>,
}

fn default_auth_mode() -> String {
    "token".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "mentionOnly" | "always" — default resolved per Open Question #1.
    #[serde(default = "default_group_activation")]
    pub group_activation: String,
    /// Opaque transport credentials, unvalidated by the core.
    #[serde(flatten)]
    pub credentials: HashMap<String, serde_yaml::Value>,
}

fn default_group_activation() -> String {
    "mentionOnly".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub categories: HashMap<String, ToolCategoryConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCategoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    pub web_search_provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub root: Option<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self { root: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_summary_threshold_percent")]
    pub summary_threshold_percent: u8,
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
    #[serde(default = "default_summary_token_budget")]
    pub summary_token_budget: usize,
    #[serde(default = "default_idle_ttl_hours")]
    pub idle_ttl_hours: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            summary_threshold_percent: default_summary_threshold_percent(),
            recent_window: default_recent_window(),
            summary_token_budget: default_summary_token_budget(),
            idle_ttl_hours: default_idle_ttl_hours(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_mention_only_group_activation_default() {
        let cfg = ChannelConfig {
            enabled: true,
            group_activation: default_group_activation(),
            credentials: HashMap::new(),
        };
        assert_eq!(cfg.group_activation, "mentionOnly");
    }

    #[test]
    fn default_auth_mode_is_token() {
        let auth = AuthConfig::default();
        assert_eq!(auth.mode, "token");
    }

    #[test]
    fn default_memory_config_matches_spec_defaults() {
        let mem = MemoryConfig::default();
        assert_eq!(mem.summary_threshold_percent, 80);
        assert_eq!(mem.recent_window, 8);
        assert_eq!(mem.summary_token_budget, 800);
        assert_eq!(mem.idle_ttl_hours, 24);
    }

    #[test]
    fn config_roundtrips_through_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.agent.max_iterations, cfg.agent.max_iterations);
        assert_eq!(parsed.memory.recent_window, cfg.memory.recent_window);
    }
}
