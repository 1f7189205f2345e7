// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Multi-path config discovery, deep-merge, and `${NAME}` secret resolution.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::schema::{Config, ScheduleEntry};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("secret reference ${{{name}}} at {field_path} has no matching environment variable")]
    MissingSecret { name: String, field_path: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Search path order, lowest to highest precedence (later paths win on merge).
pub fn config_search_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/talon-gateway/config.yaml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/talon-gateway/config.yaml"));
    }

    paths.push(PathBuf::from(".talon-gateway/config.yaml"));

    if let Some(explicit) = explicit {
        paths.push(explicit.to_path_buf());
    }

    paths
}

/// Load and deep-merge every existing config file in search-path order,
/// then resolve `${NAME}` secret references against the process environment.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let paths = config_search_paths(explicit);

    let mut merged = serde_yaml::Value::Mapping(Default::default());
    let mut any_found = false;

    for path in &paths {
        if !path.exists() {
            continue;
        }
        any_found = true;
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.clone(),
            source: e,
        })?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.clone(),
                source: e,
            })?;
        debug!(path = %path.display(), "merging config layer");
        merge_yaml(&mut merged, value);
    }

    if !any_found {
        warn!("no config file found on any search path; using built-in defaults");
    }

    resolve_secrets(&mut merged, "")?;

    let config: Config = serde_yaml::from_value(merged).map_err(|e| ConfigError::Parse {
        path: PathBuf::from("<merged>"),
        source: e,
    })?;

    Ok(config)
}

/// Post-parse checks that `serde`'s schema validation can't express:
/// closed-set string fields, and every schedule entry naming a non-empty
/// cron expression. Not run by [`load`] itself (defaults must stay
/// loadable for `ShowConfig`-style introspection) — the orchestrator's
/// boot sequence calls this explicitly as its validation step.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    match config.gateway.auth.mode.as_str() {
        "none" | "token" | "password" => {}
        other => {
            return Err(ConfigError::Invalid(format!(
                "gateway.auth.mode must be one of none|token|password, got {other:?}"
            )))
        }
    }

    if config.agent.model.trim().is_empty() {
        return Err(ConfigError::Invalid("agent.model must not be empty".to_string()));
    }

    for entry in &config.schedule {
        if entry.cron.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("schedule entry {:?} has an empty cron expression", entry.name)));
        }
        if entry.name.trim().is_empty() {
            return Err(ConfigError::Invalid("schedule entry has an empty name".to_string()));
        }
    }

    Ok(())
}

/// Deep-merge `overlay` into `base`. Scalars and sequences in `overlay`
/// replace `base`; mappings merge key-by-key, recursing into shared keys.
pub fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value;
        }
    }
}

/// Walk every string scalar in the parsed tree and substitute `${NAME}`
/// tokens with the matching environment variable. Errors if a referenced
/// variable is unset.
fn resolve_secrets(value: &mut serde_yaml::Value, path: &str) -> Result<(), ConfigError> {
    match value {
        serde_yaml::Value::String(s) => {
            if let Some(name) = extract_secret_ref(s) {
                let resolved = std::env::var(&name).map_err(|_| ConfigError::MissingSecret {
                    name: name.clone(),
                    field_path: path.to_string(),
                })?;
                *s = resolved;
            }
            Ok(())
        }
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map.iter_mut() {
                let key_name = k.as_str().unwrap_or("?").to_string();
                let child_path = if path.is_empty() {
                    key_name
                } else {
                    format!("{path}.{key_name}")
                };
                resolve_secrets(v, &child_path)?;
            }
            Ok(())
        }
        serde_yaml::Value::Sequence(seq) => {
            for (i, v) in seq.iter_mut().enumerate() {
                resolve_secrets(v, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Returns `Some(name)` when `s` is exactly a `${NAME}` reference.
fn extract_secret_ref(s: &str) -> Option<String> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(inner.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_yaml_overlay_scalar_replaces_base() {
        let mut base: serde_yaml::Value = serde_yaml::from_str("a: 1\nb: 2").unwrap();
        let overlay: serde_yaml::Value = serde_yaml::from_str("b: 3").unwrap();
        merge_yaml(&mut base, overlay);
        assert_eq!(base["a"], serde_yaml::Value::from(1));
        assert_eq!(base["b"], serde_yaml::Value::from(3));
    }

    #[test]
    fn merge_yaml_recurses_into_nested_mappings() {
        let mut base: serde_yaml::Value =
            serde_yaml::from_str("gateway:\n  host: 127.0.0.1\n  port: 8787").unwrap();
        let overlay: serde_yaml::Value = serde_yaml::from_str("gateway:\n  port: 9000").unwrap();
        merge_yaml(&mut base, overlay);
        assert_eq!(base["gateway"]["host"], serde_yaml::Value::from("127.0.0.1"));
        assert_eq!(base["gateway"]["port"], serde_yaml::Value::from(9000));
    }

    #[test]
    fn validate_rejects_empty_model() {
        let cfg = Config::default();
        let err = validate(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn validate_rejects_unknown_auth_mode() {
        let mut cfg = Config::default();
        cfg.agent.model = "anthropic/claude".to_string();
        cfg.gateway.auth.mode = "carrier-pigeon".to_string();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn validate_accepts_a_minimal_well_formed_config() {
        let mut cfg = Config::default();
        cfg.agent.model = "anthropic/claude".to_string();
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn validate_rejects_schedule_entry_with_blank_cron() {
        let mut cfg = Config::default();
        cfg.agent.model = "anthropic/claude".to_string();
        cfg.schedule.push(ScheduleEntry {
            name: "daily-digest".into(),
            cron: "   ".into(),
            channel: "local".into(),
            session_key: "local:cli".into(),
            prompt: "summarize today".into(),
        });
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn extract_secret_ref_matches_well_formed_token() {
        assert_eq!(
            extract_secret_ref("${OPENAI_API_KEY}"),
            Some("OPENAI_API_KEY".to_string())
        );
    }

    #[test]
    fn extract_secret_ref_rejects_partial_or_plain_strings() {
        assert_eq!(extract_secret_ref("plain-value"), None);
        assert_eq!(extract_secret_ref("prefix-${NAME}"), None);
        assert_eq!(extract_secret_ref("${}"), None);
    }

    #[test]
    fn resolve_secrets_substitutes_env_value() {
        std::env::set_var("GW_TEST_SECRET_A", "resolved-value");
        let mut value: serde_yaml::Value =
            serde_yaml::from_str("key: \"${GW_TEST_SECRET_A}\"").unwrap();
        resolve_secrets(&mut value, "").unwrap();
        assert_eq!(value["key"], serde_yaml::Value::from("resolved-value"));
        std::env::remove_var("GW_TEST_SECRET_A");
    }

    #[test]
    fn resolve_secrets_errors_on_missing_env_var() {
        let mut value: serde_yaml::Value =
            serde_yaml::from_str("key: \"${GW_TEST_DEFINITELY_UNSET}\"").unwrap();
        let err = resolve_secrets(&mut value, "agent.providers.openai").unwrap_err();
        match err {
            ConfigError::MissingSecret { name, field_path } => {
                assert_eq!(name, "GW_TEST_DEFINITELY_UNSET");
                assert_eq!(field_path, "agent.providers.openai.key");
            }
            other => panic!("expected MissingSecret, got {other:?}"),
        }
    }

    #[test]
    fn load_falls_back_to_defaults_when_no_file_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.yaml");
        let config = load(Some(&missing)).unwrap();
        assert_eq!(config.gateway.port, 8787);
    }

    #[test]
    fn load_reads_explicit_path_and_applies_secret() {
        std::env::set_var("GW_TEST_SECRET_B", "sk-test-123");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "agent:\n  model: anthropic/claude\n  providers:\n    anthropic:\n      api_key: \"${GW_TEST_SECRET_B}\"\n",
        )
        .unwrap();
        let config = load(Some(&path)).unwrap();
        assert_eq!(
            config.agent.providers["anthropic"].api_key.as_deref(),
            Some("sk-test-123")
        );
        std::env::remove_var("GW_TEST_SECRET_B");
    }
}
