//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::FoundrySettings;

/// `~/.foundry`, falling back to `/tmp/.foundry` without a home directory.
pub fn foundry_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".foundry")
}

/// Resolve the path to the settings file (`~/.foundry/settings.json`).
pub fn settings_path() -> PathBuf {
    foundry_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<FoundrySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<FoundrySettings> {
    let defaults = serde_json::to_value(FoundrySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: FoundrySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `FOUNDRY_*` environment variable overrides. Invalid values are
/// ignored with a warning.
pub fn apply_env_overrides(settings: &mut FoundrySettings) {
    if let Some(v) = read_env_string("FOUNDRY_SERVER_URL") {
        settings.server.base_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = read_env_string("FOUNDRY_STORE_PATH") {
        settings.store.path = PathBuf::from(v);
    }
    if let Some(v) = read_env_string("FOUNDRY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("FOUNDRY_LOG_JSON") {
        settings.logging.json = v;
    }
    if let Some(v) = read_env_u32("FOUNDRY_MAX_RECONNECTS", 0, 100) {
        settings.stream.max_reconnect_attempts = v;
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"baseUrl": "a", "connectTimeoutMs": 1}});
        let source = serde_json::json!({"server": {"baseUrl": "b"}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["baseUrl"], "b");
        assert_eq!(merged["server"]["connectTimeoutMs"], 1);
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.stream, FoundrySettings::default().stream);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"stream": {"maxDelayMs": 30000}, "logging": {"json": true}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.stream.max_delay_ms, 30_000);
        assert_eq!(settings.stream.base_delay_ms, 1_000);
        assert!(settings.logging.json);
        assert_eq!(settings.logging.level, "warn");
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_u32_range_bounds() {
        assert_eq!(parse_u32_range("5", 0, 100), Some(5));
        assert_eq!(parse_u32_range("101", 0, 100), None);
        assert_eq!(parse_u32_range("-1", 0, 100), None);
    }

    #[test]
    fn settings_path_is_under_foundry_dir() {
        assert!(settings_path().starts_with(foundry_dir()));
        assert!(settings_path().ends_with("settings.json"));
    }
}
