//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If `~/.relay/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::RelaySettings;

/// Resolve the path to the settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    crate::relay_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
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

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
///
/// Invalid values are ignored (with a warning) and the file/default value is
/// kept. Booleans accept `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn apply_overrides_from<F>(settings: &mut RelaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64("RELAY_PORT", 0, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.u64("RELAY_IDLE_KEEPALIVE_MS", 100, 600_000) {
        settings.server.idle_keepalive_ms = v;
    }
    if let Some(v) = env.u64("RELAY_DELTA_CHUNK_CHARS", 1, 65_536) {
        settings.server.delta_chunk_chars = v as usize;
    }
    if let Some(v) = env.u64("RELAY_CHANNEL_CAPACITY", 1, 65_536) {
        settings.server.channel_capacity = v as usize;
    }
    if let Some(v) = env.u64("RELAY_CANCEL_GRACE_MS", 0, 60_000) {
        settings.server.cancel_grace_ms = v;
    }

    // ── Memory ──────────────────────────────────────────────────────
    if let Some(v) = env.bool("MEMORY_ENABLED") {
        settings.memory.enabled = v;
    }
    if let Some(v) = env.bool("MEMORY_SESSION_CONTINUITY") {
        settings.memory.session_continuity = v;
    }
    if let Some(v) = env.string("MEMORY_DB_PATH") {
        settings.memory.db_path = v;
    }
    if let Some(v) = env.u64("MEMORY_LIMIT", 0, 10_000) {
        settings.memory.limit = v as usize;
    }
    if let Some(v) = env.u64("MEMORY_MAX_ROWS", 0, 1_000_000) {
        settings.memory.max_rows = v as usize;
    }
    if let Some(v) = env.u64("VACUUM_INTERVAL_HOURS", 1, 24 * 365) {
        settings.memory.vacuum_interval_hours = v;
    }

    // ── Model ───────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_MODEL") {
        settings.model.name = v;
    }
    if let Some(v) = env.string("EMBEDDING_MODEL") {
        settings.model.embedding_model = v;
    }
    if let Some(v) = env.string("RELAY_API_BASE") {
        settings.model.api_base = v;
    }
    if let Some(v) = env.string("RELAY_INSTRUCTIONS") {
        settings.model.instructions = v;
    }
    if let Some(v) = env.string("RELAY_CORPUS_PATH") {
        settings.model.corpus_path = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("RELAY_LOG_PERSIST") {
        settings.logging.persist_warnings = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4, 5]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4, 5]));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_file_layer(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.memory.limit, 10);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"memory": {"maxRows": 5}, "server": {"port": 9001}}"#).unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.memory.max_rows, 5);
        assert_eq!(settings.server.port, 9001);
        assert_eq!(settings.memory.limit, 10);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_file_layer(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn env_overrides_memory_settings() {
        let mut settings = RelaySettings::default();
        apply_overrides_from(
            &mut settings,
            vars(&[
                ("MEMORY_ENABLED", "0"),
                ("MEMORY_LIMIT", "3"),
                ("MEMORY_MAX_ROWS", "5"),
                ("VACUUM_INTERVAL_HOURS", "48"),
                ("EMBEDDING_MODEL", "text-embedding-3-large"),
                ("RELAY_CORPUS_PATH", "/srv/relay/corpus.txt"),
            ]),
        );
        assert!(!settings.memory.enabled);
        assert_eq!(settings.memory.limit, 3);
        assert_eq!(settings.memory.max_rows, 5);
        assert_eq!(settings.memory.vacuum_interval_hours, 48);
        assert_eq!(settings.model.embedding_model, "text-embedding-3-large");
        assert_eq!(settings.model.corpus_path.as_deref(), Some("/srv/relay/corpus.txt"));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = RelaySettings::default();
        apply_overrides_from(
            &mut settings,
            vars(&[
                ("MEMORY_ENABLED", "maybe"),
                ("MEMORY_LIMIT", "ten"),
                ("RELAY_PORT", "70000"),
                ("RELAY_MODEL", ""),
            ]),
        );
        assert!(settings.memory.enabled);
        assert_eq!(settings.memory.limit, 10);
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.model.name, "gpt-5-mini");
    }

    #[test]
    fn env_overrides_server_settings() {
        let mut settings = RelaySettings::default();
        apply_overrides_from(
            &mut settings,
            vars(&[
                ("RELAY_PORT", "0"),
                ("RELAY_IDLE_KEEPALIVE_MS", "500"),
                ("RELAY_DELTA_CHUNK_CHARS", "16"),
            ]),
        );
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.server.idle_keepalive_ms, 500);
        assert_eq!(settings.server.delta_chunk_chars, 16);
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for v in ["true", "1", "YES", " on "] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "No", "off"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn parse_u64_range_bounds() {
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
        assert_eq!(parse_u64_range("0", 1, 10), None);
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
    }
}
