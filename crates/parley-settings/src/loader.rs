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
use crate::types::ParleySettings;

/// Resolve the path to the settings file (`~/.parley/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a combination rejected by
/// [`ParleySettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    let defaults = serde_json::to_value(ParleySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ParleySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
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

/// Apply `PARLEY_*` environment variable overrides.
///
/// Out-of-range or unparseable values are logged and ignored.
pub fn apply_env_overrides(settings: &mut ParleySettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("PARLEY_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_u64("PARLEY_HEARTBEAT_INTERVAL_SECS", 1, 3_600) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = read_env_u64("PARLEY_HEARTBEAT_TIMEOUT_SECS", 1, 86_400) {
        settings.server.heartbeat_timeout_secs = v;
    }

    // ── Pipeline ────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("PARLEY_HISTORY_LIMIT", 1, 10_000) {
        settings.pipeline.history_limit = v;
    }
    if let Some(v) = read_env_usize("PARLEY_PLANNER_WINDOW", 1, 1_000) {
        settings.pipeline.planner_window = v;
    }
    if let Some(v) = read_env_u64("PARLEY_PLANNER_TIMEOUT_MS", 0, 600_000) {
        settings.pipeline.planner_timeout_ms = v;
    }

    // ── Client ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("PARLEY_URL") {
        settings.client.url = v;
    }
    if let Some(v) = read_env_u32("PARLEY_MAX_RECONNECT_ATTEMPTS", 0, 1_000) {
        settings.client.max_reconnect_attempts = v;
    }

    // ── LLM ─────────────────────────────────────────────────────────
    if let Some(v) = read_env_string("PARLEY_PLANNER_MODEL") {
        settings.llm.planner_model = v;
    }
    if let Some(v) = read_env_string("PARLEY_EXECUTOR_MODEL") {
        settings.llm.executor_model = v;
    }

    // ── Telemetry ───────────────────────────────────────────────────
    if let Some(v) = read_env_string("PARLEY_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = read_env_bool("PARLEY_LOG_JSON") {
        settings.telemetry.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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

/// Parse a string as a number within an inclusive range.
pub fn parse_in_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

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

fn read_env_ranged<T>(name: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let val = std::env::var(name).ok()?;
    let result = parse_in_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    read_env_ranged(name, min, max)
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    read_env_ranged(name, min, max)
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    read_env_ranged(name, min, max)
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    read_env_ranged(name, min, max)
}
