//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with [`BeaconSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `BEACON_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Merge rules: objects merge per key, arrays and scalars are replaced,
//! nulls in the file are skipped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{BeaconSettings, BrokerBackend};

/// Settings file location: `$BEACON_CONFIG`, else `~/.beacon/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = read_env_string("BEACON_CONFIG") {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".beacon").join("settings.json")
}

/// Load settings from `path`, apply env overrides, validate.
///
/// A missing file yields defaults; unreadable or invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BeaconSettings> {
    let defaults = serde_json::to_value(BeaconSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let file: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, file)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: BeaconSettings = serde_json::from_value(merged)?;
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
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `BEACON_*` environment overrides. Invalid values are ignored
/// with a warning.
pub fn apply_env_overrides(settings: &mut BeaconSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("BEACON_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("BEACON_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_usize("BEACON_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = read_env_usize("BEACON_MIN_USER_ID_LENGTH", 1, 256) {
        settings.server.min_user_id_length = v;
    }

    // ── Broker ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("BEACON_BROKER_URL") {
        settings.broker.url = v;
    }
    if let Some(v) = read_env_string("BEACON_BROKER_BACKEND") {
        match parse_backend(&v) {
            Some(backend) => settings.broker.backend = backend,
            None => warn!(key = "BEACON_BROKER_BACKEND", value = %v, "unknown broker backend, ignoring"),
        }
    }
    if let Some(v) = read_env_u64("BEACON_BROKER_READY_TIMEOUT_MS", 100, 120_000) {
        settings.broker.ready_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("BEACON_QUEUE_TTL_HOURS", 1, 24 * 90) {
        settings.broker.queue_ttl_hours = v;
    }

    // ── Store / dispatch / logging ──────────────────────────────────
    if let Some(v) = read_env_string("BEACON_DB_PATH") {
        settings.store.path = v;
    }
    if let Some(v) = read_env_u64("BEACON_DEDUP_WINDOW_SECS", 0, 3600) {
        settings.dispatch.dedup_window_secs = v;
    }
    if let Some(v) = read_env_string("BEACON_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("BEACON_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a boolean: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u16` within `min..=max`.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `u64` within `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `usize` within `min..=max`.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a broker backend name.
pub fn parse_backend(val: &str) -> Option<BrokerBackend> {
    match val.to_lowercase().as_str() {
        "amqp" | "rabbitmq" => Some(BrokerBackend::Amqp),
        "memory" => Some(BrokerBackend::Memory),
        _ => None,
    }
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
