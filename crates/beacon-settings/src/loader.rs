//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BeaconSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `BEACON_*` environment overrides
//! 4. [`BeaconSettings::validate`]

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::BeaconSettings;

/// `~/.beacon`, falling back to `/tmp/.beacon` when `HOME` is unset.
pub fn beacon_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".beacon")
}

/// Default settings file location (`~/.beacon/settings.json`).
pub fn settings_path() -> PathBuf {
    beacon_home().join("settings.json")
}

/// Resolve a configured path: absolute paths pass through, relative ones
/// land under [`beacon_home`].
pub fn resolve_path(configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        beacon_home().join(path)
    }
}

pub fn load_settings() -> Result<BeaconSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BeaconSettings> {
    let mut settings = load_file_layers(path)?;
    apply_env_overrides(&mut settings);
    settings.validate();
    Ok(settings)
}

fn load_file_layers(path: &Path) -> Result<BeaconSettings> {
    let defaults = serde_json::to_value(BeaconSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key; arrays and primitives in `source` replace the
/// target; nulls in `source` are skipped.
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

pub fn apply_env_overrides(settings: &mut BeaconSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
///
/// Empty and unparseable values are ignored with a warning.
pub fn apply_overrides<F>(settings: &mut BeaconSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("BEACON_PORT") {
        match parse_u16_range(&v, 0, 65535) {
            Some(port) => settings.server.port = port,
            None => warn!(key = "BEACON_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("BEACON_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("BEACON_RADIUS_KM") {
        match parse_positive_f64(&v) {
            Some(radius) => settings.fanout.radius_km = radius,
            None => warn!(key = "BEACON_RADIUS_KM", value = %v, "invalid radius env var, ignoring"),
        }
    }
    if let Some(v) = read("BEACON_PUSH_WEBHOOK_URL") {
        settings.push.webhook_url = Some(v);
    }
    if let Some(v) = read("BEACON_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = read("BEACON_REQUIRE_TOKEN") {
        match parse_bool(&v) {
            Some(b) => settings.auth.require_token = b,
            None => warn!(key = "BEACON_REQUIRE_TOKEN", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read("BEACON_STORE_PATH") {
        settings.store.path = v;
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_positive_f64(val: &str) -> Option<f64> {
    let n: f64 = val.parse().ok()?;
    (n.is_finite() && n > 0.0).then_some(n)
}
