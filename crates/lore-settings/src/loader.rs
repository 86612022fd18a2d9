//! Settings loading.
//!
//! 1. Compiled [`LoreSettings::default()`]
//! 2. `~/.lore/settings.json` deep-merged over the defaults
//! 3. `LORE_*` environment variables
//!
//! Objects merge per key, arrays and scalars are replaced, and `null` in the
//! file keeps the default.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::LoreSettings;

/// `~/.lore`.
pub fn lore_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".lore")
}

pub fn settings_path() -> PathBuf {
    lore_home().join("settings.json")
}

pub fn load_settings() -> Result<LoreSettings> {
    load_settings_from_path(&settings_path())
}

/// Missing file means defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LoreSettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<LoreSettings> {
    let defaults = serde_json::to_value(LoreSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings file");
        let user: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "no settings file, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

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
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `LORE_*` overrides read through `lookup`. Out-of-range or
/// unparsable values are ignored with a warning.
pub fn apply_overrides(settings: &mut LoreSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = Env { lookup };

    if let Some(v) = env.ranged("LORE_PAGE_SIZE", 1u32, 1_000) {
        settings.crawler.page_size = v;
    }
    if let Some(v) = env.ranged("LORE_MAX_CONCURRENT_ROOMS", 1usize, 64) {
        settings.crawler.max_concurrent_rooms = v;
    }
    if let Some(v) = env.ranged("LORE_MAX_FAILURES", 1u32, 100) {
        settings.crawler.max_failures = v;
    }
    if let Some(v) = env.ranged("LORE_STEP_INTERVAL_MS", 0u64, 3_600_000) {
        settings.crawler.step_interval_ms = v;
    }
    if let Some(v) = env.ranged("LORE_REQUEST_TIMEOUT_MS", 100u64, 600_000) {
        settings.crawler.request_timeout_ms = v;
        settings.bridge.request_timeout_ms = v;
    }
    if let Some(v) = env.string("LORE_HOST") {
        settings.bridge.host = v;
    }
    if let Some(v) = env.ranged("LORE_PORT", 1u16, 65_535) {
        settings.bridge.port = v;
    }
    if let Some(v) = env.string("LORE_INDEX_DB") {
        settings.index.db_path = v;
    }
    if let Some(v) = env.string("LORE_HOMESERVER") {
        settings.matrix.homeserver_url = Some(v);
    }
    if let Some(v) = env.string("LORE_ACCESS_TOKEN") {
        settings.matrix.access_token = Some(v);
    }
    if let Some(v) = env.string("LORE_LOG_LEVEL") {
        settings.telemetry.level = v;
    }
    if let Some(v) = env.flag("LORE_LOG_TO_SQLITE") {
        settings.telemetry.log_to_sqlite = v;
    }
}

/// Accepts `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_range<T: std::str::FromStr + PartialOrd>(val: &str, min: T, max: T) -> Option<T> {
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn flag(&self, name: &str) -> Option<bool> {
        let raw = self.string(name)?;
        let parsed = parse_bool(&raw);
        if parsed.is_none() {
            warn!(key = name, value = %raw, "invalid boolean env var, ignoring");
        }
        parsed
    }

    fn ranged<T: std::str::FromStr + PartialOrd>(&self, name: &str, min: T, max: T) -> Option<T> {
        let raw = self.string(name)?;
        let parsed = parse_range(&raw, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %raw, "out-of-range env var, ignoring");
        }
        parsed
    }
}
