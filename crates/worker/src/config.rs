// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker config loading and merging.
//!
//! A worker's live config is a flat JSON object. Defaults come from the
//! worker itself, `VJ_<WORKER>_CONFIG` (a JSON file) overlays them at boot,
//! and `set_config` commands merge-update at runtime.

use serde_json::{Map, Value};
use tracing::warn;

/// Merge `updates` into `config`, replacing existing keys.
pub fn merge_config(config: &mut Map<String, Value>, updates: &Map<String, Value>) {
    for (k, v) in updates {
        config.insert(k.clone(), v.clone());
    }
}

/// Build the initial config for a worker: `defaults` overlaid with the
/// `VJ_<WORKER>_CONFIG` file when present and parseable.
///
/// An unreadable or malformed config file is a warning, not a boot failure;
/// the worker starts on defaults.
pub fn load_initial_config(worker: &str, defaults: Map<String, Value>) -> Map<String, Value> {
    let mut config = defaults;
    let Some(path) = vj_bus::env::worker_config_path(worker) else {
        return config;
    };

    let overlay = std::fs::read(&path)
        .map_err(|e| e.to_string())
        .and_then(|bytes| {
            serde_json::from_slice::<Map<String, Value>>(&bytes).map_err(|e| e.to_string())
        });

    match overlay {
        Ok(overlay) => merge_config(&mut config, &overlay),
        Err(e) => warn!(
            worker,
            path = %path.display(),
            error = %e,
            "ignoring unreadable worker config file"
        ),
    }
    config
}

/// Read a float out of a config map, falling back when absent or mistyped.
pub fn config_f64(config: &Map<String, Value>, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Read a string out of a config map.
pub fn config_str<'a>(config: &'a Map<String, Value>, key: &str, default: &'a str) -> &'a str {
    config.get(key).and_then(Value::as_str).unwrap_or(default)
}

/// Read a bool out of a config map.
pub fn config_bool(config: &Map<String, Value>, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
