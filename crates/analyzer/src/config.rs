// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Analyzer configuration, backed by the worker's live config map.

use serde_json::{json, Map, Value};

/// Default capture block size in samples (≈ 11.6 ms at 44.1 kHz).
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Default sample rate requested from the device.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Default destination for the legacy OSC surface.
pub const DEFAULT_OSC_PORT: u16 = 9000;

/// Typed view over the analyzer's config map.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerConfig {
    /// Explicit input device index, wins over name matching.
    pub device_index: Option<usize>,
    /// Preferred device name substring (e.g. a virtual loopback device).
    pub device_name: Option<String>,
    pub sample_rate: u32,
    pub block_size: usize,
    pub osc_host: String,
    pub osc_port: u16,
    /// When false, run degraded: levels + spectrum + bands only.
    pub full_analysis: bool,
    /// Optional WAV file fed at real-time pace instead of a device.
    pub input_wav: Option<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            device_index: None,
            device_name: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            osc_host: "127.0.0.1".into(),
            osc_port: DEFAULT_OSC_PORT,
            full_analysis: true,
            input_wav: None,
        }
    }
}

impl AnalyzerConfig {
    /// Parse from the worker's config map, falling back per key.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let defaults = Self::default();
        AnalyzerConfig {
            device_index: map
                .get("device_index")
                .and_then(Value::as_u64)
                .map(|i| i as usize),
            device_name: map
                .get("device_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            sample_rate: map
                .get("sample_rate")
                .and_then(Value::as_u64)
                .map(|r| r as u32)
                .unwrap_or(defaults.sample_rate),
            block_size: map
                .get("block_size")
                .and_then(Value::as_u64)
                .map(|b| b as usize)
                .filter(|b| *b >= 64 && *b <= 8192)
                .unwrap_or(defaults.block_size),
            osc_host: map
                .get("osc_host")
                .and_then(Value::as_str)
                .unwrap_or(&defaults.osc_host)
                .to_string(),
            osc_port: map
                .get("osc_port")
                .and_then(Value::as_u64)
                .map(|p| p as u16)
                .unwrap_or(defaults.osc_port),
            full_analysis: map
                .get("full_analysis")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.full_analysis),
            input_wav: map
                .get("input_wav")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    /// Default config map registered with the worker runtime.
    pub fn default_map() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("sample_rate".into(), json!(DEFAULT_SAMPLE_RATE));
        map.insert("block_size".into(), json!(DEFAULT_BLOCK_SIZE));
        map.insert("osc_host".into(), json!("127.0.0.1"));
        map.insert("osc_port".into(), json!(DEFAULT_OSC_PORT));
        map.insert("full_analysis".into(), json!(true));
        map
    }

    /// Keys whose changes need a worker restart to take effect. The capture
    /// session and publish sockets are built once at startup.
    pub fn restart_required(updated: &Map<String, Value>) -> bool {
        [
            "device_index",
            "device_name",
            "sample_rate",
            "block_size",
            "input_wav",
            "osc_host",
            "osc_port",
            "full_analysis",
        ]
        .iter()
        .any(|key| updated.contains_key(*key))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
