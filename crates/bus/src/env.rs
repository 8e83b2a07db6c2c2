// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Environment variable resolution for bus-wide paths and tuning knobs.
//!
//! Every variable has an OS-appropriate default so a worker started by hand
//! behaves the same as one started by the process manager.

use std::path::PathBuf;
use std::time::Duration;

/// Root state directory for the bus.
///
/// `VJ_STATE_DIR` takes priority (used by tests for isolation), then
/// `$XDG_STATE_HOME/vj`, then `~/.local/state/vj`.
pub fn state_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("VJ_STATE_DIR") {
        return Some(PathBuf::from(dir));
    }

    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return Some(PathBuf::from(xdg).join("vj"));
    }

    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".local/state/vj"))
}

/// Per-worker log directory. `VJ_LOG_DIR` or `<state_dir>/logs`.
pub fn log_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("VJ_LOG_DIR") {
        return Some(PathBuf::from(dir));
    }
    state_dir().map(|d| d.join("logs"))
}

/// Registry directory under the state dir.
pub fn registry_dir() -> Option<PathBuf> {
    state_dir().map(|d| d.join("registry"))
}

/// Optional per-worker config file path from `VJ_<WORKER>_CONFIG`.
///
/// The worker name is upper-cased with non-alphanumerics mapped to `_`,
/// so `audio_analyzer` reads `VJ_AUDIO_ANALYZER_CONFIG`.
pub fn worker_config_path(worker: &str) -> Option<PathBuf> {
    let key: String = worker
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    std::env::var(format!("VJ_{key}_CONFIG"))
        .ok()
        .map(PathBuf::from)
}

/// Generation assigned by the process manager, 0 when started standalone.
pub fn generation() -> u64 {
    std::env::var("VJ_GENERATION")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Instance id assigned by the process manager, if any.
pub fn instance_id() -> Option<String> {
    std::env::var("VJ_INSTANCE_ID").ok().filter(|s| !s.is_empty())
}

fn parse_duration_ms(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Heartbeat interval (default 1 s, `VJ_HEARTBEAT_MS` for tests).
pub fn heartbeat_interval() -> Duration {
    parse_duration_ms("VJ_HEARTBEAT_MS").unwrap_or(Duration::from_secs(1))
}

/// Timeout for a single command round-trip (default 5 s).
pub fn timeout_ipc() -> Duration {
    parse_duration_ms("VJ_TIMEOUT_IPC_MS").unwrap_or(Duration::from_secs(5))
}

/// Polling interval for connection retries (default 50 ms).
pub fn poll_interval() -> Duration {
    parse_duration_ms("VJ_CONNECT_POLL_MS").unwrap_or(Duration::from_millis(50))
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
