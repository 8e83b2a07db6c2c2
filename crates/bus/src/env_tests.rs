// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Environment resolution unit tests

use std::time::Duration;

use super::*;
use serial_test::serial;

#[test]
#[serial]
fn state_dir_prefers_vj_state_dir() {
    std::env::set_var("VJ_STATE_DIR", "/tmp/vj-test-state");
    assert_eq!(
        state_dir(),
        Some(std::path::PathBuf::from("/tmp/vj-test-state"))
    );
    std::env::remove_var("VJ_STATE_DIR");
}

#[test]
#[serial]
fn state_dir_falls_back_to_xdg_then_home() {
    std::env::remove_var("VJ_STATE_DIR");
    std::env::set_var("XDG_STATE_HOME", "/tmp/xdg-state");
    assert_eq!(
        state_dir(),
        Some(std::path::PathBuf::from("/tmp/xdg-state/vj"))
    );

    std::env::remove_var("XDG_STATE_HOME");
    std::env::set_var("HOME", "/home/vjtest");
    assert_eq!(
        state_dir(),
        Some(std::path::PathBuf::from("/home/vjtest/.local/state/vj"))
    );
}

#[test]
#[serial]
fn log_dir_defaults_under_state_dir() {
    std::env::remove_var("VJ_LOG_DIR");
    std::env::set_var("VJ_STATE_DIR", "/tmp/vj-s");
    assert_eq!(log_dir(), Some(std::path::PathBuf::from("/tmp/vj-s/logs")));

    std::env::set_var("VJ_LOG_DIR", "/var/log/vj");
    assert_eq!(log_dir(), Some(std::path::PathBuf::from("/var/log/vj")));
    std::env::remove_var("VJ_LOG_DIR");
    std::env::remove_var("VJ_STATE_DIR");
}

#[test]
#[serial]
fn worker_config_path_maps_name_to_env_key() {
    std::env::set_var("VJ_AUDIO_ANALYZER_CONFIG", "/etc/vj/analyzer.json");
    assert_eq!(
        worker_config_path("audio_analyzer"),
        Some(std::path::PathBuf::from("/etc/vj/analyzer.json"))
    );
    assert_eq!(worker_config_path("lyrics-fetcher"), None);
    std::env::remove_var("VJ_AUDIO_ANALYZER_CONFIG");
}

#[test]
#[serial]
fn generation_and_instance_id_default_when_unset() {
    std::env::remove_var("VJ_GENERATION");
    std::env::remove_var("VJ_INSTANCE_ID");
    assert_eq!(generation(), 0);
    assert_eq!(instance_id(), None);

    std::env::set_var("VJ_GENERATION", "7");
    std::env::set_var("VJ_INSTANCE_ID", "pm-assigned");
    assert_eq!(generation(), 7);
    assert_eq!(instance_id(), Some("pm-assigned".into()));
    std::env::remove_var("VJ_GENERATION");
    std::env::remove_var("VJ_INSTANCE_ID");
}

#[test]
#[serial]
fn heartbeat_interval_is_tunable_for_tests() {
    std::env::remove_var("VJ_HEARTBEAT_MS");
    assert_eq!(heartbeat_interval(), Duration::from_secs(1));

    std::env::set_var("VJ_HEARTBEAT_MS", "100");
    assert_eq!(heartbeat_interval(), Duration::from_millis(100));
    std::env::remove_var("VJ_HEARTBEAT_MS");
}
