// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client command-path tests against a real worker runtime.

use std::time::Duration;

use serde_json::{json, Map};
use serial_test::serial;

use super::*;
use vj_bus::envelope::AckStatus;
use vj_worker::WorkerBuilder;

struct StateDirGuard(tempfile::TempDir);

fn isolated_state_dir() -> StateDirGuard {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("VJ_STATE_DIR", dir.path());
    StateDirGuard(dir)
}

impl Drop for StateDirGuard {
    fn drop(&mut self) {
        std::env::remove_var("VJ_STATE_DIR");
    }
}

fn client() -> BusClient {
    BusClient::new("test_tui").unwrap()
}

#[tokio::test]
#[serial]
async fn discover_sees_running_workers() {
    let _guard = isolated_state_dir();
    let _runtime = WorkerBuilder::new("discover_me").start().await.unwrap();

    let workers = client().discover_workers(false).unwrap();
    assert!(workers.contains_key("discover_me"));
}

#[tokio::test]
#[serial]
async fn health_check_round_trip() {
    let _guard = isolated_state_dir();
    let _runtime = WorkerBuilder::new("hc_worker").start().await.unwrap();

    let ack = client()
        .send_command(
            "hc_worker",
            "health_check",
            Map::new(),
            "",
            Duration::from_millis(500),
        )
        .await
        .unwrap();

    assert_eq!(ack.status, AckStatus::Ok);
    assert_eq!(ack.result.as_ref().unwrap()["alive"], json!(true));
}

#[tokio::test]
#[serial]
async fn unknown_worker_is_not_found() {
    let _guard = isolated_state_dir();

    match client()
        .send_command("ghost", "health_check", Map::new(), "", Duration::from_secs(1))
        .await
    {
        Err(ClientError::NotFound(worker)) => assert_eq!(worker, "ghost"),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn zero_timeout_short_circuits() {
    let _guard = isolated_state_dir();
    let _runtime = WorkerBuilder::new("zt_worker").start().await.unwrap();

    match client()
        .send_command("zt_worker", "health_check", Map::new(), "", Duration::ZERO)
        .await
    {
        Err(ClientError::Timeout(_)) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn application_errors_are_returned_not_retried() {
    let _guard = isolated_state_dir();
    let _runtime = WorkerBuilder::new("err_worker").start().await.unwrap();

    let ack = client()
        .send_command(
            "err_worker",
            "no_such_verb",
            Map::new(),
            "",
            Duration::from_millis(500),
        )
        .await
        .unwrap();

    assert_eq!(ack.status, AckStatus::Error);
    assert!(ack.message.contains("unknown verb"));
}

#[tokio::test]
#[serial]
async fn set_config_ack_echoes_version() {
    let _guard = isolated_state_dir();
    let _runtime = WorkerBuilder::new("cfg_echo_worker").start().await.unwrap();

    let mut data = Map::new();
    data.insert("publish_interval".into(), json!(0.5));
    let ack = client()
        .send_command(
            "cfg_echo_worker",
            "set_config",
            data,
            "cfg-v9",
            Duration::from_millis(500),
        )
        .await
        .unwrap();

    assert_eq!(ack.status, AckStatus::Ok);
    assert_eq!(ack.applied_config_version, "cfg-v9");
}

#[tokio::test]
#[serial]
async fn stale_entries_count_as_not_found() {
    let _guard = isolated_state_dir();
    std::env::set_var("VJ_HEARTBEAT_MS", "10");

    // A registry row whose heartbeat is ancient
    let registry = vj_bus::Registry::with_heartbeat_interval(
        vj_bus::env::registry_dir().unwrap(),
        Duration::from_millis(10),
    )
    .unwrap();
    registry
        .register(vj_bus::RegistryEntry {
            worker: "stale_one".into(),
            instance_id: "old".into(),
            generation: 0,
            pid: 1,
            command_endpoint: "tcp://127.0.0.1:1".into(),
            telemetry_endpoint: "udp://127.0.0.1:2".into(),
            event_endpoint: "tcp://127.0.0.1:3".into(),
            started_at_ms: 0,
            heartbeat_at_ms: 0,
            status: vj_bus::WorkerStatus::Running,
            metadata: Map::new(),
        })
        .unwrap();

    let result = client()
        .send_command("stale_one", "health_check", Map::new(), "", Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(ClientError::NotFound(_))));
    std::env::remove_var("VJ_HEARTBEAT_MS");
}
