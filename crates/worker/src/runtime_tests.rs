// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker runtime integration-style tests.
//!
//! Each test isolates its registry through `VJ_STATE_DIR`, so they run
//! serially.

use std::time::Duration;

use serde_json::{json, Map, Value};
use serial_test::serial;
use tokio::net::TcpStream;

use super::*;
use vj_bus::envelope::AckStatus;
use vj_bus::registry::WorkerStatus;

const TEST_TIMEOUT: Duration = Duration::from_secs(2);

fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

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

async fn send_command(endpoint: &str, verb: &str, config_version: &str, data: Map<String, Value>) -> Envelope {
    let addr = vj_bus::endpoint::parse(endpoint).unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let command = Envelope::new(
        "test_client",
        "client-inst",
        0,
        1,
        Payload::Command(CommandPayload {
            verb: verb.into(),
            config_version: config_version.into(),
            data,
        }),
    );
    write_envelope(&mut stream, &command, TEST_TIMEOUT)
        .await
        .unwrap();
    read_envelope(&mut stream, TEST_TIMEOUT).await.unwrap()
}

fn expect_ack(envelope: &Envelope) -> &AckPayload {
    match &envelope.payload {
        Payload::Ack(ack) => ack,
        other => panic!("expected ack, got {:?}", other.kind()),
    }
}

#[tokio::test]
#[serial]
async fn start_registers_worker_as_running() {
    let _guard = isolated_state_dir();
    let runtime = WorkerBuilder::new("reg_worker").start().await.unwrap();

    let entry = runtime.registry_entry();
    assert_eq!(entry.worker, "reg_worker");
    assert_eq!(entry.pid, std::process::id());
    assert!(entry.command_endpoint.starts_with("tcp://127.0.0.1:"));
    assert!(entry.telemetry_endpoint.starts_with("udp://127.0.0.1:"));
    assert!(entry.event_endpoint.starts_with("tcp://127.0.0.1:"));

    // The registry row reflects the running transition
    let registry = Registry::open(vj_bus::env::registry_dir().unwrap()).unwrap();
    let row = registry.get("reg_worker").unwrap().unwrap();
    assert_eq!(row.status, WorkerStatus::Running);
    assert_eq!(runtime.handle().state(), WorkerState::Running);
}

#[tokio::test]
#[serial]
async fn health_check_reports_alive_with_uptime() {
    let _guard = isolated_state_dir();
    let runtime = WorkerBuilder::new("health_worker").start().await.unwrap();

    let reply = send_command(
        &runtime.registry_entry().command_endpoint,
        "health_check",
        "",
        Map::new(),
    )
    .await;

    let ack = expect_ack(&reply);
    assert_eq!(ack.status, AckStatus::Ok);
    let result = ack.result.as_ref().unwrap();
    assert_eq!(result["alive"], json!(true));
    assert!(result["uptime_sec"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
#[serial]
async fn unknown_verb_returns_error_ack() {
    let _guard = isolated_state_dir();
    let runtime = WorkerBuilder::new("verb_worker").start().await.unwrap();

    let reply = send_command(
        &runtime.registry_entry().command_endpoint,
        "teleport",
        "",
        Map::new(),
    )
    .await;

    let ack = expect_ack(&reply);
    assert_eq!(ack.status, AckStatus::Error);
    assert!(ack.message.contains("unknown verb"));
}

#[tokio::test]
#[serial]
async fn set_config_merges_and_echoes_config_version() {
    let _guard = isolated_state_dir();
    let runtime = WorkerBuilder::new("cfg_worker")
        .default_config(map(&[("publish_interval", json!(0.1))]))
        .start()
        .await
        .unwrap();

    let reply = send_command(
        &runtime.registry_entry().command_endpoint,
        "set_config",
        "cfg-2",
        map(&[("publish_interval", json!(0.5))]),
    )
    .await;

    let ack = expect_ack(&reply);
    assert_eq!(ack.status, AckStatus::Ok);
    assert_eq!(ack.applied_config_version, "cfg-2");
    assert_eq!(
        runtime.handle().config()["publish_interval"],
        json!(0.5)
    );

    // get_state returns the merged config
    let reply = send_command(
        &runtime.registry_entry().command_endpoint,
        "get_state",
        "",
        Map::new(),
    )
    .await;
    let ack = expect_ack(&reply);
    let result = ack.result.as_ref().unwrap();
    assert_eq!(result["config"]["publish_interval"], json!(0.5));
    assert_eq!(result["status"], json!("running"));
}

#[tokio::test]
#[serial]
async fn set_config_reports_restart_required_from_callback() {
    let _guard = isolated_state_dir();
    let runtime = WorkerBuilder::new("restart_cfg_worker")
        .on_config_change(|config| config.contains_key("device_index"))
        .start()
        .await
        .unwrap();

    let reply = send_command(
        &runtime.registry_entry().command_endpoint,
        "set_config",
        "cfg-3",
        map(&[("device_index", json!(2))]),
    )
    .await;

    let ack = expect_ack(&reply);
    assert_eq!(ack.result.as_ref().unwrap()["restart_required"], json!(true));
}

#[tokio::test]
#[serial]
async fn custom_handler_wins_and_panics_become_error_acks() {
    let _guard = isolated_state_dir();
    let runtime = WorkerBuilder::new("handler_worker")
        .handler("echo", |_handle, command| {
            let mut result = Map::new();
            result.insert("echoed".into(), Value::Object(command.data.clone()));
            AckPayload::ok().with_result(result)
        })
        .handler("explode", |_handle, _command| panic!("boom"))
        .start()
        .await
        .unwrap();

    let endpoint = runtime.registry_entry().command_endpoint.clone();

    let reply = send_command(&endpoint, "echo", "", map(&[("x", json!(1))])).await;
    let ack = expect_ack(&reply);
    assert_eq!(ack.status, AckStatus::Ok);
    assert_eq!(ack.result.as_ref().unwrap()["echoed"]["x"], json!(1));

    // A panicking handler does not take the worker down
    let reply = send_command(&endpoint, "explode", "", Map::new()).await;
    assert_eq!(expect_ack(&reply).status, AckStatus::Error);

    let reply = send_command(&endpoint, "health_check", "", Map::new()).await;
    assert_eq!(expect_ack(&reply).status, AckStatus::Ok);
}

#[tokio::test]
#[serial]
async fn event_subscribers_see_lifecycle_and_sequences_are_monotonic() {
    let _guard = isolated_state_dir();
    let runtime = WorkerBuilder::new("event_worker").start().await.unwrap();
    let handle = runtime.handle();

    let addr = vj_bus::endpoint::parse(&runtime.registry_entry().event_endpoint).unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    // Give the accept loop a beat to subscribe this connection to the ring
    tokio::time::sleep(Duration::from_millis(150)).await;

    handle.send_event(EventLevel::Info, "first", Map::new());
    handle.send_event(EventLevel::Warning, "second", Map::new());

    let mut sequences = Vec::new();
    for _ in 0..2 {
        let envelope = read_envelope(&mut stream, TEST_TIMEOUT).await.unwrap();
        assert_eq!(envelope.worker, "event_worker");
        sequences.push(envelope.sequence);
    }
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
#[serial]
async fn telemetry_arrives_on_the_published_endpoint() {
    let _guard = isolated_state_dir();
    let runtime = WorkerBuilder::new("telemetry_worker").start().await.unwrap();
    let handle = runtime.handle();

    let addr = vj_bus::endpoint::parse(&runtime.registry_entry().telemetry_endpoint).unwrap();
    let socket = tokio::net::UdpSocket::bind(addr).await.unwrap();

    handle.publish_telemetry("counter", map(&[("counter", json!(1))]));

    let mut buf = vec![0u8; 65536];
    let len = tokio::time::timeout(TEST_TIMEOUT, socket.recv(&mut buf))
        .await
        .expect("telemetry datagram")
        .unwrap();
    let envelope = Envelope::decode(&buf[..len]).unwrap();
    match envelope.payload {
        Payload::Telemetry(telemetry) => {
            assert_eq!(telemetry.stream, "counter");
            assert_eq!(telemetry.data["counter"], json!(1));
        }
        other => panic!("expected telemetry, got {:?}", other.kind()),
    }
}

#[tokio::test]
#[serial]
async fn shutdown_command_drains_and_unregisters() {
    let _guard = isolated_state_dir();
    let runtime = WorkerBuilder::new("stop_worker").start().await.unwrap();
    let endpoint = runtime.registry_entry().command_endpoint.clone();

    let run_task = tokio::spawn(runtime.run());

    let reply = send_command(&endpoint, "shutdown", "", Map::new()).await;
    assert_eq!(expect_ack(&reply).status, AckStatus::Ok);

    let outcome = tokio::time::timeout(Duration::from_secs(10), run_task)
        .await
        .expect("run returned")
        .unwrap();
    assert_eq!(outcome, RunOutcome::Shutdown);
    assert_eq!(outcome.exit_code(), 0);

    let registry = Registry::open(vj_bus::env::registry_dir().unwrap()).unwrap();
    assert!(registry.get("stop_worker").unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn restart_command_maps_to_restart_exit_code() {
    let _guard = isolated_state_dir();
    let runtime = WorkerBuilder::new("restart_worker").start().await.unwrap();
    let endpoint = runtime.registry_entry().command_endpoint.clone();

    let run_task = tokio::spawn(runtime.run());
    send_command(&endpoint, "restart", "", Map::new()).await;

    let outcome = tokio::time::timeout(Duration::from_secs(10), run_task)
        .await
        .expect("run returned")
        .unwrap();
    assert_eq!(outcome, RunOutcome::Restart);
    assert_eq!(outcome.exit_code(), RESTART_EXIT_CODE);
}

#[tokio::test]
#[serial]
async fn heartbeat_refreshes_registry_row() {
    let _guard = isolated_state_dir();
    let runtime = WorkerBuilder::new("hb_worker")
        .heartbeat_interval(Duration::from_millis(20))
        .start()
        .await
        .unwrap();
    let handle = runtime.handle();
    handle.set_metric("frames", json!(7));

    let registry = Registry::open(vj_bus::env::registry_dir().unwrap()).unwrap();
    let before = registry.get("hb_worker").unwrap().unwrap().heartbeat_at_ms;

    tokio::time::sleep(Duration::from_millis(120)).await;

    let after = registry.get("hb_worker").unwrap().unwrap();
    assert!(after.heartbeat_at_ms >= before);
    assert_eq!(after.metadata["frames"], json!(7));
}
