//! Seed spec: crash detection, auto-restart, and transparent resubscribe
//! through the process manager.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Map;
use serial_test::serial;

use crate::prelude::*;
use vj_bus::envelope::Payload;

fn write_manifest(env: &BusEnv) -> std::path::PathBuf {
    let path = env.state_dir().join("manifest.toml");
    let worker_bin = binary_path("vj-example-worker");
    std::fs::write(
        &path,
        format!(
            "[[worker]]\nname = \"example_worker\"\ncommand = \"{}\"\n",
            worker_bin.display()
        ),
    )
    .unwrap();
    path
}

#[tokio::test]
#[serial]
async fn killed_worker_is_detected_and_restarted_with_a_higher_generation() {
    let mut env = BusEnv::new();
    let manifest = write_manifest(&env);

    let mut cmd = env.command("vjpm", &[]);
    cmd.env("VJ_PM_MANIFEST", &manifest);
    let pm_pid = env.spawn_cmd(cmd);

    env.wait_for_worker("process_manager");
    let first = env.wait_for_worker("example_worker");
    assert!(first.generation >= 1);

    // Watch the manager's lifecycle events
    let client = env.client();
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    client.subscribe_events("process_manager", move |envelope| {
        if let Payload::Event(event) = &envelope.payload {
            sink.lock().push(event.message.clone());
        }
    });

    // Let the subscription connect before the crash happens
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Kill the worker the hard way
    signal(first.pid, "-9");

    assert!(
        wait_until(SPEC_WAIT, || {
            let seen = events.lock();
            seen.iter().any(|m| m == "worker_crashed")
                && seen.iter().any(|m| m == "worker_restarted")
        })
        .await,
        "crash/restart events not observed: {:?}",
        events.lock()
    );

    // The restarted worker carries a strictly higher generation and a fresh
    // instance id
    assert!(
        wait_until(SPEC_WAIT, || {
            client
                .discover_workers(false)
                .ok()
                .and_then(|w| w.get("example_worker").cloned())
                .map(|e| e.generation > first.generation && e.instance_id != first.instance_id)
                .unwrap_or(false)
        })
        .await,
        "restarted worker did not register with a new generation"
    );

    client.stop().await;
    signal(pm_pid, "-15");
}

#[tokio::test]
#[serial]
async fn list_workers_reports_the_manifest() {
    let mut env = BusEnv::new();
    let manifest = write_manifest(&env);

    let mut cmd = env.command("vjpm", &[]);
    cmd.env("VJ_PM_MANIFEST", &manifest);
    let pm_pid = env.spawn_cmd(cmd);

    env.wait_for_worker("process_manager");
    env.wait_for_worker("example_worker");

    let client = env.client();
    let ack = client
        .send_command(
            "process_manager",
            "list_workers",
            Map::new(),
            "",
            Duration::from_secs(2),
        )
        .await
        .expect("list_workers failed");

    let result = ack.result.expect("list_workers result");
    let workers = result["workers"].as_array().expect("workers array");
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["name"], serde_json::json!("example_worker"));
    assert_eq!(workers[0]["status"], serde_json::json!("running"));

    signal(pm_pid, "-15");
}
