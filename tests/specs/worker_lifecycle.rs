//! Seed spec: echo health check against the shipped example worker.

use std::time::{Duration, Instant};

use serde_json::Map;
use serial_test::serial;

use crate::prelude::*;

#[tokio::test]
#[serial]
async fn example_worker_answers_health_check_quickly() {
    let mut env = BusEnv::new();
    env.spawn("vj-example-worker", &[]);
    env.wait_for_worker("example_worker");

    let client = env.client();
    let started = Instant::now();
    let ack = client
        .send_command(
            "example_worker",
            "health_check",
            Map::new(),
            "",
            Duration::from_secs(1),
        )
        .await
        .expect("health check failed");
    let elapsed = started.elapsed();

    assert_eq!(ack.status, vj_bus::envelope::AckStatus::Ok);
    let result = ack.result.expect("health_check result");
    assert_eq!(result["alive"], serde_json::json!(true));
    assert!(result["uptime_sec"].as_f64().unwrap() > 0.0);
    assert!(elapsed < Duration::from_millis(200), "took {elapsed:?}");
}

#[tokio::test]
#[serial]
async fn shutdown_command_exits_cleanly_and_unregisters() {
    let mut env = BusEnv::new();
    let pid = env.spawn("vj-example-worker", &[]);
    env.wait_for_worker("example_worker");

    let client = env.client();
    let ack = client
        .send_command(
            "example_worker",
            "shutdown",
            Map::new(),
            "",
            Duration::from_secs(1),
        )
        .await
        .expect("shutdown command failed");
    assert_eq!(ack.status, vj_bus::envelope::AckStatus::Ok);

    assert!(
        wait_until(SPEC_WAIT, || !pid_alive(pid)).await,
        "worker did not exit"
    );
    assert!(
        wait_until(SPEC_WAIT, || {
            client
                .discover_workers(true)
                .map(|w| !w.contains_key("example_worker"))
                .unwrap_or(false)
        })
        .await,
        "registry entry was not removed"
    );
}
