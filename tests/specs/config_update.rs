//! Seed spec: hot config update changes the counter publish rate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use serial_test::serial;

use crate::prelude::*;

async fn count_for(counter: &Arc<AtomicUsize>, window: Duration) -> usize {
    let before = counter.load(Ordering::SeqCst);
    tokio::time::sleep(window).await;
    counter.load(Ordering::SeqCst) - before
}

#[tokio::test]
#[serial]
async fn set_config_slows_the_counter_stream() {
    let mut env = BusEnv::new();
    env.spawn("vj-example-worker", &[]);
    env.wait_for_worker("example_worker");

    let client = env.client();
    let received = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&received);
    client.subscribe_telemetry("example_worker", Some("counter".into()), move |_envelope| {
        sink.fetch_add(1, Ordering::SeqCst);
    });

    // Default interval is 0.1 s: expect roughly 20 messages in 2 s; UDP is
    // lossy so assert a lower bound only
    assert!(
        wait_until(SPEC_WAIT, || received.load(Ordering::SeqCst) > 0).await,
        "no counter telemetry arrived"
    );
    let fast = count_for(&received, Duration::from_secs(2)).await;
    assert!(fast >= 15, "expected >= 15 messages at 10 Hz, got {fast}");

    // Slow the stream down to 2 Hz
    let mut data = Map::new();
    data.insert("publish_interval".into(), json!(0.5));
    let ack = client
        .send_command(
            "example_worker",
            "set_config",
            data,
            "cfg-slow",
            Duration::from_secs(1),
        )
        .await
        .expect("set_config failed");
    assert_eq!(ack.status, vj_bus::envelope::AckStatus::Ok);
    assert_eq!(ack.applied_config_version, "cfg-slow");

    // Let the in-flight interval drain, then count again
    tokio::time::sleep(Duration::from_millis(600)).await;
    let slow = count_for(&received, Duration::from_secs(3)).await;
    assert!(
        (4..=8).contains(&slow),
        "expected 4-8 messages at 2 Hz over 3 s, got {slow}"
    );

    client.stop().await;
}

#[tokio::test]
#[serial]
async fn get_state_reflects_the_merged_config() {
    let mut env = BusEnv::new();
    env.spawn("vj-example-worker", &[]);
    env.wait_for_worker("example_worker");

    let client = env.client();
    let mut data = Map::new();
    data.insert("publish_interval".into(), json!(0.25));
    client
        .send_command(
            "example_worker",
            "set_config",
            data,
            "cfg-1",
            Duration::from_secs(1),
        )
        .await
        .expect("set_config failed");

    let ack = client
        .send_command(
            "example_worker",
            "get_state",
            Map::new(),
            "",
            Duration::from_secs(1),
        )
        .await
        .expect("get_state failed");
    let result = ack.result.expect("get_state result");
    assert_eq!(result["config"]["publish_interval"], json!(0.25));
    assert_eq!(result["status"], json!("running"));
}
