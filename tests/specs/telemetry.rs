//! Seed spec: telemetry is lossy but ordered, and slow subscribers never
//! hold the publisher back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use serial_test::serial;

use crate::prelude::*;
use vj_worker::WorkerBuilder;

#[tokio::test]
#[serial]
async fn a_slow_subscriber_receives_a_subset_in_order() {
    let _env = BusEnv::new();
    let runtime = WorkerBuilder::new("burst_source").start().await.unwrap();
    let handle = runtime.handle();

    let client = vj_client::BusClient::new("spec_client").unwrap();
    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client.subscribe_telemetry("burst_source", Some("features".into()), move |envelope| {
        sink.lock().push(envelope.sequence);
        // A handler that dawdles: the publisher must not care
        std::thread::sleep(Duration::from_millis(2));
    });

    assert!(
        wait_until(Duration::from_secs(3), || {
            handle.publish_telemetry(
                "features",
                [("probe".to_string(), json!(true))].into_iter().collect(),
            );
            !seen.lock().is_empty()
        })
        .await,
        "subscription never became live"
    );

    // Publish a 1000-envelope burst and measure the publish side
    let started = Instant::now();
    for i in 0..1000u32 {
        handle.publish_telemetry(
            "features",
            [("i".to_string(), json!(i))].into_iter().collect(),
        );
    }
    let publish_elapsed = started.elapsed();
    assert!(
        publish_elapsed < Duration::from_secs(1),
        "publishing 1000 envelopes took {publish_elapsed:?}; the slow subscriber blocked the publisher"
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    let sequences = seen.lock().clone();
    assert!(!sequences.is_empty());
    assert!(
        sequences.windows(2).all(|w| w[0] < w[1]),
        "telemetry arrived out of order"
    );

    client.stop().await;
}
