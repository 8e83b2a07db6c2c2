// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Example VJ Bus worker.
//!
//! Publishes a `counter` telemetry stream at a config-controlled interval
//! and answers the standard command set. Used by the behavioral specs and
//! as the reference for writing new workers.

use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::info;

use vj_worker::config::config_f64;
use vj_worker::{logging, WorkerBuilder, WorkerHandle};

const WORKER_NAME: &str = "example_worker";

/// Default seconds between counter publishes (10 Hz).
const DEFAULT_PUBLISH_INTERVAL: f64 = 0.1;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _log_guard = logging::init(WORKER_NAME)?;

    let mut defaults = Map::new();
    defaults.insert("publish_interval".into(), json!(DEFAULT_PUBLISH_INTERVAL));

    let runtime = WorkerBuilder::new(WORKER_NAME)
        .default_config(defaults)
        // publish_interval is read every tick, so every change hot-applies
        .on_config_change(|_config| false)
        .start()
        .await?;

    info!(pid = std::process::id(), "example worker started");

    let publisher = runtime.handle();
    tokio::spawn(async move {
        publish_loop(publisher).await;
    });

    let outcome = runtime.run().await;
    std::process::exit(outcome.exit_code());
}

/// Publish an incrementing counter until the worker leaves `running`.
async fn publish_loop(handle: WorkerHandle) {
    let mut counter: u64 = 0;
    loop {
        if handle.state().is_terminal() {
            break;
        }

        counter += 1;
        let mut data = Map::new();
        data.insert("counter".into(), json!(counter));
        data.insert("uptime_sec".into(), json!(handle.uptime_sec()));
        handle.publish_telemetry("counter", data);
        handle.set_metric("counter", Value::from(counter));

        let interval = config_f64(&handle.config(), "publish_interval", DEFAULT_PUBLISH_INTERVAL);
        tokio::time::sleep(Duration::from_secs_f64(interval.max(0.01))).await;
    }
}
