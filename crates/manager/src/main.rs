// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! VJ Bus process manager (vjpm)
//!
//! Foreground daemon that starts, supervises, and restarts the worker
//! fleet. Also a worker itself: it answers `list_workers`, `start_worker`,
//! `stop_worker`, and `restart_worker` on its command channel.
//!
//! Exit codes: 0 clean shutdown, 1 fatal error, 2 configuration error.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Map, Value};
use tracing::{error, info};

use vj_bus::envelope::{AckPayload, EventLevel};
use vj_bus::registry::{Registry, WorkerStatus};
use vj_bus::time::now_millis;
use vj_manager::{Manifest, Supervisor};
use vj_worker::{logging, WorkerBuilder};

const EXIT_FATAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;

/// Supervision cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// VJ Bus process manager
#[derive(Debug, Parser)]
#[command(name = "vjpm", version, about = "Starts and supervises the VJ worker fleet")]
struct Args {
    /// Print the manifest and current status, then exit
    #[arg(long)]
    list: bool,

    /// Print a live status table until interrupted
    #[arg(long)]
    monitor: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let manifest = match Manifest::load() {
        Ok(manifest) => manifest,
        Err(e) => {
            eprintln!("vjpm: invalid manifest: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let Some(state_dir) = vj_bus::env::state_dir() else {
        eprintln!("vjpm: could not determine state directory (set VJ_STATE_DIR or HOME)");
        std::process::exit(EXIT_CONFIG);
    };

    if args.list {
        print_status(&manifest, &state_dir);
        return;
    }

    if args.monitor {
        loop {
            print!("\x1b[2J\x1b[H");
            print_status(&manifest, &state_dir);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = tokio::signal::ctrl_c() => return,
            }
        }
    }

    match run_manager(manifest, state_dir).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("vjpm: fatal: {e}");
            std::process::exit(EXIT_FATAL);
        }
    }
}

async fn run_manager(manifest: Manifest, state_dir: std::path::PathBuf) -> anyhow::Result<i32> {
    let _log_guard = logging::init("process_manager")?;

    let registry = Registry::with_heartbeat_interval(
        state_dir.join("registry"),
        vj_bus::env::heartbeat_interval(),
    )?;
    let generations = vj_manager::GenerationFile::load(state_dir.join("pm_registry.json"))?;
    let supervisor = Arc::new(Supervisor::new(manifest, registry, generations));

    let runtime = {
        let list = Arc::clone(&supervisor);
        let start = Arc::clone(&supervisor);
        let stop = Arc::clone(&supervisor);
        let restart = Arc::clone(&supervisor);
        WorkerBuilder::new("process_manager")
            .handler("list_workers", move |_handle, _command| {
                let reports = list.reports();
                let mut result = Map::new();
                result.insert(
                    "workers".into(),
                    serde_json::to_value(&reports).unwrap_or(Value::Null),
                );
                AckPayload::ok().with_result(result)
            })
            .handler("start_worker", move |_handle, command| {
                let Some(worker) = command.data.get("worker").and_then(Value::as_str) else {
                    return AckPayload::error("missing \"worker\" in command data");
                };
                match start.start_worker(worker) {
                    Ok(report) => {
                        let mut result = Map::new();
                        result.insert("started".into(), json!(true));
                        result.insert("pid".into(), json!(report.pid));
                        result.insert("generation".into(), json!(report.generation));
                        AckPayload::ok().with_result(result)
                    }
                    Err(e) => AckPayload::error(e.to_string()),
                }
            })
            .handler("stop_worker", move |handle, command| {
                let Some(worker) = command.data.get("worker").and_then(Value::as_str) else {
                    return AckPayload::error("missing \"worker\" in command data");
                };
                // Stopping waits out a drain window, so it runs offloaded
                // and completion arrives as an event.
                let supervisor = Arc::clone(&stop);
                let events = handle.clone();
                let worker = worker.to_string();
                tokio::spawn(async move {
                    match supervisor.stop_worker(&worker).await {
                        Ok(()) => events.send_event(
                            EventLevel::Info,
                            "worker_stopped",
                            [("worker".to_string(), json!(worker))].into_iter().collect(),
                        ),
                        Err(e) => events.send_event(
                            EventLevel::Warning,
                            "worker_stop_failed",
                            [
                                ("worker".to_string(), json!(worker)),
                                ("error".to_string(), json!(e.to_string())),
                            ]
                            .into_iter()
                            .collect(),
                        ),
                    }
                });
                AckPayload::pending("stopping")
            })
            .handler("restart_worker", move |handle, command| {
                let Some(worker) = command.data.get("worker").and_then(Value::as_str) else {
                    return AckPayload::error("missing \"worker\" in command data");
                };
                let supervisor = Arc::clone(&restart);
                let events = handle.clone();
                let worker = worker.to_string();
                tokio::spawn(async move {
                    if let Err(e) = supervisor.restart_worker(&worker).await {
                        events.send_event(
                            EventLevel::Warning,
                            "worker_restart_failed",
                            [
                                ("worker".to_string(), json!(worker)),
                                ("error".to_string(), json!(e.to_string())),
                            ]
                            .into_iter()
                            .collect(),
                        );
                    }
                });
                AckPayload::pending("restarting")
            })
            .start()
            .await?
    };

    supervisor.attach_events(runtime.handle());
    supervisor.adopt_running_children();
    supervisor.start_auto();
    info!("process manager running");

    let tick_supervisor = Arc::clone(&supervisor);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            tick_supervisor.tick().await;
        }
    });

    let outcome = runtime.run().await;
    if outcome == vj_worker::RunOutcome::Crashed {
        error!("process manager crashed");
    }
    Ok(outcome.exit_code())
}

/// Print the manifest with live registry status. Works without a running
/// manager; reads only files.
fn print_status(manifest: &Manifest, state_dir: &std::path::Path) {
    let registry = Registry::with_heartbeat_interval(
        state_dir.join("registry"),
        vj_bus::env::heartbeat_interval(),
    )
    .ok();
    let records = registry
        .as_ref()
        .and_then(|r| r.discover(true).ok())
        .unwrap_or_default();

    println!(
        "{:<20} {:<12} {:>8} {:>5} {:>8}  AUTO",
        "WORKER", "STATUS", "PID", "GEN", "AGE"
    );
    for spec in &manifest.workers {
        match records.get(&spec.name) {
            Some(entry) => {
                let stale = registry
                    .as_ref()
                    .map(|r| r.is_stale(entry))
                    .unwrap_or(false);
                let status = if stale && entry.status == WorkerStatus::Running {
                    "unresponsive".to_string()
                } else {
                    format!("{:?}", entry.status).to_lowercase()
                };
                let age_sec = now_millis().saturating_sub(entry.heartbeat_at_ms) / 1000;
                println!(
                    "{:<20} {:<12} {:>8} {:>5} {:>7}s  {}",
                    spec.name,
                    status,
                    entry.pid,
                    entry.generation,
                    age_sec,
                    if spec.auto_start { "yes" } else { "no" }
                );
            }
            None => {
                println!(
                    "{:<20} {:<12} {:>8} {:>5} {:>8}  {}",
                    spec.name,
                    "offline",
                    "-",
                    "-",
                    "-",
                    if spec.auto_start { "yes" } else { "no" }
                );
            }
        }
    }
}
