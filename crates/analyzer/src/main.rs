// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Audio analyzer worker binary.

use clap::Parser;
use tracing::info;

use vj_analyzer::analyzer::{default_config, AnalyzerWorker};
use vj_analyzer::config::AnalyzerConfig;
use vj_analyzer::device::list_input_devices;
use vj_worker::{logging, WorkerBuilder};

const WORKER_NAME: &str = "audio_analyzer";

/// Real-time audio analysis worker
#[derive(Debug, Parser)]
#[command(name = "vj-analyzer", version, about)]
struct Args {
    /// Feed a WAV file at real-time pace instead of capturing a device
    #[arg(long)]
    input_wav: Option<String>,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.list_devices {
        let devices = list_input_devices();
        if devices.is_empty() {
            println!("no input devices found");
        }
        for (index, name) in devices.iter().enumerate() {
            println!("{index}: {name}");
        }
        return Ok(());
    }

    let _log_guard = logging::init(WORKER_NAME)?;

    let runtime = WorkerBuilder::new(WORKER_NAME)
        .default_config(default_config(args.input_wav.as_deref()))
        .on_config_change(AnalyzerConfig::restart_required)
        .start()
        .await?;

    info!(pid = std::process::id(), "audio analyzer started");

    let pipeline_handle = runtime.handle();
    tokio::spawn(async move {
        AnalyzerWorker::run(pipeline_handle).await;
    });

    let outcome = runtime.run().await;
    std::process::exit(outcome.exit_code());
}
