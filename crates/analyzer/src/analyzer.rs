// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Analyzer wiring: capture session lifecycle, analysis thread, watchdog.
//!
//! One capture thread, one analysis thread, one publish path. The watchdog
//! restarts capture when no block arrives for two seconds, falling back to
//! the default device; three consecutive dead sessions crash the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use vj_bus::envelope::EventLevel;
use vj_worker::WorkerHandle;

use crate::capture::{
    block_queues, start_device_capture, AnalysisQueues, CaptureError, CaptureMeta, CaptureShared,
    CaptureThread,
};
use crate::config::AnalyzerConfig;
use crate::device::DeviceSelection;
use crate::dsp::FeatureExtractor;
use crate::osc::{feature_telemetry, OscSender};
use crate::synthetic::start_wav_capture;

/// No block for this long means the capture source stalled.
const STALL_AFTER_MS: u64 = 2_000;

/// Dead sessions tolerated before the worker crashes.
const MAX_SESSION_FAILURES: u32 = 3;

/// Watchdog poll cadence.
const WATCHDOG_POLL: Duration = Duration::from_millis(250);

/// Telemetry stream name for the per-frame feature set.
pub const FEATURES_STREAM: &str = "features";

/// Metrics are refreshed in the registry heartbeat every this many frames.
const METRICS_EVERY_FRAMES: u64 = 30;

pub struct AnalyzerWorker;

impl AnalyzerWorker {
    /// Run the capture/analysis pipeline until the worker shuts down.
    pub async fn run(handle: WorkerHandle) {
        let config = AnalyzerConfig::from_map(&handle.config());

        if !config.full_analysis {
            handle.send_event(
                EventLevel::Warning,
                "degraded_mode",
                [(
                    "detail".to_string(),
                    json!("levels, spectrum, and bands only"),
                )]
                .into_iter()
                .collect(),
            );
        }

        let mut consecutive_failures: u32 = 0;
        let mut force_default_device = false;

        loop {
            if !matches!(handle.state(), vj_worker::WorkerState::Running) {
                return;
            }

            match Session::start(&handle, &config, force_default_device) {
                Ok(session) => {
                    let healthy = session.monitor(&handle).await;
                    session.stop();
                    if healthy {
                        // Shutdown path: monitor only returns healthy when
                        // the worker is leaving the running state
                        return;
                    }
                    consecutive_failures += 1;
                    force_default_device = true;
                    handle.send_event(
                        EventLevel::Warning,
                        "device_changed",
                        [(
                            "detail".to_string(),
                            json!("capture stalled, reselecting default device"),
                        )]
                        .into_iter()
                        .collect(),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "capture session failed to start");
                    consecutive_failures += 1;
                    force_default_device = true;
                    handle.send_event(
                        EventLevel::Warning,
                        "capture_failed",
                        [("error".to_string(), json!(e.to_string()))]
                            .into_iter()
                            .collect(),
                    );
                }
            }

            if consecutive_failures >= MAX_SESSION_FAILURES {
                handle.send_event(
                    EventLevel::Error,
                    "audio_stalled",
                    [(
                        "consecutive_failures".to_string(),
                        json!(consecutive_failures),
                    )]
                    .into_iter()
                    .collect(),
                );
                handle.report_fatal("audio capture stalled repeatedly");
                return;
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// One capture + analysis session. Torn down and rebuilt on stall.
struct Session {
    capture: CaptureThread,
    analysis: Option<std::thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    shared: Arc<CaptureShared>,
}

impl Session {
    fn start(
        handle: &WorkerHandle,
        config: &AnalyzerConfig,
        force_default_device: bool,
    ) -> Result<Self, CaptureError> {
        let (capture_queues, analysis_queues) = block_queues(config.block_size);
        let shared = Arc::new(CaptureShared::default());

        let (capture, meta) = match &config.input_wav {
            Some(path) => start_wav_capture(
                std::path::Path::new(path),
                config.block_size,
                capture_queues,
                Arc::clone(&shared),
            )?,
            None => {
                let selection = if force_default_device {
                    DeviceSelection::default()
                } else {
                    DeviceSelection {
                        index: config.device_index,
                        name: config.device_name.clone(),
                    }
                };
                start_device_capture(
                    selection,
                    config.block_size,
                    capture_queues,
                    Arc::clone(&shared),
                )?
            }
        };

        handle.send_event(
            EventLevel::Info,
            "device_selected",
            [
                ("source".to_string(), json!(meta.source)),
                ("sample_rate".to_string(), json!(meta.sample_rate)),
                ("channels".to_string(), json!(meta.channels)),
            ]
            .into_iter()
            .collect(),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let analysis = spawn_analysis_thread(
            handle.clone(),
            config,
            &meta,
            analysis_queues,
            Arc::clone(&shared),
            Arc::clone(&stop),
        )?;

        Ok(Session {
            capture,
            analysis: Some(analysis),
            stop,
            shared,
        })
    }

    /// Watch the session until it stalls (false) or the worker leaves the
    /// running state (true).
    async fn monitor(&self, handle: &WorkerHandle) -> bool {
        loop {
            tokio::time::sleep(WATCHDOG_POLL).await;

            if !matches!(handle.state(), vj_worker::WorkerState::Running) {
                return true;
            }
            if self.shared.device_error.load(Ordering::SeqCst) {
                warn!("device error reported by stream callback");
                return false;
            }
            if self.shared.block_age_ms() > STALL_AFTER_MS {
                warn!(age_ms = self.shared.block_age_ms(), "no audio blocks, capture stalled");
                return false;
            }
        }
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.capture.stop();
        if let Some(join) = self.analysis.take() {
            let _ = join.join();
        }
    }
}

/// The analysis thread: drain to the newest block, extract, publish.
fn spawn_analysis_thread(
    handle: WorkerHandle,
    config: &AnalyzerConfig,
    meta: &CaptureMeta,
    queues: AnalysisQueues,
    shared: Arc<CaptureShared>,
    stop: Arc<AtomicBool>,
) -> Result<std::thread::JoinHandle<()>, CaptureError> {
    use ringbuf::traits::{Consumer, Producer};

    let mut extractor =
        FeatureExtractor::new(meta.sample_rate, config.block_size, config.full_analysis);
    let osc = OscSender::connect(&config.osc_host, config.osc_port)
        .map_err(|e| CaptureError::BuildStream(e.to_string()))?;

    let AnalysisQueues {
        mut data_rx,
        mut pool_tx,
    } = queues;

    std::thread::Builder::new()
        .name("audio-analysis".into())
        .spawn(move || {
            let mut frames: u64 = 0;
            info!("analysis thread running");

            while !stop.load(Ordering::SeqCst) {
                // Prefer newest: drain the ring, drop everything but the
                // most recent block
                let mut latest: Option<Vec<f32>> = None;
                while let Some(block) = data_rx.try_pop() {
                    if let Some(stale) = latest.replace(block) {
                        shared.overruns.fetch_add(1, Ordering::Relaxed);
                        let _ = pool_tx.try_push(stale);
                    }
                }

                let Some(block) = latest else {
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                };

                if let Some(features) = extractor.process(&block) {
                    handle.publish_telemetry(FEATURES_STREAM, feature_telemetry(&features));
                    osc.send_features(&features);
                    frames += 1;

                    if frames % METRICS_EVERY_FRAMES == 0 {
                        handle.set_metric("frames", Value::from(frames));
                        handle.set_metric(
                            "overruns",
                            Value::from(shared.overruns.load(Ordering::Relaxed)),
                        );
                        handle.set_metric(
                            "skipped_frames",
                            Value::from(extractor.skipped_frames()),
                        );
                        handle.set_metric("bpm", json!(features.bpm));
                    }
                }
                let _ = pool_tx.try_push(block);
            }
            info!(frames, "analysis thread stopped");
        })
        .map_err(|e| CaptureError::BuildStream(e.to_string()))
}

/// Build the default config map for the analyzer worker, with CLI overrides.
pub fn default_config(input_wav: Option<&str>) -> Map<String, Value> {
    let mut map = AnalyzerConfig::default_map();
    if let Some(path) = input_wav {
        map.insert("input_wav".into(), json!(path));
    }
    map
}
