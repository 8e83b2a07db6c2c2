// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Synthetic capture source: a WAV file fed at real-time pace.
//!
//! Used for latency measurement and development without audio hardware.
//! The file is downmixed to mono up front and looped continuously; blocks
//! enter the same ring the device capture uses, so everything downstream is
//! identical.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::capture::{CaptureError, CaptureMeta, CaptureQueues, CaptureShared, CaptureThread};

/// Load a WAV file as mono f32 samples.
pub fn load_wav_mono(path: &Path) -> Result<(Vec<f32>, u32), CaptureError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Start feeding a WAV file into the data ring, one block per block period.
pub fn start_wav_capture(
    path: &Path,
    block_size: usize,
    queues: CaptureQueues,
    shared: Arc<CaptureShared>,
) -> Result<(CaptureThread, CaptureMeta), CaptureError> {
    let (samples, sample_rate) = load_wav_mono(path)?;
    if samples.is_empty() {
        return Err(CaptureError::BuildStream(format!(
            "WAV file {} has no samples",
            path.display()
        )));
    }
    info!(
        path = %path.display(),
        sample_rate,
        seconds = samples.len() as f32 / sample_rate as f32,
        "feeding synthetic WAV input"
    );

    let meta = CaptureMeta {
        source: format!("wav:{}", path.display()),
        sample_rate,
        channels: 1,
    };

    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let block_period = Duration::from_secs_f64(block_size as f64 / sample_rate as f64);

    let join = std::thread::Builder::new()
        .name("wav-capture".into())
        .spawn(move || {
            feed_loop(samples, block_size, block_period, queues, shared, thread_stop);
        })
        .map_err(|e| CaptureError::BuildStream(e.to_string()))?;

    Ok((
        CaptureThread::from_parts(stop, join),
        meta,
    ))
}

fn feed_loop(
    samples: Vec<f32>,
    block_size: usize,
    block_period: Duration,
    queues: CaptureQueues,
    shared: Arc<CaptureShared>,
    stop: Arc<AtomicBool>,
) {
    let CaptureQueues {
        mut data_tx,
        mut pool_rx,
    } = queues;

    let started = Instant::now();
    let mut blocks_sent: u64 = 0;
    let mut position = 0usize;
    let mut block = vec![0.0f32; block_size];

    while !stop.load(Ordering::SeqCst) {
        // Pace against the wall clock, not cumulative sleeps, so long runs
        // do not drift.
        let due = started + block_period.mul_f64(blocks_sent as f64);
        let now = Instant::now();
        if due > now {
            std::thread::sleep((due - now).min(block_period));
            continue;
        }

        for slot in block.iter_mut() {
            *slot = samples[position];
            position = (position + 1) % samples.len();
        }
        crate::capture::dispatch(&block, &mut pool_rx, &mut data_tx, &shared);
        blocks_sent += 1;
    }
}

#[cfg(test)]
#[path = "synthetic_tests.rs"]
mod tests;
