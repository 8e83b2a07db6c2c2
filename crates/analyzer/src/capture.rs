// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device capture: cpal stream → mono blocks → lock-free ring.
//!
//! The capture thread owns the cpal stream (streams are not Send) and never
//! blocks or allocates in the callback: blocks are recycled through a
//! pre-filled pool ring, and a full data ring counts an overrun and drops
//! the block instead of waiting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use thiserror::Error;
use tracing::{info, warn};

use crate::device::{select_input_device, DeviceError, DeviceSelection};

/// Blocks buffered between capture and analysis.
pub const QUEUE_CAPACITY: usize = 8;

/// How long session setup may take before it counts as failed.
const SETUP_TIMEOUT: Duration = Duration::from_secs(5);

pub type BlockProducer = HeapProd<Vec<f32>>;
pub type BlockConsumer = HeapCons<Vec<f32>>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("failed to build input stream: {0}")]
    BuildStream(String),

    #[error("failed to start input stream: {0}")]
    PlayStream(String),

    #[error("unsupported sample format {0:?}")]
    UnsupportedFormat(cpal::SampleFormat),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("capture setup timed out")]
    SetupTimeout,
}

/// State shared between the capture thread, analysis thread, and watchdog.
#[derive(Debug, Default)]
pub struct CaptureShared {
    /// Wall-clock millis of the last block pushed into the data ring.
    pub last_block_ms: AtomicU64,
    /// Blocks dropped anywhere in the pipeline.
    pub overruns: AtomicU64,
    /// Set by the cpal error callback when the device goes away.
    pub device_error: AtomicBool,
}

impl CaptureShared {
    pub fn touch(&self) {
        self.last_block_ms
            .store(vj_bus::time::now_millis(), Ordering::Relaxed);
    }

    pub fn block_age_ms(&self) -> u64 {
        vj_bus::time::now_millis().saturating_sub(self.last_block_ms.load(Ordering::Relaxed))
    }
}

/// What the capture thread negotiated with its source.
#[derive(Debug, Clone)]
pub struct CaptureMeta {
    pub source: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Capture-side ring ends.
pub struct CaptureQueues {
    pub data_tx: BlockProducer,
    pub pool_rx: BlockConsumer,
}

/// Analysis-side ring ends.
pub struct AnalysisQueues {
    pub data_rx: BlockConsumer,
    pub pool_tx: BlockProducer,
}

/// Build the data/pool ring pair with a pre-allocated block pool.
pub fn block_queues(block_size: usize) -> (CaptureQueues, AnalysisQueues) {
    let (data_tx, data_rx) = HeapRb::<Vec<f32>>::new(QUEUE_CAPACITY).split();
    let (mut pool_tx, pool_rx) = HeapRb::<Vec<f32>>::new(QUEUE_CAPACITY).split();
    for _ in 0..QUEUE_CAPACITY {
        let _ = pool_tx.try_push(Vec::with_capacity(block_size));
    }
    (
        CaptureQueues { data_tx, pool_rx },
        AnalysisQueues { data_rx, pool_tx },
    )
}

/// Accumulates mono samples into fixed-size blocks.
pub struct BlockAssembler {
    block_size: usize,
    partial: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(block_size: usize) -> Self {
        BlockAssembler {
            block_size,
            partial: Vec::with_capacity(block_size),
        }
    }

    /// Push one mono sample; invokes `on_block` with each completed block.
    pub fn push_sample(&mut self, sample: f32, on_block: &mut impl FnMut(&[f32])) {
        self.partial.push(sample);
        if self.partial.len() == self.block_size {
            on_block(&self.partial);
            self.partial.clear();
        }
    }
}

/// Hand a completed block to the data ring, recycling through the pool.
/// Drops the block and counts an overrun when either ring is unavailable.
pub(crate) fn dispatch(
    block: &[f32],
    pool_rx: &mut BlockConsumer,
    data_tx: &mut BlockProducer,
    shared: &CaptureShared,
) {
    match pool_rx.try_pop() {
        Some(mut buffer) => {
            buffer.clear();
            buffer.extend_from_slice(block);
            if data_tx.try_push(buffer).is_err() {
                shared.overruns.fetch_add(1, Ordering::Relaxed);
            } else {
                shared.touch();
            }
        }
        None => {
            shared.overruns.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Running capture thread; dropping without `stop` leaks the thread, so the
/// owner calls [`CaptureThread::stop`].
pub struct CaptureThread {
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl CaptureThread {
    pub(crate) fn from_parts(stop: Arc<AtomicBool>, join: std::thread::JoinHandle<()>) -> Self {
        CaptureThread {
            stop,
            join: Some(join),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Start capturing from an input device into the data ring.
///
/// Blocks until the stream is live (or setup fails) and reports the
/// negotiated source metadata.
pub fn start_device_capture(
    selection: DeviceSelection,
    block_size: usize,
    queues: CaptureQueues,
    shared: Arc<CaptureShared>,
) -> Result<(CaptureThread, CaptureMeta), CaptureError> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let (meta_tx, meta_rx) = std::sync::mpsc::channel();

    let join = std::thread::Builder::new()
        .name("audio-capture".into())
        .spawn(move || {
            capture_thread_main(selection, block_size, queues, shared, thread_stop, meta_tx);
        })
        .map_err(|e| CaptureError::BuildStream(e.to_string()))?;

    match meta_rx.recv_timeout(SETUP_TIMEOUT) {
        Ok(Ok(meta)) => Ok((
            CaptureThread {
                stop,
                join: Some(join),
            },
            meta,
        )),
        Ok(Err(e)) => {
            let _ = join.join();
            Err(e)
        }
        Err(_) => {
            stop.store(true, Ordering::SeqCst);
            Err(CaptureError::SetupTimeout)
        }
    }
}

type MetaSender = std::sync::mpsc::Sender<Result<CaptureMeta, CaptureError>>;

fn capture_thread_main(
    selection: DeviceSelection,
    block_size: usize,
    queues: CaptureQueues,
    shared: Arc<CaptureShared>,
    stop: Arc<AtomicBool>,
    meta_tx: MetaSender,
) {
    let (device, device_name) = match select_input_device(&selection) {
        Ok(found) => found,
        Err(e) => {
            let _ = meta_tx.send(Err(e.into()));
            return;
        }
    };

    let supported = match device.default_input_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = meta_tx.send(Err(CaptureError::BuildStream(e.to_string())));
            return;
        }
    };
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.config();
    let channels = config.channels;
    let sample_rate = config.sample_rate.0;

    let stream = match sample_format {
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(&device, &config, block_size, queues, Arc::clone(&shared))
        }
        cpal::SampleFormat::I16 => {
            build_stream::<i16>(&device, &config, block_size, queues, Arc::clone(&shared))
        }
        cpal::SampleFormat::U16 => {
            build_stream::<u16>(&device, &config, block_size, queues, Arc::clone(&shared))
        }
        other => {
            let _ = meta_tx.send(Err(CaptureError::UnsupportedFormat(other)));
            return;
        }
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = meta_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = meta_tx.send(Err(CaptureError::PlayStream(e.to_string())));
        return;
    }

    info!(device = %device_name, sample_rate, channels, "capture running");
    shared.touch();
    let _ = meta_tx.send(Ok(CaptureMeta {
        source: device_name,
        sample_rate,
        channels,
    }));

    // The stream lives as long as this thread; parking keeps it alive
    // without burning a core.
    while !stop.load(Ordering::SeqCst) {
        std::thread::park_timeout(Duration::from_millis(100));
    }
    drop(stream);
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    block_size: usize,
    queues: CaptureQueues,
    shared: Arc<CaptureShared>,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let CaptureQueues {
        mut data_tx,
        mut pool_rx,
    } = queues;
    let mut assembler = BlockAssembler::new(block_size);
    let error_shared = Arc::clone(&shared);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels.max(1)) {
                    let mut mono = 0.0f32;
                    for &sample in frame {
                        mono += f32::from_sample(sample);
                    }
                    mono /= frame.len() as f32;
                    assembler.push_sample(mono, &mut |block| {
                        dispatch(block, &mut pool_rx, &mut data_tx, &shared);
                    });
                }
            },
            move |e| {
                warn!(error = %e, "input stream error");
                error_shared.device_error.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| CaptureError::BuildStream(e.to_string()))
}

#[cfg(test)]
#[path = "capture_tests.rs"]
mod tests;
