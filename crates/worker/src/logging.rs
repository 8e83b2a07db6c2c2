// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-worker log file setup.
//!
//! Each worker writes to `<log_dir>/<worker>.log` through a non-blocking
//! appender. Rotation happens at startup: over 10 MB the current file is
//! shifted to `.1` → `.2` → `.3`, oldest deleted.

use std::path::Path;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;

/// Maximum log file size before rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep.
const MAX_ROTATED_LOGS: u32 = 3;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("could not determine log directory")]
    NoLogDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Install tracing for a worker binary, writing to `<log_dir>/<worker>.log`.
///
/// Returns the appender guard; dropping it flushes buffered log lines, so
/// hold it for the life of `main`.
pub fn init(worker: &str) -> Result<WorkerGuard, LoggingError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let log_dir = vj_bus::env::log_dir().ok_or(LoggingError::NoLogDir)?;
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join(format!("{worker}.log"));
    rotate_log_if_needed(&log_path);

    let file_appender = tracing_appender::rolling::never(&log_dir, format!("{worker}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}

/// Rotate the log file if it exceeds [`MAX_LOG_SIZE`].
///
/// Best-effort: rotation failures are silently ignored so the worker still
/// starts.
fn rotate_log_if_needed(log_path: &Path) {
    let size = match std::fs::metadata(log_path) {
        Ok(m) => m.len(),
        Err(_) => return,
    };

    if size < MAX_LOG_SIZE {
        return;
    }

    let log_str = log_path.display().to_string();

    for i in (1..MAX_ROTATED_LOGS).rev() {
        let from = format!("{log_str}.{i}");
        let to = format!("{log_str}.{}", i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    let _ = std::fs::rename(log_path, format!("{log_str}.1"));
}
