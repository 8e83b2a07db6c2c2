// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistent per-worker generation counters.
//!
//! Generations must be monotonic across process-manager restarts, so each
//! assignment is persisted (atomic write) before the child is spawned. The
//! file is single-writer: only the process manager touches it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GenerationData {
    /// Last generation assigned per worker.
    workers: HashMap<String, u64>,
}

/// Handle on `<state_dir>/pm_registry.json`.
pub struct GenerationFile {
    path: PathBuf,
    data: Mutex<GenerationData>,
}

impl GenerationFile {
    /// Load existing counters, or start empty. A corrupt file is replaced on
    /// the next save rather than crashing startup.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, GenerationError> {
        let path = path.into();
        let data = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GenerationData::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(GenerationFile {
            path,
            data: Mutex::new(data),
        })
    }

    /// Last generation assigned to `worker`, if any.
    pub fn current(&self, worker: &str) -> Option<u64> {
        self.data.lock().workers.get(worker).copied()
    }

    /// Assign and persist the next generation for `worker`.
    pub fn next(&self, worker: &str) -> Result<u64, GenerationError> {
        let next = {
            let mut data = self.data.lock();
            let counter = data.workers.entry(worker.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        self.save()?;
        Ok(next)
    }

    /// Raise the stored counter to at least `generation`. Used when adopting
    /// children whose generation outruns the file (e.g. the file was lost).
    pub fn observe_at_least(&self, worker: &str, generation: u64) -> Result<(), GenerationError> {
        let changed = {
            let mut data = self.data.lock();
            let counter = data.workers.entry(worker.to_string()).or_insert(0);
            if *counter < generation {
                *counter = generation;
                true
            } else {
                false
            }
        };
        if changed {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<(), GenerationError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            serde_json::to_writer(&file, &*self.data.lock())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "generation_tests.rs"]
mod tests;
