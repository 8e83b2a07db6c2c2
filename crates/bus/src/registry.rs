// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-backed directory of live workers.
//!
//! One small JSON record per worker under `<state_dir>/registry/`. Chosen
//! over a central daemon so discovery survives any single process crash,
//! including the process manager's. Writes are write-to-temp + rename under
//! an advisory directory lock; readers never take the lock (the rename makes
//! torn reads impossible by construction).

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::time::now_millis;

/// Default heartbeat interval workers refresh their record at.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Stale multiplier: a record is stale after 3 missed heartbeats.
pub const STALE_MULTIPLIER: u32 = 3;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no registry entry for worker {0:?}")]
    NotFound(String),
}

/// Lifecycle status recorded in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Crashed,
    Stopped,
}

/// One worker's registry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub worker: String,
    pub instance_id: String,
    pub generation: u64,
    pub pid: u32,
    /// Request/reply endpoint, e.g. `tcp://127.0.0.1:5051`.
    pub command_endpoint: String,
    /// Datagram endpoint the worker publishes telemetry to.
    pub telemetry_endpoint: String,
    /// Broadcast endpoint for lifecycle/info/error events.
    pub event_endpoint: String,
    pub started_at_ms: u64,
    pub heartbeat_at_ms: u64,
    pub status: WorkerStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Handle on the registry directory.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
    stale_after: Duration,
}

impl Registry {
    /// Open a registry rooted at `dir`, creating the directory on first use.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        Self::with_heartbeat_interval(dir, DEFAULT_HEARTBEAT_INTERVAL)
    }

    /// Open with an explicit heartbeat interval (stale = 3 × interval).
    pub fn with_heartbeat_interval(
        dir: impl Into<PathBuf>,
        heartbeat_interval: Duration,
    ) -> Result<Self, RegistryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Registry {
            dir,
            stale_after: heartbeat_interval * STALE_MULTIPLIER,
        })
    }

    /// Directory this registry lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Age beyond which a record counts as stale.
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Atomically create or replace the record for `entry.worker`.
    ///
    /// Replacement preserves an existing higher `generation` so a worker
    /// restarted by hand cannot roll the counter backwards.
    pub fn register(&self, mut entry: RegistryEntry) -> Result<RegistryEntry, RegistryError> {
        let _lock = self.lock()?;
        if let Some(existing) = self.read_entry(&entry.worker)? {
            if existing.generation > entry.generation {
                entry.generation = existing.generation;
            }
        }
        self.write_entry(&entry)?;
        Ok(entry)
    }

    /// Refresh `heartbeat_at` and merge `metrics` into the metadata map.
    pub fn heartbeat(
        &self,
        worker: &str,
        metrics: &Map<String, Value>,
    ) -> Result<(), RegistryError> {
        let _lock = self.lock()?;
        let mut entry = self
            .read_entry(worker)?
            .ok_or_else(|| RegistryError::NotFound(worker.to_string()))?;
        entry.heartbeat_at_ms = now_millis();
        for (k, v) in metrics {
            entry.metadata.insert(k.clone(), v.clone());
        }
        self.write_entry(&entry)
    }

    /// Update the recorded status for a worker.
    pub fn set_status(&self, worker: &str, status: WorkerStatus) -> Result<(), RegistryError> {
        let _lock = self.lock()?;
        let mut entry = self
            .read_entry(worker)?
            .ok_or_else(|| RegistryError::NotFound(worker.to_string()))?;
        entry.status = status;
        self.write_entry(&entry)
    }

    /// Idempotent transition to `crashed`, used by supervisors. A missing
    /// record is not an error; the worker may have unregistered cleanly.
    pub fn mark_crashed(&self, worker: &str) -> Result<(), RegistryError> {
        let _lock = self.lock()?;
        let Some(mut entry) = self.read_entry(worker)? else {
            return Ok(());
        };
        if entry.status != WorkerStatus::Crashed {
            entry.status = WorkerStatus::Crashed;
            self.write_entry(&entry)?;
        }
        Ok(())
    }

    /// Remove the record for a worker. Missing records are fine.
    pub fn unregister(&self, worker: &str) -> Result<(), RegistryError> {
        let _lock = self.lock()?;
        let path = self.entry_path(worker);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Scan all records. With `include_stale=false`, records whose heartbeat
    /// is older than the stale threshold are omitted. Unreadable entries are
    /// skipped with a warning.
    pub fn discover(
        &self,
        include_stale: bool,
    ) -> Result<HashMap<String, RegistryEntry>, RegistryError> {
        let mut entries = HashMap::new();
        let now = now_millis();
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        for item in read_dir {
            let path = match item {
                Ok(item) => item.path(),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable registry dir entry");
                    continue;
                }
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_path(&path) {
                Ok(entry) => {
                    if include_stale || !self.entry_is_stale(&entry, now) {
                        entries.insert(entry.worker.clone(), entry);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable registry entry");
                }
            }
        }
        Ok(entries)
    }

    /// Read a single worker's record, if present and parseable.
    pub fn get(&self, worker: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        self.read_entry(worker)
    }

    /// Whether a record's heartbeat is older than the stale threshold.
    pub fn is_stale(&self, entry: &RegistryEntry) -> bool {
        self.entry_is_stale(entry, now_millis())
    }

    fn entry_is_stale(&self, entry: &RegistryEntry, now_ms: u64) -> bool {
        now_ms.saturating_sub(entry.heartbeat_at_ms) > self.stale_after.as_millis() as u64
    }

    fn entry_path(&self, worker: &str) -> PathBuf {
        self.dir.join(format!("{worker}.json"))
    }

    fn read_entry(&self, worker: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        let path = self.entry_path(worker);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.read_path(&path)?))
    }

    fn read_path(&self, path: &Path) -> Result<RegistryEntry, RegistryError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_entry(&self, entry: &RegistryEntry) -> Result<(), RegistryError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.entry_path(&entry.worker);
        let tmp_path = path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            serde_json::to_writer(&file, entry)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Advisory lock over the directory, held for the duration of a write.
    /// Released when the returned file handle drops.
    fn lock(&self) -> Result<File, RegistryError> {
        fs::create_dir_all(&self.dir)?;
        let lock_file = File::create(self.dir.join(".lock"))?;
        lock_file.lock_exclusive()?;
        Ok(lock_file)
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
