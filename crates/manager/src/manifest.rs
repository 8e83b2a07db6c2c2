// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The static manifest of managed workers.
//!
//! Built-in defaults cover the fleet shipped in this workspace; a TOML file
//! named by `VJ_PM_MANIFEST` replaces them for custom deployments.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("manifest has duplicate worker name {0:?}")]
    DuplicateName(String),
}

/// Spec for one managed worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    /// Executable to spawn. Bare names are resolved next to the `vjpm`
    /// binary first, then through `PATH`.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// Consecutive crashes tolerated before the worker is marked failed.
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

fn default_auto_start() -> bool {
    true
}

fn default_max_failures() -> u32 {
    5
}

/// The full manifest.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "worker")]
    pub workers: Vec<WorkerSpec>,
}

impl Manifest {
    /// Load from `VJ_PM_MANIFEST` when set, else the built-in fleet.
    pub fn load() -> Result<Self, ManifestError> {
        match std::env::var("VJ_PM_MANIFEST") {
            Ok(path) => Self::load_file(PathBuf::from(path)),
            Err(_) => Ok(Self::builtin()),
        }
    }

    /// Parse a manifest TOML file.
    pub fn load_file(path: PathBuf) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.clone(),
            source,
        })?;
        let manifest: Manifest =
            toml::from_str(&text).map_err(|source| ManifestError::Parse { path, source })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// The workers shipped in this workspace.
    pub fn builtin() -> Self {
        Manifest {
            workers: vec![
                WorkerSpec {
                    name: "example_worker".into(),
                    command: "vj-example-worker".into(),
                    args: Vec::new(),
                    auto_start: true,
                    max_consecutive_failures: default_max_failures(),
                },
                WorkerSpec {
                    name: "audio_analyzer".into(),
                    command: "vj-analyzer".into(),
                    args: Vec::new(),
                    auto_start: true,
                    max_consecutive_failures: default_max_failures(),
                },
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&WorkerSpec> {
        self.workers.iter().find(|w| w.name == name)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = std::collections::HashSet::new();
        for worker in &self.workers {
            if !seen.insert(&worker.name) {
                return Err(ManifestError::DuplicateName(worker.name.clone()));
            }
        }
        Ok(())
    }
}

/// Resolve a spec's command to an executable path.
///
/// Bare names prefer a sibling of the running binary (the workspace target
/// directory layout) and fall back to `PATH` resolution by the OS.
pub fn resolve_command(command: &str) -> PathBuf {
    let path = PathBuf::from(command);
    if path.components().count() > 1 {
        return path;
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(command);
            if sibling.exists() {
                return sibling;
            }
        }
    }

    path
}

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod tests;
