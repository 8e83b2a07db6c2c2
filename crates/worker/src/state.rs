// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker lifecycle state machine.
//!
//! One explicit enum instead of booleans scattered across the process. All
//! transitions go through [`runtime::WorkerRuntime`], which emits the
//! matching lifecycle event and updates the registry row.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Process launched, channels not yet bound.
    Starting,
    /// All channels bound and registry entry written.
    Running,
    /// Shutdown signal received, waiting for in-flight commands.
    Draining,
    /// Drain finished, registry unregistered. Terminal.
    Stopped,
    /// Unhandled error; registry row left for the supervisor. Terminal.
    Crashed,
}

impl WorkerState {
    /// Whether a transition from `self` to `to` is legal.
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Starting, Running)
                | (Starting, Crashed)
                | (Running, Draining)
                | (Running, Crashed)
                | (Draining, Stopped)
                | (Draining, Crashed)
        )
    }

    /// Terminal states have no exits.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Crashed)
    }

    /// Lifecycle event name published when this state is entered, if any.
    pub fn lifecycle_event(self) -> Option<&'static str> {
        match self {
            WorkerState::Starting => None,
            WorkerState::Running => Some("booted"),
            WorkerState::Draining => Some("shutting_down"),
            WorkerState::Stopped => Some("stopped"),
            WorkerState::Crashed => Some("crashed"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
            WorkerState::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
