// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child supervision: spawn, adopt, crash detection, backoff restart.
//!
//! Every child is spawned as a fresh process (never forked) and owns its own
//! registry record; the supervisor owns only the OS process handle. Children
//! deliberately outlive a crashed manager: on restart the manager adopts
//! them back by pid instead of double-starting.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use vj_bus::envelope::EventLevel;
use vj_bus::registry::{Registry, WorkerStatus};
use vj_client::BusClient;
use vj_worker::{WorkerHandle, RESTART_EXIT_CODE};

use crate::backoff::{restart_delay, STABLE_RUN};
use crate::generation::{GenerationError, GenerationFile};
use crate::manifest::{resolve_command, Manifest, WorkerSpec};

/// How long a stop waits for a clean exit before escalating to SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long SIGTERM gets before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown worker {0:?}")]
    UnknownWorker(String),

    #[error("worker {0:?} is already running")]
    AlreadyRunning(String),

    #[error("worker {0:?} is not running")]
    NotRunning(String),

    #[error("failed to spawn {worker:?}: {source}")]
    Spawn {
        worker: String,
        source: std::io::Error,
    },

    #[error("generation file error: {0}")]
    Generation(#[from] GenerationError),
}

/// Supervision status of a managed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagedStatus {
    Stopped,
    Running,
    Backoff,
    Failed,
}

/// One row of `list_workers` output.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub name: String,
    pub status: ManagedStatus,
    pub auto_start: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    pub consecutive_failures: u32,
}

struct RunningChild {
    child: Option<tokio::process::Child>,
    pid: u32,
    instance_id: String,
    generation: u64,
    started_at: Instant,
}

enum RunState {
    Stopped,
    Running(RunningChild),
    Backoff { until: Instant },
    Failed,
}

struct Managed {
    spec: WorkerSpec,
    run: RunState,
    consecutive_failures: u32,
}

/// The supervisor. Shared between the manager's command handlers and the
/// supervision tick task.
pub struct Supervisor {
    registry: Registry,
    generations: GenerationFile,
    client: BusClient,
    state: Mutex<HashMap<String, Managed>>,
    events: Mutex<Option<WorkerHandle>>,
}

impl Supervisor {
    pub fn new(manifest: Manifest, registry: Registry, generations: GenerationFile) -> Self {
        let client = BusClient::with_registry("process_manager", registry.clone());
        let state = manifest
            .workers
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    Managed {
                        spec: spec.clone(),
                        run: RunState::Stopped,
                        consecutive_failures: 0,
                    },
                )
            })
            .collect();
        Supervisor {
            registry,
            generations,
            client,
            state: Mutex::new(state),
            events: Mutex::new(None),
        }
    }

    /// Wire up the manager's own worker handle for event publishing.
    pub fn attach_events(&self, handle: WorkerHandle) {
        *self.events.lock() = Some(handle);
    }

    /// Adopt children that survived a manager restart.
    ///
    /// A manifest worker with a live registry record and a live pid is
    /// resumed in place: same pid, same instance id, same generation; no
    /// double-start. The generation file is raised to match if it fell
    /// behind.
    pub fn adopt_running_children(&self) {
        let records = match self.registry.discover(true) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "could not read registry for adoption");
                return;
            }
        };

        let mut state = self.state.lock();
        for (name, managed) in state.iter_mut() {
            let Some(entry) = records.get(name) else {
                continue;
            };
            if entry.status == WorkerStatus::Stopped || !process_exists(entry.pid) {
                continue;
            }
            info!(
                worker = %name,
                pid = entry.pid,
                generation = entry.generation,
                "adopting running child"
            );
            if let Err(e) = self.generations.observe_at_least(name, entry.generation) {
                warn!(worker = %name, error = %e, "could not sync generation file");
            }
            managed.run = RunState::Running(RunningChild {
                child: None,
                pid: entry.pid,
                instance_id: entry.instance_id.clone(),
                generation: entry.generation,
                started_at: Instant::now(),
            });
        }
    }

    /// Start every manifest worker flagged `auto_start` that is not already
    /// running (adopted children count as running).
    pub fn start_auto(&self) {
        let names: Vec<String> = {
            let state = self.state.lock();
            state
                .iter()
                .filter(|(_, m)| m.spec.auto_start && matches!(m.run, RunState::Stopped))
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in names {
            if let Err(e) = self.start_worker(&name) {
                warn!(worker = %name, error = %e, "auto-start failed");
            }
        }
    }

    /// Spawn a worker by name. Resets a `failed` state.
    pub fn start_worker(&self, name: &str) -> Result<WorkerReport, SupervisorError> {
        let spec = {
            let state = self.state.lock();
            let managed = state
                .get(name)
                .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;
            if matches!(managed.run, RunState::Running(_)) {
                return Err(SupervisorError::AlreadyRunning(name.to_string()));
            }
            managed.spec.clone()
        };

        let running = self.spawn(&spec)?;
        let report = {
            let mut state = self.state.lock();
            let managed = state
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;
            managed.consecutive_failures = 0;
            managed.run = RunState::Running(running);
            self.report_for(managed)
        };

        self.emit(
            EventLevel::Info,
            "worker_started",
            [
                ("worker".to_string(), json!(name)),
                ("pid".to_string(), json!(report.pid)),
                ("generation".to_string(), json!(report.generation)),
            ]
            .into_iter()
            .collect(),
        );
        Ok(report)
    }

    /// Stop a worker: `shutdown` command, then SIGTERM, then SIGKILL.
    pub async fn stop_worker(&self, name: &str) -> Result<(), SupervisorError> {
        let running = {
            let mut state = self.state.lock();
            let managed = state
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;
            match std::mem::replace(&mut managed.run, RunState::Stopped) {
                RunState::Running(running) => {
                    managed.consecutive_failures = 0;
                    running
                }
                other => {
                    managed.run = other;
                    return Err(SupervisorError::NotRunning(name.to_string()));
                }
            }
        };

        self.terminate(name, running).await;
        let _ = self.registry.set_status(name, WorkerStatus::Stopped);
        info!(worker = %name, "worker stopped");
        Ok(())
    }

    /// Restart a worker: stop (if running), then start.
    pub async fn restart_worker(&self, name: &str) -> Result<WorkerReport, SupervisorError> {
        match self.stop_worker(name).await {
            Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        let report = self.start_worker(name)?;
        self.emit(
            EventLevel::Info,
            "worker_restarted",
            [
                ("worker".to_string(), json!(name)),
                ("reason".to_string(), json!("command")),
            ]
            .into_iter()
            .collect(),
        );
        Ok(report)
    }

    /// One supervision pass: reap exits, cross-check the registry for
    /// adopted children, fire due backoff restarts.
    pub async fn tick(&self) {
        enum Verdict {
            CleanExit,
            RestartRequested,
            Crashed,
        }

        let mut verdicts: Vec<(String, Verdict)> = Vec::new();
        let mut due: Vec<String> = Vec::new();
        {
            let mut state = self.state.lock();
            for (name, managed) in state.iter_mut() {
                match &mut managed.run {
                    RunState::Running(running) => {
                        let verdict = match &mut running.child {
                            Some(child) => match child.try_wait() {
                                Ok(Some(status)) => match status.code() {
                                    Some(0) => Some(Verdict::CleanExit),
                                    Some(code) if code == RESTART_EXIT_CODE => {
                                        Some(Verdict::RestartRequested)
                                    }
                                    _ => Some(Verdict::Crashed),
                                },
                                Ok(None) => None,
                                Err(e) => {
                                    warn!(worker = %name, error = %e, "could not poll child");
                                    None
                                }
                            },
                            // Adopted child: no OS handle, probe the pid and
                            // cross-check the registry record
                            None => {
                                if process_exists(running.pid) {
                                    None
                                } else {
                                    match self.registry.get(name).ok().flatten() {
                                        None => Some(Verdict::CleanExit),
                                        Some(entry)
                                            if entry.status == WorkerStatus::Stopped =>
                                        {
                                            Some(Verdict::CleanExit)
                                        }
                                        Some(_) => Some(Verdict::Crashed),
                                    }
                                }
                            }
                        };
                        if let Some(verdict) = verdict {
                            verdicts.push((name.clone(), verdict));
                        }
                    }
                    RunState::Backoff { until } => {
                        if Instant::now() >= *until {
                            due.push(name.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        for (name, verdict) in verdicts {
            match verdict {
                Verdict::CleanExit => {
                    info!(worker = %name, "worker exited cleanly");
                    let mut state = self.state.lock();
                    if let Some(managed) = state.get_mut(&name) {
                        managed.run = RunState::Stopped;
                        managed.consecutive_failures = 0;
                    }
                }
                Verdict::RestartRequested => {
                    info!(worker = %name, "worker requested restart");
                    self.respawn(&name, "requested");
                }
                Verdict::Crashed => self.handle_crash(&name),
            }
        }

        for name in due {
            self.respawn(&name, "backoff");
        }
    }

    /// Current status of every manifest worker.
    pub fn reports(&self) -> Vec<WorkerReport> {
        let state = self.state.lock();
        let mut reports: Vec<WorkerReport> = state.values().map(|m| self.report_for(m)).collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    fn report_for(&self, managed: &Managed) -> WorkerReport {
        let (status, pid, instance_id, generation) = match &managed.run {
            RunState::Stopped => (ManagedStatus::Stopped, None, None, None),
            RunState::Running(r) => (
                ManagedStatus::Running,
                Some(r.pid),
                Some(r.instance_id.clone()),
                Some(r.generation),
            ),
            RunState::Backoff { .. } => (ManagedStatus::Backoff, None, None, None),
            RunState::Failed => (ManagedStatus::Failed, None, None, None),
        };
        WorkerReport {
            name: managed.spec.name.clone(),
            status,
            auto_start: managed.spec.auto_start,
            pid,
            instance_id,
            generation,
            consecutive_failures: managed.consecutive_failures,
        }
    }

    fn spawn(&self, spec: &WorkerSpec) -> Result<RunningChild, SupervisorError> {
        let generation = self.generations.next(&spec.name)?;
        let instance_id = uuid::Uuid::new_v4().to_string();
        let command = resolve_command(&spec.command);

        let mut cmd = tokio::process::Command::new(&command);
        cmd.args(&spec.args)
            .env("VJ_GENERATION", generation.to_string())
            .env("VJ_INSTANCE_ID", &instance_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(state_dir) = vj_bus::env::state_dir() {
            cmd.env("VJ_STATE_DIR", state_dir);
        }
        if let Some(log_dir) = vj_bus::env::log_dir() {
            cmd.env("VJ_LOG_DIR", log_dir);
        }

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            worker: spec.name.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        info!(worker = %spec.name, pid, generation, command = %command.display(), "spawned worker");

        Ok(RunningChild {
            child: Some(child),
            pid,
            instance_id,
            generation,
            started_at: Instant::now(),
        })
    }

    fn respawn(&self, name: &str, reason: &str) {
        let spec = {
            let state = self.state.lock();
            match state.get(name) {
                Some(managed) => managed.spec.clone(),
                None => return,
            }
        };
        match self.spawn(&spec) {
            Ok(running) => {
                let generation = running.generation;
                let pid = running.pid;
                {
                    let mut state = self.state.lock();
                    if let Some(managed) = state.get_mut(name) {
                        managed.run = RunState::Running(running);
                    }
                }
                self.emit(
                    EventLevel::Info,
                    "worker_restarted",
                    [
                        ("worker".to_string(), json!(name)),
                        ("pid".to_string(), json!(pid)),
                        ("generation".to_string(), json!(generation)),
                        ("reason".to_string(), json!(reason)),
                    ]
                    .into_iter()
                    .collect(),
                );
            }
            Err(e) => {
                warn!(worker = %name, error = %e, "respawn failed");
                // Count the failed spawn like a crash so backoff still grows
                self.handle_crash(name);
            }
        }
    }

    fn handle_crash(&self, name: &str) {
        if let Err(e) = self.registry.mark_crashed(name) {
            warn!(worker = %name, error = %e, "could not mark registry record crashed");
        }

        let (failures, failed, max) = {
            let mut state = self.state.lock();
            let Some(managed) = state.get_mut(name) else {
                return;
            };

            // A long stable run forgives earlier crashes
            let stable = matches!(
                &managed.run,
                RunState::Running(r) if r.started_at.elapsed() >= STABLE_RUN
            );
            managed.consecutive_failures = if stable {
                1
            } else {
                managed.consecutive_failures + 1
            };

            let failed = managed.consecutive_failures >= managed.spec.max_consecutive_failures;
            managed.run = if failed {
                RunState::Failed
            } else {
                RunState::Backoff {
                    until: Instant::now() + restart_delay(managed.consecutive_failures),
                }
            };
            (
                managed.consecutive_failures,
                failed,
                managed.spec.max_consecutive_failures,
            )
        };

        warn!(worker = %name, failures, "worker crashed");
        self.emit(
            EventLevel::Warning,
            "worker_crashed",
            [
                ("worker".to_string(), json!(name)),
                ("consecutive_failures".to_string(), json!(failures)),
            ]
            .into_iter()
            .collect(),
        );

        if failed {
            warn!(worker = %name, max, "worker exceeded failure budget, giving up");
            self.emit(
                EventLevel::Error,
                "worker_failed",
                [
                    ("worker".to_string(), json!(name)),
                    ("consecutive_failures".to_string(), json!(failures)),
                ]
                .into_iter()
                .collect(),
            );
        }
    }

    /// Escalating termination: shutdown command, SIGTERM, SIGKILL.
    async fn terminate(&self, name: &str, mut running: RunningChild) {
        let asked = self
            .client
            .send_command(name, "shutdown", Map::new(), "", Duration::from_secs(1))
            .await
            .is_ok();
        if asked && wait_for_exit(&mut running, SHUTDOWN_GRACE).await {
            return;
        }

        kill_signal("-15", running.pid);
        if wait_for_exit(&mut running, TERM_GRACE).await {
            return;
        }

        warn!(worker = %name, pid = running.pid, "escalating to SIGKILL");
        kill_signal("-9", running.pid);
        let _ = wait_for_exit(&mut running, TERM_GRACE).await;
    }

    fn emit(&self, level: EventLevel, message: &str, data: Map<String, Value>) {
        if let Some(handle) = self.events.lock().as_ref() {
            handle.send_event(level, message, data);
        }
    }
}

/// Wait for a child (owned or adopted) to disappear.
async fn wait_for_exit(running: &mut RunningChild, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let gone = match &mut running.child {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => !process_exists(running.pid),
        };
        if gone {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Execute `kill` with the given signal and pid.
fn kill_signal(signal: &str, pid: u32) -> bool {
    std::process::Command::new("kill")
        .args([signal, &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Check whether a process with the given pid exists.
pub fn process_exists(pid: u32) -> bool {
    kill_signal("-0", pid)
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
