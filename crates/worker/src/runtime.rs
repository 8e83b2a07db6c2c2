// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The worker runtime: channel binding, lifecycle, dispatch, heartbeat.
//!
//! Architecture:
//! - Command task: accepts loopback TCP connections, one request/reply per
//!   connection, dispatch serialized so a worker handles one command at a time
//! - Event fan-out: a broadcast ring feeding one forwarder task per
//!   subscriber; slow subscribers lose oldest messages, never block the sender
//! - Telemetry: fire-and-forget UDP datagrams, callable from any thread
//! - Heartbeat task: emits a heartbeat envelope and refreshes the registry row

use std::collections::HashMap;
use std::net::UdpSocket;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use vj_bus::envelope::{
    AckPayload, CommandPayload, Envelope, EventLevel, EventPayload, HeartbeatPayload, Payload,
    SchemaWarnings, TelemetryPayload,
};
use vj_bus::registry::{Registry, RegistryEntry, WorkerStatus};
use vj_bus::time::now_millis;
use vj_bus::wire::{read_envelope, write_envelope, WireError};
use vj_bus::{endpoint, env};

use crate::config::{load_initial_config, merge_config};
use crate::state::WorkerState;

/// Exit code a worker uses to ask the process manager for a restart.
pub const RESTART_EXIT_CODE: i32 = 75;

/// Event broadcast ring capacity. Subscribers further behind than this lose
/// the oldest messages.
const EVENT_RING_CAPACITY: usize = 256;

/// How long draining waits for in-flight commands.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive heartbeat failures before the worker gives up and crashes.
const HEARTBEAT_FAILURE_BUDGET: u32 = 5;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("could not determine state directory")]
    NoStateDir,

    #[error("failed to bind {channel} channel: {source}")]
    BindFailed {
        channel: &'static str,
        source: std::io::Error,
    },

    #[error("registry error: {0}")]
    Registry(#[from] vj_bus::registry::RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("illegal state transition: {from} -> {to}")]
    BadTransition { from: WorkerState, to: WorkerState },
}

/// How a worker run ended. Maps to the process exit code the supervisor
/// interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Clean shutdown, exit 0.
    Shutdown,
    /// Voluntary restart request, exit [`RESTART_EXIT_CODE`].
    Restart,
    /// Fatal error, exit 1. Registry row is left for the supervisor.
    Crashed,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Shutdown => 0,
            RunOutcome::Restart => RESTART_EXIT_CODE,
            RunOutcome::Crashed => 1,
        }
    }
}

/// Per-verb command handler. Runs on the dispatch task; anything slower than
/// ~200 ms must offload its work and return a `pending` ack.
pub type CommandHandler = Arc<dyn Fn(&WorkerHandle, &CommandPayload) -> AckPayload + Send + Sync>;

/// Hot-apply callback for `set_config`, invoked with the update map after it
/// has been merged. Returns true when the change needs a restart to take
/// effect.
pub type ConfigCallback = Arc<dyn Fn(&Map<String, Value>) -> bool + Send + Sync>;

/// Builder for a [`WorkerRuntime`].
pub struct WorkerBuilder {
    name: String,
    defaults: Map<String, Value>,
    metadata: Map<String, Value>,
    handlers: HashMap<String, CommandHandler>,
    on_config_change: Option<ConfigCallback>,
    telemetry_port: Option<u16>,
    heartbeat_interval: Duration,
}

impl WorkerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        WorkerBuilder {
            name: name.into(),
            defaults: Map::new(),
            metadata: Map::new(),
            handlers: HashMap::new(),
            on_config_change: None,
            telemetry_port: None,
            heartbeat_interval: env::heartbeat_interval(),
        }
    }

    /// Default config values, overlaid by `VJ_<WORKER>_CONFIG` at boot.
    pub fn default_config(mut self, defaults: Map<String, Value>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Static metadata published in the registry entry.
    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Register a handler for a verb. Handlers are the only extension point.
    pub fn handler(
        mut self,
        verb: impl Into<String>,
        handler: impl Fn(&WorkerHandle, &CommandPayload) -> AckPayload + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(verb.into(), Arc::new(handler));
        self
    }

    /// Callback invoked after a `set_config` merge; returns true when the
    /// change is not hot-applicable.
    pub fn on_config_change(
        mut self,
        callback: impl Fn(&Map<String, Value>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.on_config_change = Some(Arc::new(callback));
        self
    }

    /// Fixed telemetry destination port; an unused port is picked otherwise.
    pub fn telemetry_port(mut self, port: u16) -> Self {
        self.telemetry_port = Some(port);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Bind all channels, write the registry entry, and start background
    /// tasks. The worker is `running` when this returns.
    pub async fn start(self) -> Result<WorkerRuntime, RuntimeError> {
        WorkerRuntime::start(self).await
    }
}

struct Inner {
    name: String,
    instance_id: String,
    generation: u64,
    started_at: Instant,
    sequence: AtomicU64,
    state: Mutex<WorkerState>,
    config: Mutex<Map<String, Value>>,
    metrics: Mutex<Map<String, Value>>,
    registry: Registry,
    event_tx: broadcast::Sender<Envelope>,
    telemetry_socket: UdpSocket,
    schema_warnings: Mutex<SchemaWarnings>,
    on_config_change: Option<ConfigCallback>,
    handlers: HashMap<String, CommandHandler>,
    stop_tx: watch::Sender<Option<RunOutcome>>,
    /// Serializes command dispatch; drain acquires it to wait out in-flight
    /// commands.
    dispatch_gate: tokio::sync::Mutex<()>,
}

impl Inner {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn envelope(&self, payload: Payload) -> Envelope {
        Envelope::new(
            &self.name,
            &self.instance_id,
            self.generation,
            self.next_sequence(),
            payload,
        )
    }

    fn uptime_sec(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    fn request_stop(&self, outcome: RunOutcome) {
        let _ = self.stop_tx.send(Some(outcome));
    }
}

/// Cloneable handle for publishing and introspection, usable from any thread.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<Inner>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.lock()
    }

    pub fn uptime_sec(&self) -> f64 {
        self.inner.uptime_sec()
    }

    /// Snapshot of the live config.
    pub fn config(&self) -> Map<String, Value> {
        self.inner.config.lock().clone()
    }

    /// Replace a gauge in the worker's metrics map.
    pub fn set_metric(&self, key: impl Into<String>, value: Value) {
        self.inner.metrics.lock().insert(key.into(), value);
    }

    /// Publish a telemetry envelope on `stream`. Best-effort: send failures
    /// are logged and dropped, never retried.
    pub fn publish_telemetry(&self, stream: impl Into<String>, data: Map<String, Value>) {
        let envelope = self.inner.envelope(Payload::Telemetry(TelemetryPayload {
            stream: stream.into(),
            data,
        }));
        match envelope.encode() {
            Ok(bytes) => {
                if let Err(e) = self.inner.telemetry_socket.send(&bytes) {
                    debug!(worker = %self.inner.name, error = %e, "telemetry send failed");
                }
            }
            Err(e) => warn!(worker = %self.inner.name, error = %e, "telemetry encode failed"),
        }
    }

    /// Publish an event on the reliable broadcast channel.
    pub fn send_event(&self, level: EventLevel, message: impl Into<String>, data: Map<String, Value>) {
        let envelope = self.inner.envelope(Payload::Event(EventPayload {
            level,
            message: message.into(),
            data,
        }));
        // Send only fails when there are no subscribers, which is fine.
        let _ = self.inner.event_tx.send(envelope);
    }

    /// Ask the runtime to drain and exit cleanly.
    pub fn request_shutdown(&self) {
        self.inner.request_stop(RunOutcome::Shutdown);
    }

    /// Ask the runtime to drain and exit with the restart code.
    pub fn request_restart(&self) {
        self.inner.request_stop(RunOutcome::Restart);
    }

    /// Report a fatal error: the worker transitions to crashed.
    pub fn report_fatal(&self, message: &str) {
        error!(worker = %self.inner.name, message, "fatal worker error");
        self.send_event(
            EventLevel::Error,
            "fatal_error",
            [("message".to_string(), json!(message))].into_iter().collect(),
        );
        self.inner.request_stop(RunOutcome::Crashed);
    }
}

/// A running worker. Owns the background tasks; [`WorkerRuntime::run`]
/// blocks until shutdown and performs the drain.
pub struct WorkerRuntime {
    inner: Arc<Inner>,
    stop_rx: watch::Receiver<Option<RunOutcome>>,
    entry: RegistryEntry,
}

impl WorkerRuntime {
    async fn start(builder: WorkerBuilder) -> Result<Self, RuntimeError> {
        let state_dir = env::state_dir().ok_or(RuntimeError::NoStateDir)?;
        let registry = Registry::with_heartbeat_interval(
            state_dir.join("registry"),
            builder.heartbeat_interval,
        )?;

        let instance_id = env::instance_id().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let generation = env::generation();

        // Bind the reliable channels on ephemeral loopback ports
        let command_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|source| RuntimeError::BindFailed {
                channel: "command",
                source,
            })?;
        let event_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|source| RuntimeError::BindFailed {
                channel: "event",
                source,
            })?;
        let command_port = command_listener.local_addr()?.port();
        let event_port = event_listener.local_addr()?.port();

        // Telemetry is fire-and-forget UDP towards a fixed destination port;
        // subscribers bind that port to listen.
        let telemetry_port = match builder.telemetry_port {
            Some(port) => port,
            None => pick_free_udp_port()?,
        };
        let telemetry_socket =
            UdpSocket::bind("127.0.0.1:0").map_err(|source| RuntimeError::BindFailed {
                channel: "telemetry",
                source,
            })?;
        telemetry_socket.connect(("127.0.0.1", telemetry_port))?;

        let (event_tx, _) = broadcast::channel(EVENT_RING_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(None);

        let config = load_initial_config(&builder.name, builder.defaults);

        let inner = Arc::new(Inner {
            name: builder.name.clone(),
            instance_id: instance_id.clone(),
            generation,
            started_at: Instant::now(),
            sequence: AtomicU64::new(0),
            state: Mutex::new(WorkerState::Starting),
            config: Mutex::new(config),
            metrics: Mutex::new(Map::new()),
            registry: registry.clone(),
            event_tx,
            telemetry_socket,
            schema_warnings: Mutex::new(SchemaWarnings::new()),
            on_config_change: builder.on_config_change,
            handlers: builder.handlers,
            stop_tx,
            dispatch_gate: tokio::sync::Mutex::new(()),
        });

        let now = now_millis();
        let entry = registry.register(RegistryEntry {
            worker: builder.name.clone(),
            instance_id,
            generation,
            pid: std::process::id(),
            command_endpoint: endpoint::tcp(command_port),
            telemetry_endpoint: endpoint::udp(telemetry_port),
            event_endpoint: endpoint::tcp(event_port),
            started_at_ms: now,
            heartbeat_at_ms: now,
            status: WorkerStatus::Starting,
            metadata: builder.metadata,
        })?;

        let runtime = WorkerRuntime {
            inner: Arc::clone(&inner),
            stop_rx,
            entry,
        };

        tokio::spawn(command_loop(Arc::clone(&inner), command_listener));
        tokio::spawn(event_loop(Arc::clone(&inner), event_listener));
        tokio::spawn(heartbeat_loop(
            Arc::clone(&inner),
            builder.heartbeat_interval,
        ));

        runtime.transition(WorkerState::Running)?;
        info!(
            worker = %builder.name,
            command_port,
            event_port,
            telemetry_port,
            "worker running"
        );

        Ok(runtime)
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// The registry entry written at startup.
    pub fn registry_entry(&self) -> &RegistryEntry {
        &self.entry
    }

    /// Move the lifecycle state machine and emit the matching event.
    fn transition(&self, to: WorkerState) -> Result<(), RuntimeError> {
        transition_state(&self.inner, to)
    }

    /// Block until a shutdown signal or stop request, then drain and
    /// unregister. Returns the outcome whose exit code the binary should use.
    pub async fn run(mut self) -> RunOutcome {
        let outcome = loop {
            if let Some(outcome) = *self.stop_rx.borrow() {
                break outcome;
            }

            let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
            let sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt());
            match (sigterm, sigint) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = self.stop_rx.changed() => {}
                        _ = sigterm.recv() => {
                            info!(worker = %self.inner.name, "received SIGTERM");
                            self.inner.request_stop(RunOutcome::Shutdown);
                        }
                        _ = sigint.recv() => {
                            info!(worker = %self.inner.name, "received SIGINT");
                            self.inner.request_stop(RunOutcome::Shutdown);
                        }
                    }
                }
                _ => {
                    // Signal registration can fail outside a real process
                    // context (tests); fall back to the stop channel alone.
                    if self.stop_rx.changed().await.is_err() {
                        break RunOutcome::Shutdown;
                    }
                }
            }
        };

        self.finish(outcome).await
    }

    /// Drain in-flight work and tear down for the given outcome.
    pub async fn finish(self, outcome: RunOutcome) -> RunOutcome {
        if outcome == RunOutcome::Crashed {
            let _ = transition_state(&self.inner, WorkerState::Crashed);
            // Row is left behind; the supervisor marks and cleans it.
            let _ = self.inner.registry.mark_crashed(&self.inner.name);
            return outcome;
        }

        if self.transition(WorkerState::Draining).is_ok() {
            // In-flight command exchanges finish or the drain window elapses.
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, self.inner.dispatch_gate.lock()).await;
            tokio::time::sleep(drain_grace()).await;
        }
        let _ = self.transition(WorkerState::Stopped);
        if let Err(e) = self.inner.registry.unregister(&self.inner.name) {
            warn!(worker = %self.inner.name, error = %e, "failed to unregister");
        }
        info!(worker = %self.inner.name, outcome = ?outcome, "worker stopped");
        outcome
    }
}

/// Short pause letting connection tasks flush their final acks.
fn drain_grace() -> Duration {
    Duration::from_millis(50)
}

fn transition_state(inner: &Arc<Inner>, to: WorkerState) -> Result<(), RuntimeError> {
    let from = {
        let mut state = inner.state.lock();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(RuntimeError::BadTransition { from, to });
        }
        *state = to;
        from
    };
    debug!(worker = %inner.name, %from, %to, "state transition");

    let status = match to {
        WorkerState::Starting => WorkerStatus::Starting,
        WorkerState::Running => WorkerStatus::Running,
        WorkerState::Draining => WorkerStatus::Running,
        WorkerState::Stopped => WorkerStatus::Stopped,
        WorkerState::Crashed => WorkerStatus::Crashed,
    };
    if let Err(e) = inner.registry.set_status(&inner.name, status) {
        warn!(worker = %inner.name, error = %e, "failed to update registry status");
    }

    if let Some(event) = to.lifecycle_event() {
        let envelope = inner.envelope(Payload::Event(EventPayload {
            level: EventLevel::Info,
            message: event.to_string(),
            data: Map::new(),
        }));
        let _ = inner.event_tx.send(envelope);
    }
    Ok(())
}

/// Accept loop for the command channel. One request/reply per connection;
/// dispatch is serialized through a single async mutex.
async fn command_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    let timeout = env::timeout_ipc();
                    let request = match read_envelope(&mut stream, timeout).await {
                        Ok(request) => request,
                        Err(WireError::ConnectionClosed) => return,
                        Err(WireError::Envelope(vj_bus::BusError::Schema { got, .. })) => {
                            if inner.schema_warnings.lock().first_mismatch("peer", &got) {
                                warn!(worker = %inner.name, version = %got, "dropping envelope with mismatched schema");
                            }
                            return;
                        }
                        Err(e) => {
                            warn!(worker = %inner.name, error = %e, "failed to read command");
                            return;
                        }
                    };

                    let Payload::Command(ref command) = request.payload else {
                        debug!(worker = %inner.name, kind = request.payload.kind(), "non-command on command channel");
                        return;
                    };

                    // Hold the gate through the reply so drain observes the
                    // full exchange, not just the handler.
                    let _guard = inner.dispatch_gate.lock().await;
                    let handle = WorkerHandle {
                        inner: Arc::clone(&inner),
                    };
                    let ack = dispatch_command(&handle, command);
                    let reply = inner.envelope(Payload::Ack(ack));
                    if let Err(e) = write_envelope(&mut stream, &reply, timeout).await {
                        debug!(worker = %inner.name, error = %e, "failed to write ack");
                    }
                });
            }
            Err(e) => {
                warn!(worker = %inner.name, error = %e, "command accept error");
            }
        }
    }
}

/// Route a command to its handler. Uncaught handler errors become error
/// acks plus an error event; they never terminate the worker.
fn dispatch_command(handle: &WorkerHandle, command: &CommandPayload) -> AckPayload {
    let inner = &handle.inner;
    debug!(worker = %inner.name, verb = %command.verb, "dispatching command");

    if let Some(handler) = inner.handlers.get(&command.verb) {
        let result = catch_unwind(AssertUnwindSafe(|| handler(handle, command)));
        return match result {
            Ok(ack) => ack,
            Err(_) => {
                let message = format!("handler for {:?} panicked", command.verb);
                error!(worker = %inner.name, verb = %command.verb, "command handler panicked");
                handle.send_event(
                    EventLevel::Error,
                    "handler_error",
                    [("verb".to_string(), json!(command.verb))]
                        .into_iter()
                        .collect(),
                );
                AckPayload::error(message)
            }
        };
    }

    match command.verb.as_str() {
        "health_check" => {
            let mut result = Map::new();
            result.insert("alive".into(), json!(true));
            result.insert("uptime_sec".into(), json!(inner.uptime_sec()));
            AckPayload::ok().with_result(result)
        }
        "get_state" => {
            let mut result = Map::new();
            result.insert("status".into(), json!(handle.state().as_str()));
            result.insert("uptime_sec".into(), json!(inner.uptime_sec()));
            result.insert("config".into(), Value::Object(inner.config.lock().clone()));
            result.insert("metrics".into(), Value::Object(inner.metrics.lock().clone()));
            AckPayload::ok().with_result(result)
        }
        "set_config" => {
            {
                let mut config = inner.config.lock();
                merge_config(&mut config, &command.data);
            }
            // The callback sees the update map, not the merged config, so it
            // can tell which keys actually changed.
            let restart_required = match &inner.on_config_change {
                Some(callback) => callback(&command.data),
                None => false,
            };
            handle.send_event(
                EventLevel::Info,
                "config_changed",
                [
                    ("config_version".to_string(), json!(command.config_version)),
                    ("restart_required".to_string(), json!(restart_required)),
                ]
                .into_iter()
                .collect(),
            );
            let mut result = Map::new();
            result.insert("restart_required".into(), json!(restart_required));
            AckPayload::ok()
                .applied(&command.config_version)
                .with_result(result)
        }
        "restart" => {
            handle.request_restart();
            AckPayload::ok()
        }
        "shutdown" => {
            handle.request_shutdown();
            AckPayload::ok()
        }
        verb => AckPayload::error(format!("unknown verb {verb:?}")),
    }
}

/// Accept loop for the event channel: each subscriber gets a forwarder task
/// off the broadcast ring.
async fn event_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((mut stream, addr)) => {
                debug!(worker = %inner.name, %addr, "event subscriber connected");
                let mut rx = inner.event_tx.subscribe();
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    loop {
                        let envelope = match rx.recv().await {
                            Ok(envelope) => envelope,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                // High-watermark semantics: oldest discarded
                                debug!(worker = %inner.name, dropped = n, "slow event subscriber lagged");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        if write_envelope(&mut stream, &envelope, env::timeout_ipc())
                            .await
                            .is_err()
                        {
                            debug!(worker = %inner.name, "event subscriber disconnected");
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                warn!(worker = %inner.name, error = %e, "event accept error");
            }
        }
    }
}

/// Heartbeat task: one envelope on the event channel plus a registry refresh
/// per interval. Missing a heartbeat is diagnostic; repeated registry
/// failures crash the worker.
async fn heartbeat_loop(inner: Arc<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;
    loop {
        ticker.tick().await;

        if inner.state.lock().is_terminal() {
            break;
        }

        let metrics = inner.metrics.lock().clone();
        let envelope = inner.envelope(Payload::Heartbeat(HeartbeatPayload {
            uptime_sec: inner.uptime_sec(),
            metrics: metrics.clone(),
        }));
        let _ = inner.event_tx.send(envelope);

        match inner.registry.heartbeat(&inner.name, &metrics) {
            Ok(()) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    worker = %inner.name,
                    error = %e,
                    consecutive_failures,
                    "registry heartbeat failed"
                );
                if consecutive_failures >= HEARTBEAT_FAILURE_BUDGET {
                    error!(worker = %inner.name, "heartbeat failure budget exhausted");
                    inner.request_stop(RunOutcome::Crashed);
                    break;
                }
            }
        }
    }
}

/// Find an unused UDP port by binding to 0 and reading the assignment back.
fn pick_free_udp_port() -> Result<u16, std::io::Error> {
    let socket = UdpSocket::bind("127.0.0.1:0")?;
    Ok(socket.local_addr()?.port())
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
