// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bus client: discovery and request/reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use vj_bus::envelope::{AckPayload, CommandPayload, Envelope, Payload};
use vj_bus::registry::{Registry, RegistryEntry, RegistryError};
use vj_bus::wire::{read_envelope, write_envelope, WireError};
use vj_bus::{endpoint, env, BusError};

use crate::subscribe::{self, EventHandler, TelemetryHandler};

/// Transient-transport retry budget for `send_command`: 3 attempts within
/// one second total.
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BUDGET: Duration = Duration::from_secs(1);

/// Client errors. Application-level error acks are *returned*, not raised;
/// these variants are the transport-level failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no live registry entry for worker {0:?}")]
    NotFound(String),

    #[error("timed out waiting for ack from {0:?}")]
    Timeout(String),

    #[error("transport error talking to {worker:?}: {message}")]
    Transport { worker: String, message: String },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Envelope(#[from] BusError),

    #[error("endpoint error: {0}")]
    Endpoint(#[from] endpoint::EndpointError),

    #[error("could not determine state directory")]
    NoStateDir,
}

/// A bus client with its own identity on the wire.
///
/// Cheap to clone; subscriptions started from any clone are stopped by
/// [`BusClient::stop`] on any other.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) name: String,
    pub(crate) instance_id: String,
    pub(crate) sequence: AtomicU64,
    pub(crate) registry: Registry,
    pub(crate) stop_tx: watch::Sender<bool>,
    pub(crate) tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ClientInner {
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }
}

impl BusClient {
    /// Create a client resolving the registry from the environment.
    pub fn new(name: impl Into<String>) -> Result<Self, ClientError> {
        let dir = env::registry_dir().ok_or(ClientError::NoStateDir)?;
        let registry = Registry::with_heartbeat_interval(dir, env::heartbeat_interval())?;
        Ok(Self::with_registry(name, registry))
    }

    /// Create a client over an explicit registry (tests, embedded use).
    pub fn with_registry(name: impl Into<String>, registry: Registry) -> Self {
        let (stop_tx, _) = watch::channel(false);
        BusClient {
            inner: Arc::new(ClientInner {
                name: name.into(),
                instance_id: uuid::Uuid::new_v4().to_string(),
                sequence: AtomicU64::new(0),
                registry,
                stop_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Scan the registry. Stale records are omitted unless asked for.
    pub fn discover_workers(
        &self,
        include_stale: bool,
    ) -> Result<HashMap<String, RegistryEntry>, ClientError> {
        Ok(self.inner.registry.discover(include_stale)?)
    }

    /// Look up a single worker, applying the staleness filter.
    pub fn find_worker(&self, worker: &str) -> Result<RegistryEntry, ClientError> {
        let entry = self
            .inner
            .registry
            .get(worker)?
            .ok_or_else(|| ClientError::NotFound(worker.to_string()))?;
        if self.inner.registry.is_stale(&entry) {
            return Err(ClientError::NotFound(worker.to_string()));
        }
        Ok(entry)
    }

    /// Send a command and wait for its ack.
    ///
    /// Transient transport errors are retried up to 3 times within a one
    /// second budget; application-level error acks are returned as-is. A
    /// zero timeout returns [`ClientError::Timeout`] without sending.
    pub async fn send_command(
        &self,
        worker: &str,
        verb: &str,
        data: Map<String, Value>,
        config_version: &str,
        timeout: Duration,
    ) -> Result<AckPayload, ClientError> {
        if timeout.is_zero() {
            return Err(ClientError::Timeout(worker.to_string()));
        }

        let entry = self.find_worker(worker)?;
        let addr = endpoint::parse(&entry.command_endpoint)?;

        let deadline = Instant::now() + timeout;
        let mut stream = self.connect_with_retry(worker, addr).await?;

        let command = Envelope::new(
            &self.inner.name,
            &self.inner.instance_id,
            0,
            self.inner.next_sequence(),
            Payload::Command(CommandPayload {
                verb: verb.to_string(),
                config_version: config_version.to_string(),
                data,
            }),
        );

        let remaining = deadline.saturating_duration_since(Instant::now());
        write_envelope(&mut stream, &command, remaining)
            .await
            .map_err(|e| self.map_wire_error(worker, e))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let reply = read_envelope(&mut stream, remaining)
            .await
            .map_err(|e| self.map_wire_error(worker, e))?;

        match reply.payload {
            Payload::Ack(ack) => Ok(ack),
            other => Err(ClientError::Transport {
                worker: worker.to_string(),
                message: format!("expected ack, got {}", other.kind()),
            }),
        }
    }

    /// Subscribe to a worker's event channel.
    ///
    /// The handler is invoked from the receiver task for every envelope the
    /// worker publishes; it must not block. The subscription survives worker
    /// restarts: a watchdog re-reads the registry whenever the stream goes
    /// silent or drops, and reconnects to the new instance transparently.
    pub fn subscribe_events(&self, worker: &str, handler: impl EventHandler) {
        let task = subscribe::spawn_event_subscription(
            Arc::clone(&self.inner),
            worker.to_string(),
            Arc::new(handler),
        );
        self.inner.tasks.lock().push(task);
    }

    /// Subscribe to a worker's telemetry stream(s).
    ///
    /// With `stream: Some(name)`, only matching envelopes reach the handler.
    pub fn subscribe_telemetry(
        &self,
        worker: &str,
        stream: Option<String>,
        handler: impl TelemetryHandler,
    ) {
        let task = subscribe::spawn_telemetry_subscription(
            Arc::clone(&self.inner),
            worker.to_string(),
            stream,
            Arc::new(handler),
        );
        self.inner.tasks.lock().push(task);
    }

    /// Cancel all subscriptions and join their receiver tasks.
    pub async fn stop(&self) {
        let _ = self.inner.stop_tx.send(true);
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    async fn connect_with_retry(
        &self,
        worker: &str,
        addr: std::net::SocketAddr,
    ) -> Result<TcpStream, ClientError> {
        let started = Instant::now();
        let mut last_error = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(worker, attempt, error = %e, "connect attempt failed");
                    last_error = e.to_string();
                }
            }
            if started.elapsed() >= CONNECT_BUDGET || attempt == CONNECT_ATTEMPTS {
                break;
            }
            tokio::time::sleep(env::poll_interval()).await;
        }
        Err(ClientError::Transport {
            worker: worker.to_string(),
            message: last_error,
        })
    }

    fn map_wire_error(&self, worker: &str, error: WireError) -> ClientError {
        match error {
            WireError::Timeout => ClientError::Timeout(worker.to_string()),
            WireError::Envelope(e) => ClientError::Envelope(e),
            other => ClientError::Transport {
                worker: worker.to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
