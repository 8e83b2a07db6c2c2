// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscription receiver tasks.
//!
//! One task per subscription. Events ride the worker's reliable broadcast
//! channel; telemetry is received by binding the UDP port the worker
//! publishes to. Both reconnect through the registry when the stream falls
//! silent, which is how subscriptions ride out worker restarts.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, warn};

use vj_bus::envelope::{Envelope, Payload, SchemaWarnings, SequenceWatermark};
use vj_bus::wire::{read_envelope, WireError};
use vj_bus::{endpoint, env, BusError};

use crate::client::ClientInner;

/// Cadence at which a silent subscription re-reads the registry.
const WATCHDOG_POLL: Duration = Duration::from_millis(500);

/// Callback for event envelopes. Invoked from the receiver task; must not
/// block for more than a few milliseconds.
pub trait EventHandler: Fn(&Envelope) + Send + Sync + 'static {}
impl<F: Fn(&Envelope) + Send + Sync + 'static> EventHandler for F {}

/// Callback for telemetry envelopes.
pub trait TelemetryHandler: Fn(&Envelope) + Send + Sync + 'static {}
impl<F: Fn(&Envelope) + Send + Sync + 'static> TelemetryHandler for F {}

pub(crate) fn spawn_event_subscription(
    inner: Arc<ClientInner>,
    worker: String,
    handler: Arc<dyn Fn(&Envelope) + Send + Sync>,
) -> tokio::task::JoinHandle<()> {
    let mut stop_rx = inner.stop_rx();
    tokio::spawn(async move {
        let mut watermark = SequenceWatermark::new();
        let mut warnings = SchemaWarnings::new();
        loop {
            if *stop_rx.borrow() {
                return;
            }

            let Some(entry) = live_entry(&inner, &worker) else {
                if wait_or_stop(&mut stop_rx, WATCHDOG_POLL).await {
                    return;
                }
                continue;
            };

            let addr = match endpoint::parse(&entry.event_endpoint) {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(worker, error = %e, "bad event endpoint in registry");
                    if wait_or_stop(&mut stop_rx, WATCHDOG_POLL).await {
                        return;
                    }
                    continue;
                }
            };

            let mut stream = match TcpStream::connect(addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(worker, error = %e, "event connect failed, will retry");
                    if wait_or_stop(&mut stop_rx, WATCHDOG_POLL).await {
                        return;
                    }
                    continue;
                }
            };
            debug!(worker, instance_id = %entry.instance_id, "event subscription connected");

            // Read until the stream drops or goes silent past the stale
            // threshold; either way the watchdog falls back to the registry.
            let silence_limit = inner.registry.stale_after();
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                    result = read_envelope(&mut stream, silence_limit) => {
                        match result {
                            Ok(envelope) => {
                                if envelope.worker != worker {
                                    continue;
                                }
                                if watermark.observe(&envelope).is_ok() {
                                    handler(&envelope);
                                }
                            }
                            Err(WireError::Envelope(BusError::Schema { got, .. })) => {
                                // Drop and keep reading; the peer may carry
                                // mixed traffic during an upgrade
                                if warnings.first_mismatch(&worker, &got) {
                                    warn!(worker, version = %got, "dropping event with mismatched schema");
                                }
                            }
                            Err(e) => {
                                debug!(worker, error = %e, "event stream interrupted, rediscovering");
                                break;
                            }
                        }
                    }
                }
            }
        }
    })
}

pub(crate) fn spawn_telemetry_subscription(
    inner: Arc<ClientInner>,
    worker: String,
    stream_filter: Option<String>,
    handler: Arc<dyn Fn(&Envelope) + Send + Sync>,
) -> tokio::task::JoinHandle<()> {
    let mut stop_rx = inner.stop_rx();
    tokio::spawn(async move {
        let mut watermark = SequenceWatermark::new();
        let mut warnings = SchemaWarnings::new();
        let mut buf = vec![0u8; 65536];
        loop {
            if *stop_rx.borrow() {
                return;
            }

            let Some(entry) = live_entry(&inner, &worker) else {
                if wait_or_stop(&mut stop_rx, WATCHDOG_POLL).await {
                    return;
                }
                continue;
            };

            let addr = match endpoint::parse(&entry.telemetry_endpoint) {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(worker, error = %e, "bad telemetry endpoint in registry");
                    if wait_or_stop(&mut stop_rx, WATCHDOG_POLL).await {
                        return;
                    }
                    continue;
                }
            };

            let socket = match UdpSocket::bind(addr).await {
                Ok(socket) => socket,
                Err(e) => {
                    debug!(worker, error = %e, "telemetry bind failed, will retry");
                    if wait_or_stop(&mut stop_rx, WATCHDOG_POLL).await {
                        return;
                    }
                    continue;
                }
            };
            debug!(worker, %addr, "telemetry subscription listening");

            let silence_limit = inner.registry.stale_after();
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                    result = tokio::time::timeout(silence_limit, socket.recv(&mut buf)) => {
                        match result {
                            Ok(Ok(len)) => {
                                let envelope = match Envelope::decode(&buf[..len]) {
                                    Ok(envelope) => envelope,
                                    Err(BusError::Schema { got, .. }) => {
                                        if warnings.first_mismatch(&worker, &got) {
                                            warn!(worker, version = %got, "dropping telemetry with mismatched schema");
                                        }
                                        continue;
                                    }
                                    Err(e) => {
                                        debug!(worker, error = %e, "dropping malformed telemetry");
                                        continue;
                                    }
                                };
                                if envelope.worker != worker {
                                    continue;
                                }
                                let matches_stream = match (&stream_filter, &envelope.payload) {
                                    (Some(filter), Payload::Telemetry(t)) => t.stream == *filter,
                                    (None, Payload::Telemetry(_)) => true,
                                    _ => false,
                                };
                                if matches_stream && watermark.observe(&envelope).is_ok() {
                                    handler(&envelope);
                                }
                            }
                            Ok(Err(e)) => {
                                debug!(worker, error = %e, "telemetry recv error");
                                break;
                            }
                            Err(_) => {
                                // Silent past the stale threshold; the worker
                                // may have restarted onto a new endpoint.
                                debug!(worker, "telemetry silent, rediscovering");
                                break;
                            }
                        }
                    }
                }
            }
        }
    })
}

fn live_entry(inner: &ClientInner, worker: &str) -> Option<vj_bus::RegistryEntry> {
    let entry = inner.registry.get(worker).ok().flatten()?;
    if inner.registry.is_stale(&entry) {
        return None;
    }
    Some(entry)
}

/// Sleep for `duration` unless stop is requested first. Returns true when
/// the subscription should end.
async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *stop_rx.borrow(),
        _ = stop_rx.changed() => *stop_rx.borrow(),
    }
}

#[cfg(test)]
#[path = "subscribe_tests.rs"]
mod tests;
