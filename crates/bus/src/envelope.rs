// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The envelope: the uniform self-describing message crossing every channel.
//!
//! Wire format: one JSON object per message. The `type` field selects the
//! payload shape. Unknown top-level fields are preserved and re-emitted on
//! encode (forward compatibility); missing required fields and unknown
//! `type` values fail fast with a typed error.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BusError;
use crate::time::now_nanos;

/// Schema version spoken by this build. Mismatches are dropped, never
/// partially parsed.
pub const SCHEMA_VERSION: &str = "vj.v1";

/// Ack status returned by command handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Error,
    Pending,
}

/// Severity of an event-channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

/// Payload of a `command` envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandPayload {
    pub verb: String,
    /// Opaque token the handler must echo back in its ack when it applied a
    /// configuration change.
    #[serde(default)]
    pub config_version: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Payload of an `ack` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub status: AckStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub applied_config_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
}

impl AckPayload {
    /// Successful ack with no result data.
    pub fn ok() -> Self {
        AckPayload {
            status: AckStatus::Ok,
            message: String::new(),
            applied_config_version: String::new(),
            result: None,
        }
    }

    /// Error ack with a message.
    pub fn error(message: impl Into<String>) -> Self {
        AckPayload {
            status: AckStatus::Error,
            message: message.into(),
            applied_config_version: String::new(),
            result: None,
        }
    }

    /// Pending ack for work a handler offloaded; completion arrives as a
    /// follow-up event.
    pub fn pending(message: impl Into<String>) -> Self {
        AckPayload {
            status: AckStatus::Pending,
            message: message.into(),
            applied_config_version: String::new(),
            result: None,
        }
    }

    /// Attach a result map.
    pub fn with_result(mut self, result: Map<String, Value>) -> Self {
        self.result = Some(result);
        self
    }

    /// Echo an applied config version.
    pub fn applied(mut self, config_version: impl Into<String>) -> Self {
        self.applied_config_version = config_version.into();
        self
    }
}

/// Payload of a `telemetry` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Per-worker stream namespace, e.g. `features` or `counter`.
    pub stream: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Payload of an `event` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub level: EventLevel,
    pub message: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Payload of a `heartbeat` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub uptime_sec: f64,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

/// Envelope payload, tagged by the top-level `type` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Command(CommandPayload),
    Ack(AckPayload),
    Telemetry(TelemetryPayload),
    Event(EventPayload),
    Heartbeat(HeartbeatPayload),
}

impl Payload {
    /// Wire name of this payload's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Command(_) => "command",
            Payload::Ack(_) => "ack",
            Payload::Telemetry(_) => "telemetry",
            Payload::Event(_) => "event",
            Payload::Heartbeat(_) => "heartbeat",
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Payload::Command(p) => serde_json::to_value(p),
            Payload::Ack(p) => serde_json::to_value(p),
            Payload::Telemetry(p) => serde_json::to_value(p),
            Payload::Event(p) => serde_json::to_value(p),
            Payload::Heartbeat(p) => serde_json::to_value(p),
        }
    }

    fn from_value(kind: &str, value: Value) -> Result<Self, BusError> {
        let malformed = |e: serde_json::Error| BusError::Malformed(format!("payload: {e}"));
        match kind {
            "command" => Ok(Payload::Command(
                serde_json::from_value(value).map_err(malformed)?,
            )),
            "ack" => Ok(Payload::Ack(
                serde_json::from_value(value).map_err(malformed)?,
            )),
            "telemetry" => Ok(Payload::Telemetry(
                serde_json::from_value(value).map_err(malformed)?,
            )),
            "event" => Ok(Payload::Event(
                serde_json::from_value(value).map_err(malformed)?,
            )),
            "heartbeat" => Ok(Payload::Heartbeat(
                serde_json::from_value(value).map_err(malformed)?,
            )),
            other => Err(BusError::UnknownType(other.to_string())),
        }
    }
}

/// One message on the bus.
///
/// `(worker, instance_id, sequence)` is unique; `sequence` is strictly
/// monotonic within an instance and assigned by the worker runtime on send,
/// never by callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub schema_version: String,
    pub worker: String,
    pub instance_id: String,
    pub generation: u64,
    pub sequence: u64,
    /// Wall-clock nanoseconds since the Unix epoch.
    pub timestamp: u64,
    pub payload: Payload,
    /// Unknown top-level fields from the wire, preserved verbatim.
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Build an envelope stamped with the current wall clock.
    pub fn new(
        worker: impl Into<String>,
        instance_id: impl Into<String>,
        generation: u64,
        sequence: u64,
        payload: Payload,
    ) -> Self {
        Envelope {
            schema_version: SCHEMA_VERSION.to_string(),
            worker: worker.into(),
            instance_id: instance_id.into(),
            generation,
            sequence,
            timestamp: now_nanos(),
            payload,
            extra: Map::new(),
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        let mut obj = self.extra.clone();
        obj.insert(
            "schema_version".into(),
            Value::String(self.schema_version.clone()),
        );
        obj.insert("type".into(), Value::String(self.payload.kind().into()));
        obj.insert("worker".into(), Value::String(self.worker.clone()));
        obj.insert(
            "instance_id".into(),
            Value::String(self.instance_id.clone()),
        );
        obj.insert("generation".into(), Value::from(self.generation));
        obj.insert("sequence".into(), Value::from(self.sequence));
        obj.insert("timestamp".into(), Value::from(self.timestamp));
        let payload = self
            .payload
            .to_value()
            .map_err(|e| BusError::Malformed(format!("payload: {e}")))?;
        obj.insert("payload".into(), payload);
        serde_json::to_vec(&Value::Object(obj)).map_err(|e| BusError::Malformed(e.to_string()))
    }

    /// Parse the JSON wire form.
    ///
    /// Validation is positive: required fields must be present with the
    /// right types, `type` must be known, and the schema version must match
    /// exactly. Anything else is preserved in [`Envelope::extra`].
    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| BusError::Malformed(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(BusError::Malformed("not a JSON object".into()));
        };

        let schema_version = take_string(&mut obj, "schema_version")?;
        if schema_version != SCHEMA_VERSION {
            return Err(BusError::Schema {
                got: schema_version,
                expected: SCHEMA_VERSION.to_string(),
            });
        }

        let kind = take_string(&mut obj, "type")?;
        let worker = take_string(&mut obj, "worker")?;
        let instance_id = take_string(&mut obj, "instance_id")?;
        let generation = take_u64(&mut obj, "generation")?;
        let sequence = take_u64(&mut obj, "sequence")?;
        let timestamp = take_u64(&mut obj, "timestamp")?;
        let payload_value = obj
            .remove("payload")
            .ok_or_else(|| BusError::missing("payload"))?;
        let payload = Payload::from_value(&kind, payload_value)?;

        Ok(Envelope {
            schema_version,
            worker,
            instance_id,
            generation,
            sequence,
            timestamp,
            payload,
            extra: obj,
        })
    }

    /// Parse and check sequence monotonicity against a caller-held watermark.
    pub fn decode_with_watermark(
        bytes: &[u8],
        watermark: &mut SequenceWatermark,
    ) -> Result<Self, BusError> {
        let envelope = Self::decode(bytes)?;
        watermark.observe(&envelope)?;
        Ok(envelope)
    }
}

fn take_string(obj: &mut Map<String, Value>, field: &str) -> Result<String, BusError> {
    match obj.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(BusError::bad_type(field, "string")),
        None => Err(BusError::missing(field)),
    }
}

fn take_u64(obj: &mut Map<String, Value>, field: &str) -> Result<u64, BusError> {
    match obj.remove(field) {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| BusError::bad_type(field, "u64")),
        Some(_) => Err(BusError::bad_type(field, "u64")),
        None => Err(BusError::missing(field)),
    }
}

/// Tracks the highest sequence seen per `(worker, instance_id)`.
///
/// A fresh instance id resets the expectation; a repeated or lower sequence
/// from a known instance is a stale-sequence error.
#[derive(Debug, Default)]
pub struct SequenceWatermark {
    last: HashMap<(String, String), u64>,
}

impl SequenceWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an envelope, rejecting non-monotonic sequences.
    pub fn observe(&mut self, envelope: &Envelope) -> Result<(), BusError> {
        let key = (envelope.worker.clone(), envelope.instance_id.clone());
        match self.last.get(&key) {
            Some(&watermark) if envelope.sequence <= watermark => Err(BusError::StaleSequence {
                worker: envelope.worker.clone(),
                instance_id: envelope.instance_id.clone(),
                sequence: envelope.sequence,
                watermark,
            }),
            _ => {
                self.last.insert(key, envelope.sequence);
                Ok(())
            }
        }
    }
}

/// Deduplicates schema-mismatch warnings per `(worker, version)` pair.
///
/// The first mismatch from a peer is worth a log line; the 60-per-second
/// repeats from a high-rate telemetry stream are not.
#[derive(Debug, Default)]
pub struct SchemaWarnings {
    seen: HashSet<(String, String)>,
}

impl SchemaWarnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time this `(worker, version)` pair is seen.
    pub fn first_mismatch(&mut self, worker: &str, version: &str) -> bool {
        self.seen.insert((worker.to_string(), version.to_string()))
    }
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
