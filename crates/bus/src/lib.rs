// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! vj-bus: message fabric primitives for the VJ control plane.
//!
//! Every process on the bus speaks the same self-describing envelope format
//! over three channels (command, event, telemetry) and announces itself in a
//! file-backed registry. This crate holds the pieces shared by all of them:
//! the envelope codec, the length-prefixed wire framing, the registry, and
//! environment resolution.

pub mod endpoint;
pub mod env;
pub mod envelope;
pub mod error;
pub mod registry;
pub mod time;
pub mod wire;

pub use envelope::{
    AckPayload, AckStatus, CommandPayload, Envelope, EventLevel, EventPayload, HeartbeatPayload,
    Payload, SchemaWarnings, SequenceWatermark, TelemetryPayload, SCHEMA_VERSION,
};
pub use error::BusError;
pub use registry::{Registry, RegistryEntry, RegistryError, WorkerStatus};
pub use wire::{read_envelope, write_envelope, WireError, MAX_FRAME_SIZE};
