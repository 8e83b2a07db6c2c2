// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Envelope decoding errors.

use thiserror::Error;

/// Errors produced by the envelope codec.
///
/// Decoders never panic on hostile input; every failure mode is a variant
/// here. `Schema` and `UnknownType` mean the peer speaks a different dialect;
/// `Malformed` means the bytes are not a valid envelope at all.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("schema version mismatch: got {got:?}, expected {expected:?}")]
    Schema { got: String, expected: String },

    #[error("unknown message type: {0:?}")]
    UnknownType(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("stale sequence {sequence} for {worker}/{instance_id} (watermark {watermark})")]
    StaleSequence {
        worker: String,
        instance_id: String,
        sequence: u64,
        watermark: u64,
    },
}

impl BusError {
    /// Malformed-envelope error for a missing required field.
    pub fn missing(field: &str) -> Self {
        BusError::Malformed(format!("missing required field {field:?}"))
    }

    /// Malformed-envelope error for a field of the wrong type.
    pub fn bad_type(field: &str, expected: &str) -> Self {
        BusError::Malformed(format!("field {field:?} is not a {expected}"))
    }
}
