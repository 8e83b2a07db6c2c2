// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Legacy OSC surface for existing visual consumers.
//!
//! These addresses and argument layouts are a bit-exact contract; renderers
//! in the field parse them positionally. New consumers should use the
//! `features` telemetry stream instead.

use std::net::UdpSocket;

use rosc::{encoder, OscMessage, OscPacket, OscType};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::dsp::AudioFeatures;

#[derive(Debug, Error)]
pub enum OscError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OSC encoding error: {0}")]
    Encode(#[from] rosc::OscError),
}

/// Fire-and-forget OSC sender over UDP.
pub struct OscSender {
    socket: UdpSocket,
}

impl OscSender {
    pub fn connect(host: &str, port: u16) -> Result<Self, OscError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((host, port))?;
        Ok(OscSender { socket })
    }

    /// Send the full per-frame message set. Send failures are logged and
    /// dropped; the analyzer never blocks on a slow consumer.
    pub fn send_features(&self, features: &AudioFeatures) {
        for message in feature_messages(features) {
            let packet = OscPacket::Message(message);
            match encoder::encode(&packet) {
                Ok(bytes) => {
                    if let Err(e) = self.socket.send(&bytes) {
                        debug!(error = %e, "OSC send failed");
                    }
                }
                Err(e) => debug!(error = %e, "OSC encode failed"),
            }
        }
    }
}

fn floats(values: &[f32]) -> Vec<OscType> {
    values.iter().map(|&v| OscType::Float(v)).collect()
}

fn flag(value: bool) -> f32 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// The per-frame message set, in the order it goes on the wire.
pub fn feature_messages(features: &AudioFeatures) -> Vec<OscMessage> {
    let mut messages = vec![
        OscMessage {
            addr: "/audio/levels".into(),
            args: floats(&features.bands),
        },
        OscMessage {
            addr: "/audio/spectrum".into(),
            args: floats(&features.spectrum),
        },
        OscMessage {
            addr: "/audio/beats".into(),
            args: floats(&[
                flag(features.beat),
                features.beat_energy,
                features.bass_beat,
                features.mid_beat,
                features.high_beat,
            ]),
        },
        OscMessage {
            addr: "/audio/bpm".into(),
            args: floats(&[features.bpm, features.bpm_confidence]),
        },
        OscMessage {
            addr: "/audio/pitch".into(),
            args: floats(&[features.pitch_hz, features.pitch_confidence]),
        },
        OscMessage {
            addr: "/audio/spectral".into(),
            args: floats(&[features.centroid, features.rolloff_hz, features.flux]),
        },
        OscMessage {
            addr: "/audio/structure".into(),
            args: floats(&[
                flag(features.buildup),
                flag(features.drop),
                features.trend,
                features.centroid,
            ]),
        },
    ];

    // Single-value convenience addresses
    let singles: [(&str, f32); 12] = [
        ("/beat", flag(features.beat)),
        ("/bpm", features.bpm),
        ("/energy", features.bands[7]),
        ("/brightness", features.centroid),
        ("/noisiness", features.noisiness),
        ("/bass_band", features.bands[1]),
        ("/mid_band", features.bands[3]),
        ("/high_band", features.bands[5]),
        ("/beat_energy", features.beat_energy),
        ("/beat_energy_low", features.bass_beat),
        ("/beat_energy_high", features.high_beat),
        ("/dynamic_complexity", features.dynamic_complexity),
    ];
    for (addr, value) in singles {
        messages.push(OscMessage {
            addr: addr.into(),
            args: vec![OscType::Float(value)],
        });
    }

    messages
}

/// Flatten features into the `features` telemetry payload.
pub fn feature_telemetry(features: &AudioFeatures) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("rms".into(), json!(features.rms));
    data.insert("peak".into(), json!(features.peak));
    data.insert(
        "bands".into(),
        Value::Array(features.bands.iter().map(|&b| json!(b)).collect()),
    );
    data.insert(
        "spectrum".into(),
        Value::Array(features.spectrum.iter().map(|&s| json!(s)).collect()),
    );
    data.insert("centroid".into(), json!(features.centroid));
    data.insert("rolloff_hz".into(), json!(features.rolloff_hz));
    data.insert("flux".into(), json!(features.flux));
    data.insert("noisiness".into(), json!(features.noisiness));
    data.insert("beat".into(), json!(features.beat));
    data.insert("beat_energy".into(), json!(features.beat_energy));
    data.insert("bass_beat".into(), json!(features.bass_beat));
    data.insert("mid_beat".into(), json!(features.mid_beat));
    data.insert("high_beat".into(), json!(features.high_beat));
    data.insert("bpm".into(), json!(features.bpm));
    data.insert("bpm_confidence".into(), json!(features.bpm_confidence));
    data.insert("pitch_hz".into(), json!(features.pitch_hz));
    data.insert(
        "pitch_confidence".into(),
        json!(features.pitch_confidence),
    );
    data.insert("buildup".into(), json!(features.buildup));
    data.insert("drop".into(), json!(features.drop));
    data.insert("trend".into(), json!(features.trend));
    data.insert(
        "dynamic_complexity".into(),
        json!(features.dynamic_complexity),
    );
    data
}

#[cfg(test)]
#[path = "osc_tests.rs"]
mod tests;
