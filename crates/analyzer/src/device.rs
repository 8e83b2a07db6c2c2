// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Input device enumeration and selection.

use cpal::traits::{DeviceTrait, HostTrait};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no input devices available")]
    NoDevice,

    #[error("no input device at index {0}")]
    BadIndex(usize),

    #[error("could not enumerate input devices: {0}")]
    Enumerate(String),
}

/// How to pick the capture device. Priority: explicit index, then name
/// substring match, then the system default.
#[derive(Debug, Clone, Default)]
pub struct DeviceSelection {
    pub index: Option<usize>,
    pub name: Option<String>,
}

/// Names of all input devices, in enumeration order.
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices
            .map(|d| d.name().unwrap_or_else(|_| "<unknown>".into()))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Resolve a selection to a concrete device and its name.
pub fn select_input_device(
    selection: &DeviceSelection,
) -> Result<(cpal::Device, String), DeviceError> {
    let host = cpal::default_host();

    if let Some(index) = selection.index {
        let device = host
            .input_devices()
            .map_err(|e| DeviceError::Enumerate(e.to_string()))?
            .nth(index)
            .ok_or(DeviceError::BadIndex(index))?;
        let name = device.name().unwrap_or_else(|_| format!("#{index}"));
        debug!(index, %name, "selected input device by index");
        return Ok((device, name));
    }

    if let Some(wanted) = &selection.name {
        let wanted_lower = wanted.to_lowercase();
        let devices = host
            .input_devices()
            .map_err(|e| DeviceError::Enumerate(e.to_string()))?;
        for device in devices {
            let name = match device.name() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.to_lowercase().contains(&wanted_lower) {
                debug!(%name, preference = %wanted, "selected input device by name");
                return Ok((device, name));
            }
        }
        debug!(preference = %wanted, "no name match, falling back to default device");
    }

    let device = host.default_input_device().ok_or(DeviceError::NoDevice)?;
    let name = device.name().unwrap_or_else(|_| "<default>".into());
    Ok((device, name))
}
