// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Endpoint string helpers.
//!
//! Registry entries carry endpoints as `tcp://host:port` / `udp://host:port`
//! strings. Everything runs on one machine, so hosts are always loopback.

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("endpoint {0:?} has no scheme prefix")]
    MissingScheme(String),

    #[error("endpoint {0:?} has an invalid address: {1}")]
    BadAddress(String, std::net::AddrParseError),
}

/// Format a loopback TCP endpoint string.
pub fn tcp(port: u16) -> String {
    format!("tcp://127.0.0.1:{port}")
}

/// Format a loopback UDP endpoint string.
pub fn udp(port: u16) -> String {
    format!("udp://127.0.0.1:{port}")
}

/// Parse an endpoint string into a socket address, ignoring the scheme.
pub fn parse(endpoint: &str) -> Result<SocketAddr, EndpointError> {
    let rest = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| EndpointError::MissingScheme(endpoint.to_string()))?;
    rest.parse()
        .map_err(|e| EndpointError::BadAddress(endpoint.to_string(), e))
}

#[cfg(test)]
#[path = "endpoint_tests.rs"]
mod tests;
