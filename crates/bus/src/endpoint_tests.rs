// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Endpoint helper tests

use super::*;

#[test]
fn format_and_parse_roundtrip() {
    let addr = parse(&tcp(5051)).unwrap();
    assert_eq!(addr.port(), 5051);
    assert!(addr.ip().is_loopback());

    let addr = parse(&udp(5052)).unwrap();
    assert_eq!(addr.port(), 5052);
}

#[test]
fn missing_scheme_is_an_error() {
    assert!(matches!(
        parse("127.0.0.1:80"),
        Err(EndpointError::MissingScheme(_))
    ));
}

#[test]
fn garbage_address_is_an_error() {
    assert!(matches!(
        parse("tcp://not-an-addr"),
        Err(EndpointError::BadAddress(..))
    ));
}
