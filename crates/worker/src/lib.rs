// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! vj-worker: the library that turns an ordinary process into a well-behaved
//! bus citizen.
//!
//! A worker binds three channels (command request/reply over loopback TCP,
//! event broadcast over loopback TCP, telemetry over UDP), writes its
//! registry record, heartbeats in the background, and routes commands to
//! per-verb handlers. Workers never restart themselves; they exit with a
//! code the process manager interprets.

pub mod config;
pub mod logging;
pub mod runtime;
pub mod state;

pub use config::{load_initial_config, merge_config};
pub use runtime::{
    RunOutcome, RuntimeError, WorkerBuilder, WorkerHandle, WorkerRuntime, RESTART_EXIT_CODE,
};
pub use state::WorkerState;
