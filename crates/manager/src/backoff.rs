// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Restart backoff schedule.

use std::time::Duration;

/// First restart delay.
pub const INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Ceiling for the doubling schedule.
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// A run at least this long resets the failure streak.
pub const STABLE_RUN: Duration = Duration::from_secs(60);

/// Delay before restart attempt number `consecutive_failures` (1-based):
/// 1 s doubling to a 30 s cap.
pub fn restart_delay(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    let delay = INITIAL_DELAY * 2u32.saturating_pow(exponent);
    delay.min(MAX_DELAY)
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
