// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broadband level measurement and dynamic complexity.

use std::collections::VecDeque;

/// RMS and peak, scaled to [0,1] for full-scale input.
pub struct LevelMeter;

impl LevelMeter {
    pub fn new() -> Self {
        LevelMeter
    }

    pub fn measure(&self, block: &[f32]) -> (f32, f32) {
        let mut sum_squares = 0.0f64;
        let mut peak = 0.0f32;
        for &sample in block {
            sum_squares += f64::from(sample) * f64::from(sample);
            peak = peak.max(sample.abs());
        }
        let rms = (sum_squares / block.len() as f64).sqrt() as f32;
        (rms.min(1.0), peak.min(1.0))
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Short-window standard deviation of loudness, normalized to [0,1].
///
/// Loudness is measured in dB so the deviation tracks perceived dynamics;
/// ~12 dB of deviation maps to 1.0.
pub struct DynamicComplexity {
    window: VecDeque<f32>,
    capacity: usize,
}

/// Window length in seconds.
const COMPLEXITY_WINDOW_SEC: f32 = 2.0;

/// Deviation in dB that maps to full complexity.
const FULL_SCALE_DB: f32 = 12.0;

/// Silence floor in dB.
const FLOOR_DB: f32 = -80.0;

impl DynamicComplexity {
    pub fn new(frame_rate: f32) -> Self {
        let capacity = ((frame_rate * COMPLEXITY_WINDOW_SEC) as usize).max(4);
        DynamicComplexity {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Feed one frame's RMS; returns the current normalized deviation.
    pub fn observe(&mut self, rms: f32) -> f32 {
        let db = if rms > 0.0 {
            (20.0 * rms.log10()).max(FLOOR_DB)
        } else {
            FLOOR_DB
        };
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(db);

        if self.window.len() < 4 {
            return 0.0;
        }

        let n = self.window.len() as f32;
        let mean = self.window.iter().sum::<f32>() / n;
        let variance = self
            .window
            .iter()
            .map(|&x| (x - mean) * (x - mean))
            .sum::<f32>()
            / n;
        (variance.sqrt() / FULL_SCALE_DB).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
#[path = "levels_tests.rs"]
mod tests;
