// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Buildup and drop detection for EDM-style structure.
//!
//! Buildup: a rising energy trend over a sliding window (linear regression
//! slope, normalized to [-1,1]). Drop: sustained high spectral flux that
//! collapses while broadband energy stays high.

use std::collections::VecDeque;

use super::AudioFeatures;

/// Energy trend window (seconds).
const TREND_WINDOW_SEC: f32 = 4.0;

/// Energy slope (units per second) that maps to trend = 1.
const FULL_SLOPE_PER_SEC: f32 = 0.2;

/// Trend above which a buildup is flagged.
const BUILDUP_TREND: f32 = 0.3;

/// Flux EMA factors: fast follows the frame, slow is the sustained picture.
const FLUX_FAST_ALPHA: f32 = 0.3;
const FLUX_SLOW_ALPHA: f32 = 0.02;

/// Sustained flux level that arms the drop detector.
const DROP_ARM_FLUX: f32 = 0.3;

/// Fast flux must fall under this fraction of the sustained level.
const DROP_COLLAPSE_RATIO: f32 = 0.5;

/// Broadband energy floor for a drop.
const DROP_MIN_ENERGY: f32 = 0.4;

/// Refractory period after a drop (seconds).
const DROP_COOLDOWN_SEC: f32 = 2.0;

pub struct StructureDetector {
    frame_rate: f32,
    energy_window: VecDeque<f32>,
    window_capacity: usize,
    flux_fast: f32,
    flux_slow: f32,
    cooldown_frames: u32,
}

impl StructureDetector {
    pub fn new(frame_rate: f32) -> Self {
        let window_capacity = ((frame_rate * TREND_WINDOW_SEC) as usize).max(8);
        StructureDetector {
            frame_rate,
            energy_window: VecDeque::with_capacity(window_capacity),
            window_capacity,
            flux_fast: 0.0,
            flux_slow: 0.0,
            cooldown_frames: 0,
        }
    }

    /// Consume one frame's features and fill the structure fields.
    pub fn observe(&mut self, features: &mut AudioFeatures) {
        let energy = features.bands[super::BAND_COUNT - 1];

        if self.energy_window.len() == self.window_capacity {
            self.energy_window.pop_front();
        }
        self.energy_window.push_back(energy);

        features.trend = self.trend();
        features.buildup =
            features.trend > BUILDUP_TREND && self.energy_window.len() >= self.window_capacity / 2;

        // Drop: armed by sustained flux, fired by its collapse at high energy
        let was_armed = self.flux_slow > DROP_ARM_FLUX;
        self.flux_fast += FLUX_FAST_ALPHA * (features.flux - self.flux_fast);
        self.flux_slow += FLUX_SLOW_ALPHA * (features.flux - self.flux_slow);

        let collapsed = self.flux_fast < self.flux_slow * DROP_COLLAPSE_RATIO;
        if self.cooldown_frames > 0 {
            self.cooldown_frames -= 1;
            features.drop = false;
        } else if was_armed && collapsed && energy > DROP_MIN_ENERGY {
            features.drop = true;
            self.cooldown_frames = (self.frame_rate * DROP_COOLDOWN_SEC) as u32;
        } else {
            features.drop = false;
        }
    }

    /// Least-squares slope of the energy window, normalized to [-1,1].
    fn trend(&self) -> f32 {
        let n = self.energy_window.len();
        if n < 8 {
            return 0.0;
        }

        let dt = 1.0 / self.frame_rate;
        let n_f = n as f32;
        let mean_x = (n_f - 1.0) / 2.0 * dt;
        let mean_y = self.energy_window.iter().sum::<f32>() / n_f;

        let mut covariance = 0.0;
        let mut variance = 0.0;
        for (i, &y) in self.energy_window.iter().enumerate() {
            let dx = i as f32 * dt - mean_x;
            covariance += dx * (y - mean_y);
            variance += dx * dx;
        }
        if variance <= f32::EPSILON {
            return 0.0;
        }

        let slope = covariance / variance;
        (slope / FULL_SLOPE_PER_SEC).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
#[path = "structure_tests.rs"]
mod tests;
