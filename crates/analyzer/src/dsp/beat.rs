// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Onset detection and tempo tracking.
//!
//! The onset function is the spectral flux already computed per frame; an
//! adaptive threshold over a one-second history picks out local peaks.
//! Inter-onset intervals feed a median-based BPM estimate, folded into the
//! 70–180 range and smoothed with an EMA.

use std::collections::VecDeque;

use super::AudioFeatures;

/// Minimum gap between onsets (seconds). Anything faster is the same hit.
const MIN_ONSET_GAP_SEC: f32 = 0.1;

/// Inter-onset intervals outside this range are ignored for tempo.
const MIN_INTERVAL_SEC: f32 = 0.25;
const MAX_INTERVAL_SEC: f32 = 2.0;

/// Intervals kept for the tempo estimate.
const INTERVAL_HISTORY: usize = 8;

/// Flux must exceed `mean * this + delta` to count as an onset.
const THRESHOLD_RATIO: f32 = 1.5;
const THRESHOLD_DELTA: f32 = 0.05;

/// Beat-energy envelope time constant (seconds).
const ENVELOPE_DECAY_SEC: f32 = 0.18;

/// Folded BPM range.
const BPM_MIN: f32 = 70.0;
const BPM_MAX: f32 = 180.0;

/// EMA factor for BPM smoothing.
const BPM_SMOOTHING: f32 = 0.3;

/// Rising band delta that re-triggers a per-band beat envelope.
const BAND_ATTACK_DELTA: f32 = 0.1;

pub struct BeatTracker {
    frame_rate: f32,
    flux_history: VecDeque<f32>,
    history_capacity: usize,
    prev_flux: f32,
    frames_since_onset: u32,
    min_gap_frames: u32,
    intervals: VecDeque<f32>,
    bpm: f32,
    confidence: f32,
    beat_energy: f32,
    decay: f32,
    band_prev: [f32; 3],
    band_envelopes: [f32; 3],
}

impl BeatTracker {
    pub fn new(frame_rate: f32) -> Self {
        let history_capacity = (frame_rate as usize).max(8);
        BeatTracker {
            frame_rate,
            flux_history: VecDeque::with_capacity(history_capacity),
            history_capacity,
            prev_flux: 0.0,
            frames_since_onset: u32::MAX / 2,
            min_gap_frames: ((frame_rate * MIN_ONSET_GAP_SEC) as u32).max(1),
            intervals: VecDeque::with_capacity(INTERVAL_HISTORY),
            bpm: 0.0,
            confidence: 0.0,
            beat_energy: 0.0,
            decay: (-1.0 / (frame_rate * ENVELOPE_DECAY_SEC)).exp(),
            band_prev: [0.0; 3],
            band_envelopes: [0.0; 3],
        }
    }

    /// Consume one frame's spectral features and fill the beat fields.
    pub fn track(&mut self, features: &mut AudioFeatures) {
        let flux = features.flux;

        let threshold = self.threshold();
        let onset = flux > threshold
            && flux > self.prev_flux
            && self.frames_since_onset >= self.min_gap_frames;

        if onset {
            let interval = self.frames_since_onset as f32 / self.frame_rate;
            if (MIN_INTERVAL_SEC..=MAX_INTERVAL_SEC).contains(&interval) {
                if self.intervals.len() == INTERVAL_HISTORY {
                    self.intervals.pop_front();
                }
                self.intervals.push_back(interval);
                self.update_tempo();
            }
            self.frames_since_onset = 0;
            self.beat_energy = 1.0;
        } else {
            self.frames_since_onset = self.frames_since_onset.saturating_add(1);
            self.beat_energy *= self.decay;
        }

        if self.flux_history.len() == self.history_capacity {
            self.flux_history.pop_front();
        }
        self.flux_history.push_back(flux);
        self.prev_flux = flux;

        // Per-band envelopes: bass, mid, high attack on rising energy
        let inputs = [
            features.bands[1],
            features.bands[3],
            features.bands[5].max(features.bands[6]),
        ];
        for i in 0..3 {
            let delta = inputs[i] - self.band_prev[i];
            if delta > BAND_ATTACK_DELTA {
                self.band_envelopes[i] = inputs[i].clamp(0.0, 1.0);
            } else {
                self.band_envelopes[i] *= self.decay;
            }
            self.band_prev[i] = inputs[i];
        }

        features.beat = onset;
        features.beat_energy = self.beat_energy;
        features.bass_beat = self.band_envelopes[0];
        features.mid_beat = self.band_envelopes[1];
        features.high_beat = self.band_envelopes[2];
        features.bpm = self.bpm;
        features.bpm_confidence = self.confidence;
    }

    fn threshold(&self) -> f32 {
        if self.flux_history.is_empty() {
            return THRESHOLD_DELTA;
        }
        let mean = self.flux_history.iter().sum::<f32>() / self.flux_history.len() as f32;
        mean * THRESHOLD_RATIO + THRESHOLD_DELTA
    }

    fn update_tempo(&mut self) {
        if self.intervals.len() < 3 {
            return;
        }

        let mut sorted: Vec<f32> = self.intervals.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = sorted[sorted.len() / 2];

        let mut bpm = 60.0 / median;
        while bpm < BPM_MIN {
            bpm *= 2.0;
        }
        while bpm >= BPM_MAX {
            bpm /= 2.0;
        }

        self.bpm = if self.bpm == 0.0 {
            bpm
        } else {
            self.bpm + BPM_SMOOTHING * (bpm - self.bpm)
        };

        // Confidence: interval regularity, ramped in by sample count
        let n = sorted.len() as f32;
        let mean = sorted.iter().sum::<f32>() / n;
        let variance = sorted.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / n;
        let relative_std = variance.sqrt() / mean.max(f32::EPSILON);
        let regularity = (1.0 - 3.0 * relative_std).clamp(0.0, 1.0);
        let coverage = (n / 6.0).min(1.0);
        self.confidence = regularity * coverage;
    }
}

#[cfg(test)]
#[path = "beat_tests.rs"]
mod tests;
