// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Windowed FFT spectrum, perceptual bands, and spectral descriptors.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use super::{AudioFeatures, BAND_COUNT, SPECTRUM_BINS};

/// Perceptual band edges in Hz: sub-bass, bass, low-mid, mid, high-mid,
/// presence, air. The eighth band is the overall average.
const BAND_EDGES: [(f32, f32); 7] = [
    (20.0, 60.0),
    (60.0, 250.0),
    (250.0, 500.0),
    (500.0, 2_000.0),
    (2_000.0, 4_000.0),
    (4_000.0, 6_000.0),
    (6_000.0, 20_000.0),
];

/// Fraction of spectral energy under the rolloff frequency.
const ROLLOFF_FRACTION: f32 = 0.85;

/// FFT magnitude spectrum over a Hann-windowed, zero-padded block.
///
/// Magnitudes are normalized so a full-scale sine reports ≈ its amplitude
/// in its band, which keeps every downstream feature in [0,1] without
/// per-feature calibration.
pub struct SpectrumAnalyzer {
    sample_rate: u32,
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// 2 / sum(window): peak-bin magnitude → sine amplitude.
    scale: f32,
    scratch: Vec<Complex<f32>>,
    buffer: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
    prev_magnitudes: Vec<f32>,
    band_bins: [(usize, usize); 7],
    have_prev: bool,
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate: u32, block_size: usize) -> Self {
        let fft_size = block_size.next_power_of_two();
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        // Hann window over the block (the zero-padded tail stays zero)
        let window: Vec<f32> = (0..block_size)
            .map(|i| {
                let phase = std::f32::consts::TAU * i as f32 / block_size as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();
        let window_sum: f32 = window.iter().sum();
        let scale = 2.0 / window_sum.max(f32::EPSILON);

        let bin_count = fft_size / 2;
        let hz_per_bin = sample_rate as f32 / fft_size as f32;
        let mut band_bins = [(0usize, 0usize); 7];
        for (i, (lo, hi)) in BAND_EDGES.iter().enumerate() {
            let lo_bin = (lo / hz_per_bin).ceil() as usize;
            let hi_bin = ((hi / hz_per_bin).floor() as usize).min(bin_count.saturating_sub(1));
            band_bins[i] = (lo_bin.min(hi_bin), hi_bin);
        }

        let scratch_len = fft.get_inplace_scratch_len();
        SpectrumAnalyzer {
            sample_rate,
            fft_size,
            fft,
            window,
            scale,
            scratch: vec![Complex::default(); scratch_len],
            buffer: vec![Complex::default(); fft_size],
            magnitudes: vec![0.0; bin_count],
            prev_magnitudes: vec![0.0; bin_count],
            band_bins,
            have_prev: false,
        }
    }

    /// Compute the magnitude spectrum of `block` and fill the spectral
    /// fields of `features`.
    pub fn analyze(&mut self, block: &[f32], features: &mut AudioFeatures) {
        let n = block.len().min(self.window.len());
        for i in 0..n {
            self.buffer[i] = Complex::new(block[i] * self.window[i], 0.0);
        }
        for slot in self.buffer.iter_mut().skip(n) {
            *slot = Complex::default();
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        std::mem::swap(&mut self.magnitudes, &mut self.prev_magnitudes);
        for (i, magnitude) in self.magnitudes.iter_mut().enumerate() {
            *magnitude = (self.buffer[i].norm() * self.scale).min(1.0);
        }

        self.fill_bands(features);
        self.fill_display_spectrum(features);
        self.fill_descriptors(features);
        self.have_prev = true;
    }

    fn fill_bands(&self, features: &mut AudioFeatures) {
        let mut sum = 0.0;
        for (i, &(lo, hi)) in self.band_bins.iter().enumerate() {
            let peak = self.magnitudes[lo..=hi]
                .iter()
                .fold(0.0f32, |acc, &m| acc.max(m));
            features.bands[i] = peak;
            sum += peak;
        }
        features.bands[BAND_COUNT - 1] = sum / (BAND_COUNT - 1) as f32;
    }

    fn fill_display_spectrum(&self, features: &mut AudioFeatures) {
        let bins_per_slot = (self.magnitudes.len() / SPECTRUM_BINS).max(1);
        for (slot, value) in features.spectrum.iter_mut().enumerate() {
            let lo = slot * bins_per_slot;
            let hi = (lo + bins_per_slot).min(self.magnitudes.len());
            *value = self.magnitudes[lo..hi]
                .iter()
                .fold(0.0f32, |acc, &m| acc.max(m));
        }
    }

    fn fill_descriptors(&self, features: &mut AudioFeatures) {
        let hz_per_bin = self.sample_rate as f32 / self.fft_size as f32;
        let nyquist = self.sample_rate as f32 / 2.0;

        let total: f32 = self.magnitudes.iter().sum();
        if total > f32::EPSILON {
            let weighted: f32 = self
                .magnitudes
                .iter()
                .enumerate()
                .map(|(i, &m)| i as f32 * hz_per_bin * m)
                .sum();
            features.centroid = (weighted / total / nyquist).clamp(0.0, 1.0);
        }

        // Rolloff: frequency under which 85% of energy lies
        let energy_total: f32 = self.magnitudes.iter().map(|&m| m * m).sum();
        if energy_total > f32::EPSILON {
            let target = energy_total * ROLLOFF_FRACTION;
            let mut cumulative = 0.0;
            for (i, &m) in self.magnitudes.iter().enumerate() {
                cumulative += m * m;
                if cumulative >= target {
                    features.rolloff_hz = i as f32 * hz_per_bin;
                    break;
                }
            }
        }

        // Flux: L2 distance to the previous frame's spectrum
        if self.have_prev {
            let sum_squared: f32 = self
                .magnitudes
                .iter()
                .zip(&self.prev_magnitudes)
                .map(|(&m, &p)| (m - p) * (m - p))
                .sum();
            features.flux = sum_squared.sqrt();
        }

        // Flatness (noisiness): geometric over arithmetic mean
        let n = self.magnitudes.len() as f32;
        let arithmetic = total / n;
        if arithmetic > f32::EPSILON {
            let log_sum: f32 = self
                .magnitudes
                .iter()
                .map(|&m| (m + 1e-9).ln())
                .sum();
            let geometric = (log_sum / n).exp();
            features.noisiness = (geometric / arithmetic).clamp(0.0, 1.0);
        }
    }
}

#[cfg(test)]
#[path = "spectrum_tests.rs"]
mod tests;
