// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-frame feature extraction.
//!
//! Pipeline: levels → windowed FFT spectrum → bands/descriptors → onset and
//! tempo tracking → pitch → structure. All state and scratch buffers are
//! allocated once in [`FeatureExtractor::new`]; `process` does no allocation
//! on the hot path.

pub mod beat;
pub mod levels;
pub mod pitch;
pub mod spectrum;
pub mod structure;

use beat::BeatTracker;
use levels::{DynamicComplexity, LevelMeter};
use pitch::PitchDetector;
use spectrum::SpectrumAnalyzer;
use structure::StructureDetector;

/// Number of perceptual bands (sub-bass … air, plus overall).
pub const BAND_COUNT: usize = 8;

/// Number of linear display-spectrum bins.
pub const SPECTRUM_BINS: usize = 32;

/// One frame of features, published per captured block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioFeatures {
    // Broadband level
    pub rms: f32,
    pub peak: f32,

    // Perceptual bands in [0,1]:
    // sub-bass, bass, low-mid, mid, high-mid, presence, air, overall
    pub bands: [f32; BAND_COUNT],
    /// Linear magnitude bins in [0,1] for UI display.
    pub spectrum: [f32; SPECTRUM_BINS],

    // Spectral descriptors
    /// Centroid normalized to [0,1] of Nyquist; doubles as brightness.
    pub centroid: f32,
    /// Frequency below which 85% of spectral energy lies.
    pub rolloff_hz: f32,
    /// Frame-to-frame L2 distance of magnitude spectra.
    pub flux: f32,
    /// Spectral flatness in [0,1]; noise ≈ 1, tone ≈ 0.
    pub noisiness: f32,

    // Beat / tempo
    pub beat: bool,
    /// Fast-attack slow-decay beat envelope in [0,1].
    pub beat_energy: f32,
    pub bass_beat: f32,
    pub mid_beat: f32,
    pub high_beat: f32,
    pub bpm: f32,
    pub bpm_confidence: f32,

    // Pitch
    pub pitch_hz: f32,
    pub pitch_confidence: f32,

    // Structure
    pub buildup: bool,
    pub drop: bool,
    /// Energy trend over the sliding window in [-1,1].
    pub trend: f32,
    pub dynamic_complexity: f32,
}

/// Stateful extractor chain; one instance per capture configuration.
pub struct FeatureExtractor {
    sample_rate: u32,
    full_analysis: bool,
    levels: LevelMeter,
    spectrum: SpectrumAnalyzer,
    beat: BeatTracker,
    pitch: PitchDetector,
    structure: StructureDetector,
    complexity: DynamicComplexity,
    /// Frames skipped because an extractor failed on them.
    skipped_frames: u64,
}

impl FeatureExtractor {
    /// `full_analysis=false` is degraded mode: levels, spectrum, and bands
    /// only.
    pub fn new(sample_rate: u32, block_size: usize, full_analysis: bool) -> Self {
        let frame_rate = sample_rate as f32 / block_size as f32;
        FeatureExtractor {
            sample_rate,
            full_analysis,
            levels: LevelMeter::new(),
            spectrum: SpectrumAnalyzer::new(sample_rate, block_size),
            beat: BeatTracker::new(frame_rate),
            pitch: PitchDetector::new(sample_rate),
            structure: StructureDetector::new(frame_rate),
            complexity: DynamicComplexity::new(frame_rate),
            skipped_frames: 0,
        }
    }

    /// Analyze one mono block. Blocks shorter than the configured size are
    /// analyzed as-is; empty blocks are skipped.
    pub fn process(&mut self, block: &[f32]) -> Option<AudioFeatures> {
        if block.is_empty() {
            self.skipped_frames += 1;
            return None;
        }

        let mut features = AudioFeatures::default();

        let (rms, peak) = self.levels.measure(block);
        features.rms = rms;
        features.peak = peak;

        self.spectrum.analyze(block, &mut features);

        if self.full_analysis {
            self.beat.track(&mut features);
            self.pitch.detect(block, &mut features);
            self.structure.observe(&mut features);
            features.dynamic_complexity = self.complexity.observe(rms);
        }

        Some(features)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
