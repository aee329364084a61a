//! # Pitch Detection Module
//!
//! YIN fundamental-frequency estimation tuned for bowed and plucked string
//! practice. The estimator never fails: silence, noise and out-of-range
//! candidates all come back as [`PitchEstimate::NONE`].
//!
//! ## Features
//! - RMS gate that skips the full analysis on silence
//! - FFT-backed difference function (see [`crate::fft::Correlator`])
//! - Cumulative mean normalized difference with an absolute threshold
//! - Parabolic interpolation for sub-sample accuracy
//!
//! ## Frame length
//! The frame must cover at least two periods of the lowest frequency of
//! interest. Shorter frames are not rejected, they just stop detecting low
//! notes.

use serde::{Deserialize, Serialize};

use crate::fft::{remove_dc_offset, Correlator};

/// Default YIN absolute threshold.
pub const DEFAULT_THRESHOLD: f32 = 0.1;
/// Lowest frequency considered, a little under a violin's open G (196 Hz).
pub const DEFAULT_MIN_FREQUENCY_HZ: f32 = 180.0;
/// Default upper bound, raised through [`YinConfig::max_frequency_hz`].
pub const DEFAULT_MAX_FREQUENCY_HZ: f32 = 700.0;
/// Signals below this RMS are treated as silence.
pub const DEFAULT_RMS_THRESHOLD: f32 = 0.01;

/// Tunables for the YIN estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YinConfig {
    /// Absolute threshold on the normalized difference. Lower is stricter.
    pub threshold: f32,
    /// Lowest accepted fundamental in Hz.
    pub min_frequency_hz: f32,
    /// Highest accepted fundamental in Hz.
    pub max_frequency_hz: f32,
    /// RMS below which estimation is skipped.
    pub rms_threshold: f32,
}

impl Default for YinConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_frequency_hz: DEFAULT_MIN_FREQUENCY_HZ,
            max_frequency_hz: DEFAULT_MAX_FREQUENCY_HZ,
            rms_threshold: DEFAULT_RMS_THRESHOLD,
        }
    }
}

/// Output of one estimation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PitchEstimate {
    /// Fundamental frequency in Hz, 0 when nothing was detected.
    pub frequency_hz: f32,
    /// Confidence in `[0, 1]`, 0 when nothing was detected.
    pub confidence: f32,
}

impl PitchEstimate {
    /// The result for silent or unanalyzable input.
    pub const NONE: PitchEstimate = PitchEstimate {
        frequency_hz: 0.0,
        confidence: 0.0,
    };

    /// True when a pitch was found.
    pub fn is_voiced(&self) -> bool {
        self.frequency_hz > 0.0
    }
}

/// Root-mean-square level of a buffer. Returns 0 for an empty buffer.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Stateful YIN estimator.
///
/// Holds the FFT plans and scratch buffers so the per-frame path does not
/// allocate once the frame size is stable. A change in frame size re-plans.
#[derive(Debug)]
pub struct PitchEstimator {
    config: YinConfig,
    correlator: Option<Correlator>,
    scratch: Vec<f32>,
    yin_buffer: Vec<f32>,
}

impl PitchEstimator {
    pub fn new(config: YinConfig) -> Self {
        Self {
            config,
            correlator: None,
            scratch: Vec::new(),
            yin_buffer: Vec::new(),
        }
    }

    pub fn config(&self) -> &YinConfig {
        &self.config
    }

    /// Estimates the fundamental of `samples`.
    ///
    /// 1. RMS gate
    /// 2. Difference function over every lag up to half the frame
    /// 3. Cumulative mean normalization
    /// 4. First dip below the threshold, scanning up from the lag of
    ///    `max_frequency_hz`, followed down to its local minimum
    /// 5. Parabolic interpolation around that minimum
    pub fn estimate(&mut self, samples: &[f32], sample_rate: u32) -> PitchEstimate {
        if sample_rate == 0 || samples.len() < 4 {
            return PitchEstimate::NONE;
        }
        let level = rms(samples);
        if level.is_nan() || level < self.config.rms_threshold {
            return PitchEstimate::NONE;
        }

        let frame_len = samples.len();
        if self.correlator.as_ref().map(Correlator::frame_len) != Some(frame_len) {
            self.correlator = Some(Correlator::new(frame_len));
        }
        let Some(correlator) = self.correlator.as_mut() else {
            return PitchEstimate::NONE;
        };

        self.scratch.clear();
        self.scratch.extend_from_slice(samples);
        remove_dc_offset(&mut self.scratch);
        correlator.difference(&self.scratch, &mut self.yin_buffer);

        let yin = &mut self.yin_buffer;
        let half = yin.len();

        // Cumulative mean normalized difference.
        let mut running_sum = 0.0;
        yin[0] = 1.0;
        for tau in 1..half {
            running_sum += yin[tau];
            if running_sum > 0.0 {
                yin[tau] *= tau as f32 / running_sum;
            } else {
                yin[tau] = 1.0;
            }
        }

        let rate = sample_rate as f32;
        let min_tau = ((rate / self.config.max_frequency_hz).floor() as usize).max(2);
        let max_tau = ((rate / self.config.min_frequency_hz).ceil() as usize).min(half - 1);
        if min_tau >= max_tau {
            return PitchEstimate::NONE;
        }

        let Some(mut tau) = (min_tau..max_tau).find(|&t| yin[t] < self.config.threshold) else {
            return PitchEstimate::NONE;
        };
        while tau + 1 < max_tau && yin[tau + 1] < yin[tau] {
            tau += 1;
        }

        let y1 = yin[tau - 1];
        let y2 = yin[tau];
        let y3 = yin[tau + 1];
        let denominator = y1 - 2.0 * y2 + y3;
        let period = if denominator.abs() > f32::EPSILON {
            tau as f32 + (y1 - y3) / (2.0 * denominator)
        } else {
            tau as f32
        };

        let frequency_hz = rate / period;
        if !frequency_hz.is_finite()
            || frequency_hz < self.config.min_frequency_hz
            || frequency_hz > self.config.max_frequency_hz
        {
            return PitchEstimate::NONE;
        }

        PitchEstimate {
            frequency_hz,
            confidence: (1.0 - y2).clamp(0.0, 1.0),
        }
    }
}

impl Default for PitchEstimator {
    fn default() -> Self {
        Self::new(YinConfig::default())
    }
}

/// One-shot estimation with a throwaway estimator.
///
/// Convenient for tests and offline analysis; the streaming path keeps a
/// [`PitchEstimator`] alive instead.
pub fn estimate_pitch(samples: &[f32], sample_rate: u32, config: &YinConfig) -> PitchEstimate {
    PitchEstimator::new(*config).estimate(samples, sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(freq: f32, sample_rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn detects_a440() {
        let signal = sine(440.0, 44_100, 2048, 0.5);
        let estimate = estimate_pitch(&signal, 44_100, &YinConfig::default());
        assert!(
            (estimate.frequency_hz - 440.0).abs() < 1.0,
            "got {}",
            estimate.frequency_hz
        );
        assert!(estimate.confidence > 0.9);
    }

    #[test]
    fn silence_returns_zero() {
        let estimate = estimate_pitch(&vec![0.0; 2048], 44_100, &YinConfig::default());
        assert_eq!(estimate, PitchEstimate::NONE);
    }

    #[test]
    fn quiet_signal_is_gated() {
        let signal = sine(440.0, 44_100, 2048, 0.005);
        let estimate = estimate_pitch(&signal, 44_100, &YinConfig::default());
        assert_eq!(estimate, PitchEstimate::NONE);
    }

    #[test]
    fn below_range_pitch_is_rejected() {
        let signal = sine(100.0, 44_100, 2048, 0.5);
        assert!(!estimate_pitch(&signal, 44_100, &YinConfig::default()).is_voiced());
    }

    #[test]
    fn raised_ceiling_admits_high_notes() {
        let signal = sine(1000.0, 44_100, 2048, 0.5);
        let wide = YinConfig {
            max_frequency_hz: 2000.0,
            ..YinConfig::default()
        };
        let estimate = estimate_pitch(&signal, 44_100, &wide);
        assert!((estimate.frequency_hz - 1000.0).abs() < 2.0);
    }

    #[test]
    fn open_g_string_with_harmonics() {
        let signal: Vec<f32> = (0..2048)
            .map(|i| {
                let t = i as f32 / 44_100.0;
                0.4 * (2.0 * PI * 196.0 * t).sin()
                    + 0.2 * (2.0 * PI * 392.0 * t).sin()
                    + 0.1 * (2.0 * PI * 588.0 * t).sin()
            })
            .collect();
        let estimate = estimate_pitch(&signal, 44_100, &YinConfig::default());
        assert!(
            (estimate.frequency_hz - 196.0).abs() < 1.0,
            "got {}",
            estimate.frequency_hz
        );
    }

    #[test]
    fn white_noise_is_not_voiced_or_low_confidence() {
        // Deterministic LCG noise.
        let mut state: u32 = 12345;
        let noise: Vec<f32> = (0..2048)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
                ((state >> 16) as f32 / 32768.0) - 1.0
            })
            .collect();
        let estimate = estimate_pitch(&noise, 44_100, &YinConfig::default());
        assert!(!estimate.is_voiced() || estimate.confidence < 0.9);
    }

    #[test]
    fn reuses_plans_across_frame_sizes() {
        let mut estimator = PitchEstimator::default();
        let a = estimator.estimate(&sine(440.0, 44_100, 2048, 0.5), 44_100);
        let b = estimator.estimate(&sine(330.0, 44_100, 4096, 0.5), 44_100);
        let c = estimator.estimate(&sine(440.0, 44_100, 2048, 0.5), 44_100);
        assert!((a.frequency_hz - 440.0).abs() < 1.0);
        assert!((b.frequency_hz - 330.0).abs() < 1.0);
        assert_eq!(a, c);
    }

    #[test]
    fn rms_of_known_signals() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[1.0, -1.0, 1.0, -1.0]) - 1.0).abs() < 1e-6);
    }
}
