//! # Technique Analysis Module
//!
//! Post-note analytics computed once per matched note from the detections
//! collected while it was held: vibrato, pitch stability and, when tempo
//! information is available, rhythm.

use linreg::linear_regression;
use serde::{Deserialize, Serialize};

use crate::DetectedNote;

/// Vibrato rates outside this band (Hz) are not considered vibrato.
pub const VIBRATO_MIN_RATE_HZ: f32 = 4.0;
pub const VIBRATO_MAX_RATE_HZ: f32 = 8.0;
/// Peak-to-peak width (cents) below which oscillation is treated as jitter.
pub const VIBRATO_MIN_WIDTH_CENTS: f32 = 10.0;
/// Full oscillation periods needed before a rate is reported.
const MIN_VIBRATO_PERIODS: usize = 2;
/// Dead band around the trend line for zero-crossing detection.
const CROSSING_HYSTERESIS_CENTS: f32 = 2.0;
/// Share of the window skipped before measuring settled stability.
const SETTLING_SKIP_RATIO: f32 = 0.4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VibratoMetrics {
    pub present: bool,
    pub rate_hz: f32,
    /// Peak-to-peak width in cents.
    pub width_cents: f32,
    /// 1 for perfectly even periods, falling toward 0 as they vary.
    pub regularity: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PitchStability {
    /// Standard deviation over the tail of the note.
    pub settling_std_cents: f32,
    pub global_std_cents: f32,
    /// Linear trend of the deviation, cents per second.
    pub drift_cents_per_sec: f32,
    /// Fraction of detections within tolerance.
    pub in_tune_ratio: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RhythmMetrics {
    /// Actual minus expected onset; positive = late.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onset_error_ms: Option<f32>,
    /// Actual minus expected duration; positive = held too long.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_error_ms: Option<f32>,
}

/// Everything measured about one completed note.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteTechnique {
    pub vibrato: VibratoMetrics,
    pub pitch_stability: PitchStability,
    pub rhythm: RhythmMetrics,
}

/// Tempo information for rhythm scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RhythmContext {
    pub bpm: f32,
    /// Timestamp (same clock as detections) at which the exercise started.
    pub session_start_ms: u64,
    /// Beats before this note starts, when the exercise is known.
    pub expected_onset_beats: Option<f32>,
    pub duration_beats: f32,
}

impl RhythmContext {
    fn beat_ms(&self) -> Option<f32> {
        (self.bpm > 0.0).then(|| 60_000.0 / self.bpm)
    }
}

/// Analyzes the detections of one matched note.
///
/// `tolerance_cents` is the in-tune band used for `in_tune_ratio`. Rhythm
/// fields stay `None` without a [`RhythmContext`].
pub fn analyze_technique(
    window: &[DetectedNote],
    tolerance_cents: f32,
    rhythm: Option<&RhythmContext>,
) -> NoteTechnique {
    if window.is_empty() {
        return NoteTechnique::default();
    }
    let start_ms = window[0].timestamp_ms;
    let times: Vec<f64> = window
        .iter()
        .map(|d| d.timestamp_ms.saturating_sub(start_ms) as f64 / 1000.0)
        .collect();
    let cents: Vec<f64> = window.iter().map(|d| d.cents_deviation as f64).collect();

    let trend = linear_regression::<_, _, f64>(&times, &cents).ok();

    NoteTechnique {
        vibrato: analyze_vibrato(&times, &cents, trend),
        pitch_stability: analyze_stability(&cents, trend, tolerance_cents),
        rhythm: rhythm
            .map(|ctx| analyze_rhythm(window, ctx))
            .unwrap_or_default(),
    }
}

fn analyze_stability(cents: &[f64], trend: Option<(f64, f64)>, tolerance: f32) -> PitchStability {
    let skip = (cents.len() as f32 * SETTLING_SKIP_RATIO).floor() as usize;
    let in_tune = cents
        .iter()
        .filter(|c| c.abs() < tolerance as f64)
        .count();
    PitchStability {
        settling_std_cents: std_dev(&cents[skip..]) as f32,
        global_std_cents: std_dev(cents) as f32,
        drift_cents_per_sec: trend.map(|(slope, _)| slope as f32).unwrap_or(0.0),
        in_tune_ratio: in_tune as f32 / cents.len() as f32,
    }
}

fn analyze_vibrato(times: &[f64], cents: &[f64], trend: Option<(f64, f64)>) -> VibratoMetrics {
    // Oscillation is measured around the trend so slow drift does not read
    // as a half-cycle.
    let residual: Vec<f64> = match trend {
        Some((slope, intercept)) => times
            .iter()
            .zip(cents)
            .map(|(t, c)| c - (slope * t + intercept))
            .collect(),
        None => {
            let m = mean(cents);
            cents.iter().map(|c| c - m).collect()
        }
    };

    let crossings = upward_crossings(times, &residual);
    if crossings.len() < MIN_VIBRATO_PERIODS + 1 {
        return VibratoMetrics::default();
    }

    let periods: Vec<f64> = crossings.windows(2).map(|w| w[1].0 - w[0].0).collect();
    let mean_period = mean(&periods);
    if mean_period <= 0.0 {
        return VibratoMetrics::default();
    }
    let rate_hz = (1.0 / mean_period) as f32;

    let widths: Vec<f64> = crossings
        .windows(2)
        .map(|w| {
            let cycle = &residual[w[0].1..w[1].1];
            let max = cycle.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let min = cycle.iter().copied().fold(f64::INFINITY, f64::min);
            max - min
        })
        .collect();
    let width_cents = mean(&widths) as f32;

    let variation = std_dev(&periods) / mean_period;
    let regularity = (1.0 - variation).clamp(0.0, 1.0) as f32;

    VibratoMetrics {
        present: (VIBRATO_MIN_RATE_HZ..=VIBRATO_MAX_RATE_HZ).contains(&rate_hz)
            && width_cents > VIBRATO_MIN_WIDTH_CENTS,
        rate_hz,
        width_cents,
        regularity,
    }
}

/// Times (and sample indices) where the residual rises through zero.
///
/// A crossing only counts after the signal has dipped below the hysteresis
/// band, so jitter around zero does not produce extra cycles.
fn upward_crossings(times: &[f64], residual: &[f64]) -> Vec<(f64, usize)> {
    let band = CROSSING_HYSTERESIS_CENTS as f64;
    let mut armed = false;
    let mut crossings = Vec::new();
    for i in 1..residual.len() {
        if residual[i - 1] < -band {
            armed = true;
        }
        if armed && residual[i - 1] < 0.0 && residual[i] >= 0.0 {
            let (r0, r1) = (residual[i - 1], residual[i]);
            let fraction = -r0 / (r1 - r0);
            let t = times[i - 1] + fraction * (times[i] - times[i - 1]);
            crossings.push((t, i));
            armed = false;
        }
    }
    crossings
}

fn analyze_rhythm(window: &[DetectedNote], ctx: &RhythmContext) -> RhythmMetrics {
    let (Some(first), Some(last), Some(beat_ms)) = (window.first(), window.last(), ctx.beat_ms())
    else {
        return RhythmMetrics::default();
    };
    let actual_onset = first.timestamp_ms as f32 - ctx.session_start_ms as f32;
    let actual_duration = last.timestamp_ms.saturating_sub(first.timestamp_ms) as f32;
    RhythmMetrics {
        onset_error_ms: ctx
            .expected_onset_beats
            .map(|beats| actual_onset - beats * beat_ms),
        duration_error_ms: Some(actual_duration - ctx.duration_beats * beat_ms),
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    /// Detections every `step_ms` with the given cents curve.
    fn window(count: usize, step_ms: u64, cents: impl Fn(f32) -> f32) -> Vec<DetectedNote> {
        (0..count)
            .map(|i| {
                let t = i as f32 * step_ms as f32 / 1000.0;
                DetectedNote {
                    pitch_name: "A4".into(),
                    frequency_hz: 440.0,
                    cents_deviation: cents(t),
                    confidence: 0.95,
                    timestamp_ms: 1_000 + i as u64 * step_ms,
                }
            })
            .collect()
    }

    #[test]
    fn steady_note_is_stable_without_vibrato() {
        let notes = window(60, 16, |_| 3.0);
        let technique = analyze_technique(&notes, 15.0, None);
        assert!(!technique.vibrato.present);
        assert!(technique.pitch_stability.global_std_cents < 1e-3);
        assert!(technique.pitch_stability.drift_cents_per_sec.abs() < 1e-3);
        assert_eq!(technique.pitch_stability.in_tune_ratio, 1.0);
        assert_eq!(technique.rhythm, RhythmMetrics::default());
    }

    #[test]
    fn detects_regular_vibrato() {
        // 5.5 Hz, ±15 cents, sampled at ~60 Hz for 1.5 s.
        let notes = window(90, 16, |t| 15.0 * (2.0 * PI * 5.5 * t).sin());
        let vibrato = analyze_technique(&notes, 20.0, None).vibrato;
        assert!(vibrato.present, "{vibrato:?}");
        assert!((vibrato.rate_hz - 5.5).abs() < 0.5, "{vibrato:?}");
        assert!(vibrato.width_cents > 20.0 && vibrato.width_cents < 32.0, "{vibrato:?}");
        assert!(vibrato.regularity > 0.7, "{vibrato:?}");
    }

    #[test]
    fn small_jitter_is_not_vibrato() {
        let notes = window(90, 16, |t| 3.0 * (2.0 * PI * 5.5 * t).sin());
        assert!(!analyze_technique(&notes, 20.0, None).vibrato.present);
    }

    #[test]
    fn slow_wobble_is_outside_the_vibrato_band() {
        let notes = window(180, 16, |t| 20.0 * (2.0 * PI * 2.0 * t).sin());
        let vibrato = analyze_technique(&notes, 30.0, None).vibrato;
        assert!(!vibrato.present);
        assert!(vibrato.rate_hz < VIBRATO_MIN_RATE_HZ);
    }

    #[test]
    fn drift_follows_the_trend() {
        // Rises 10 cents per second.
        let notes = window(100, 10, |t| -5.0 + 10.0 * t);
        let stability = analyze_technique(&notes, 15.0, None).pitch_stability;
        assert!((stability.drift_cents_per_sec - 10.0).abs() < 0.1);
        assert!(stability.settling_std_cents < stability.global_std_cents);
    }

    #[test]
    fn in_tune_ratio_counts_within_tolerance() {
        let notes = window(10, 50, |t| if t < 0.2 { 30.0 } else { 2.0 });
        let stability = analyze_technique(&notes, 10.0, None).pitch_stability;
        assert!((stability.in_tune_ratio - 0.6).abs() < 1e-6);
    }

    #[test]
    fn rhythm_uses_tempo_and_session_start() {
        let notes = window(11, 100, |_| 0.0);
        let ctx = RhythmContext {
            bpm: 60.0,
            session_start_ms: 0,
            expected_onset_beats: Some(1.0),
            duration_beats: 1.0,
        };
        let rhythm = analyze_technique(&notes, 15.0, Some(&ctx)).rhythm;
        // First detection at 1000 ms, exactly on beat 1, held 1000 ms.
        assert_eq!(rhythm.onset_error_ms, Some(0.0));
        assert_eq!(rhythm.duration_error_ms, Some(0.0));

        let no_onset = RhythmContext {
            expected_onset_beats: None,
            bpm: 120.0,
            ..ctx
        };
        let rhythm = analyze_technique(&notes, 15.0, Some(&no_onset)).rhythm;
        assert_eq!(rhythm.onset_error_ms, None);
        assert_eq!(rhythm.duration_error_ms, Some(500.0));
    }

    #[test]
    fn empty_window_is_default() {
        assert_eq!(analyze_technique(&[], 15.0, None), NoteTechnique::default());
    }
}
