//! # Live Observation Module
//!
//! Heuristic real-time tips computed from a short rolling window of recent
//! detections. Each rule is independent; results are ranked by severity and
//! at most two are returned.
//!
//! | Rule | Type | Severity |
//! |------|------|----------|
//! | Wrong note (short-circuits) | `wrongNote` | 3 |
//! | Consistently sharp / flat | `intonation` | 2 |
//! | Wavering | `stability` | 2 |
//! | Weak tone | `attack` | 1 |

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::tuning;
use crate::DetectedNote;

/// Fewer detections than this produce no observations.
pub const MIN_WINDOW_SAMPLES: usize = 5;
/// Default capacity of a [`LiveObserver`] window.
pub const DEFAULT_WINDOW_CAPACITY: usize = 20;
/// Most observations returned per call.
pub const MAX_OBSERVATIONS: usize = 2;

const INTONATION_THRESHOLD_CENTS: f32 = 15.0;
const WAVER_AMPLITUDE_CENTS: f32 = 15.0;
/// Share of the window a rule needs before it counts as a trend.
const MAJORITY_RATIO: f32 = 0.7;
/// Share of consecutive pairs that must flip sign to count as wavering.
const ALTERNATION_RATIO: f32 = 0.5;
const WEAK_TONE_CONFIDENCE: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObservationType {
    Intonation,
    Stability,
    Attack,
    WrongNote,
}

/// One ranked tip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(rename = "type")]
    pub observation_type: ObservationType,
    /// 1 (minor) to 3 (major).
    pub severity: u8,
    /// Share of the window supporting the observation.
    pub confidence: f32,
    pub message: String,
    pub tip: String,
}

/// Ranks feedback for `recent` detections against the target note.
///
/// Pure: the same input always yields the same output.
pub fn calculate_live_observations(
    recent: &[DetectedNote],
    target_pitch_name: &str,
) -> Vec<Observation> {
    if recent.len() < MIN_WINDOW_SAMPLES {
        return Vec::new();
    }
    let target = tuning::normalize_note_name(target_pitch_name)
        .unwrap_or_else(|| target_pitch_name.to_string());

    if let Some(wrong) = wrong_note(recent, &target) {
        return vec![wrong];
    }

    let on_target: Vec<f32> = recent
        .iter()
        .filter(|d| d.pitch_name == target)
        .map(|d| d.cents_deviation)
        .collect();

    let mut observations = Vec::with_capacity(3);
    if on_target.len() >= MIN_WINDOW_SAMPLES {
        observations.extend(intonation(&on_target));
        observations.extend(wavering(&on_target));
    }
    observations.extend(weak_tone(recent));

    // Stable sort keeps rule order among equal severities.
    observations.sort_by(|a, b| b.severity.cmp(&a.severity));
    observations.truncate(MAX_OBSERVATIONS);
    observations
}

fn wrong_note(recent: &[DetectedNote], target: &str) -> Option<Observation> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for d in recent.iter().filter(|d| d.pitch_name != target) {
        match counts
            .iter_mut()
            .find(|(name, _)| *name == d.pitch_name.as_str())
        {
            Some((_, count)) => *count += 1,
            None => counts.push((d.pitch_name.as_str(), 1)),
        }
    }
    let wrong_total: usize = counts.iter().map(|(_, c)| c).sum();
    let ratio = wrong_total as f32 / recent.len() as f32;
    if ratio < MAJORITY_RATIO {
        return None;
    }
    // First-seen wins ties so the result does not depend on hashing.
    let (played, _) = counts
        .iter()
        .fold(None::<(&str, usize)>, |best, &(name, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((name, count)),
        })?;
    Some(Observation {
        observation_type: ObservationType::WrongNote,
        severity: 3,
        confidence: ratio,
        message: format!("Playing {played} instead of {target}"),
        tip: format!("Check your finger position for {target}"),
    })
}

fn intonation(cents: &[f32]) -> Option<Observation> {
    let n = cents.len() as f32;
    let sharp = cents.iter().filter(|&&c| c > INTONATION_THRESHOLD_CENTS).count() as f32 / n;
    let flat = cents.iter().filter(|&&c| c < -INTONATION_THRESHOLD_CENTS).count() as f32 / n;
    let average = cents.iter().sum::<f32>() / n;

    let (direction, ratio, tip) = if sharp >= MAJORITY_RATIO {
        ("sharp", sharp, "Move your finger slightly back toward the scroll")
    } else if flat >= MAJORITY_RATIO {
        ("flat", flat, "Move your finger slightly forward toward the bridge")
    } else {
        return None;
    };
    Some(Observation {
        observation_type: ObservationType::Intonation,
        severity: 2,
        confidence: ratio,
        message: format!("Consistently {direction} by about {:.0} cents", average.abs()),
        tip: tip.to_string(),
    })
}

fn wavering(cents: &[f32]) -> Option<Observation> {
    let flips = cents
        .windows(2)
        .filter(|w| w[0] * w[1] < 0.0)
        .count();
    let ratio = flips as f32 / (cents.len() - 1) as f32;
    let max = cents.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let min = cents.iter().copied().fold(f32::INFINITY, f32::min);
    let amplitude = (max - min) / 2.0;
    if ratio < ALTERNATION_RATIO || amplitude < WAVER_AMPLITUDE_CENTS {
        return None;
    }
    Some(Observation {
        observation_type: ObservationType::Stability,
        severity: 2,
        confidence: ratio,
        message: format!("Pitch is wavering by about ±{amplitude:.0} cents"),
        tip: "Keep the finger planted and the bow speed even".to_string(),
    })
}

fn weak_tone(recent: &[DetectedNote]) -> Option<Observation> {
    let mean_confidence =
        recent.iter().map(|d| d.confidence).sum::<f32>() / recent.len() as f32;
    if mean_confidence >= WEAK_TONE_CONFIDENCE {
        return None;
    }
    Some(Observation {
        observation_type: ObservationType::Attack,
        severity: 1,
        confidence: (1.0 - mean_confidence).clamp(0.0, 1.0),
        message: "Tone is weak or unfocused".to_string(),
        tip: "Add a little bow weight and start the note with a clear attack".to_string(),
    })
}

/// Fixed-capacity rolling window feeding [`calculate_live_observations`].
#[derive(Debug, Clone)]
pub struct LiveObserver {
    window: VecDeque<DetectedNote>,
    capacity: usize,
}

impl LiveObserver {
    /// A window holding the `capacity` most recent detections.
    ///
    /// Windows smaller than [`MIN_WINDOW_SAMPLES`] never produce tips.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds a detection, evicting the oldest when full.
    pub fn push(&mut self, detection: DetectedNote) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(detection);
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current tips for the target note.
    pub fn observations(&mut self, target_pitch_name: &str) -> Vec<Observation> {
        calculate_live_observations(self.window.make_contiguous(), target_pitch_name)
    }
}

impl Default for LiveObserver {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(pitch: &str, cents: f32, confidence: f32) -> DetectedNote {
        DetectedNote {
            pitch_name: pitch.to_string(),
            frequency_hz: 0.0,
            cents_deviation: cents,
            confidence,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn too_few_samples_yield_nothing() {
        let window: Vec<_> = (0..4).map(|_| detection("D4", 40.0, 0.2)).collect();
        assert!(calculate_live_observations(&window, "A4").is_empty());
    }

    #[test]
    fn consistently_sharp() {
        let window: Vec<_> = (0..10)
            .map(|i| detection("A4", 18.0 + i as f32, 0.95))
            .collect();
        let obs = calculate_live_observations(&window, "A4");
        assert_eq!(obs[0].observation_type, ObservationType::Intonation);
        assert!(obs[0].message.contains("sharp"));
        assert!(obs.len() <= 2);
    }

    #[test]
    fn consistently_flat() {
        let window: Vec<_> = (0..8).map(|_| detection("G3", -22.0, 0.95)).collect();
        let obs = calculate_live_observations(&window, "G3");
        assert_eq!(obs.len(), 1);
        assert!(obs[0].message.contains("flat"));
    }

    #[test]
    fn single_spike_is_not_a_trend() {
        let mut window: Vec<_> = (0..9).map(|_| detection("A4", 2.0, 0.95)).collect();
        window.push(detection("A4", 40.0, 0.95));
        assert!(calculate_live_observations(&window, "A4").is_empty());
    }

    #[test]
    fn alternating_cents_is_wavering() {
        let window: Vec<_> = (0..10)
            .map(|i| detection("A4", if i % 2 == 0 { 20.0 } else { -20.0 }, 0.95))
            .collect();
        let obs = calculate_live_observations(&window, "A4");
        let waver = obs
            .iter()
            .find(|o| o.observation_type == ObservationType::Stability)
            .unwrap();
        assert!(waver.message.contains("wavering"));
    }

    #[test]
    fn wrong_note_short_circuits() {
        let window: Vec<_> = (0..10).map(|_| detection("B4", 30.0, 0.3)).collect();
        let obs = calculate_live_observations(&window, "A4");
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].observation_type, ObservationType::WrongNote);
        assert_eq!(obs[0].severity, 3);
        assert!(obs[0].message.contains("B4"));
    }

    #[test]
    fn wrong_note_picks_most_frequent_pitch() {
        let mut window: Vec<_> = (0..3).map(|_| detection("B4", 0.0, 0.9)).collect();
        window.extend((0..5).map(|_| detection("G#4", 0.0, 0.9)));
        window.extend((0..2).map(|_| detection("A4", 0.0, 0.9)));
        let obs = calculate_live_observations(&window, "A4");
        assert!(obs[0].message.starts_with("Playing G#4"));
    }

    #[test]
    fn flat_target_names_are_normalized() {
        let window: Vec<_> = (0..6).map(|_| detection("A#3", 25.0, 0.95)).collect();
        let obs = calculate_live_observations(&window, "Bb3");
        assert_eq!(obs[0].observation_type, ObservationType::Intonation);
    }

    #[test]
    fn ranking_caps_at_two() {
        // Sharp, wavering and weak all at once: seven of ten samples sharp,
        // six sign flips.
        let window: Vec<_> = (0..10)
            .map(|i| {
                let cents = if i < 6 && i % 2 == 1 { -10.0 } else { 60.0 };
                detection("A4", cents, 0.5)
            })
            .collect();
        let obs = calculate_live_observations(&window, "A4");
        assert_eq!(obs.len(), 2);
        assert!(obs.iter().all(|o| o.severity == 2));
    }

    #[test]
    fn weak_tone_alone() {
        let window: Vec<_> = (0..6).map(|_| detection("A4", 0.0, 0.5)).collect();
        let obs = calculate_live_observations(&window, "A4");
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].observation_type, ObservationType::Attack);
    }

    #[test]
    fn observer_window_is_bounded() {
        let mut observer = LiveObserver::new(8);
        for _ in 0..100 {
            observer.push(detection("A4", 30.0, 0.95));
        }
        assert_eq!(observer.len(), 8);
        let first = observer.observations("A4");
        assert_eq!(first, observer.observations("A4"));
        assert_eq!(first[0].observation_type, ObservationType::Intonation);

        observer.clear();
        assert!(observer.is_empty());
        assert!(observer.observations("A4").is_empty());
    }

    #[test]
    fn small_windows_keep_their_capacity_and_stay_silent() {
        let mut observer = LiveObserver::new(3);
        assert_eq!(observer.capacity(), 3);
        for _ in 0..10 {
            observer.push(detection("B4", 30.0, 0.2));
        }
        assert_eq!(observer.len(), 3);
        assert!(observer.observations("A4").is_empty());
        assert_eq!(LiveObserver::new(0).capacity(), 1);
    }
}
