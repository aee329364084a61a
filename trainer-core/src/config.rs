//! Pipeline options and feedback presets.
//!
//! Options are plain serde structs so a consumer can load them from the same
//! JSON files it keeps exercises and preferences in.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pitch::YinConfig;
use crate::session::Exercise;

/// Options recognized by the practice pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Frames quieter than this are `NO_NOTE`.
    pub min_rms: f32,
    /// Detections less confident than this are `NO_NOTE`.
    pub min_confidence: f32,
    /// In-tune band for holding a note, in cents.
    pub cents_tolerance: f32,
    /// Band every detection of a note must stay inside for it to be perfect.
    pub perfect_cents: f32,
    pub required_hold_time_ms: f32,
    pub bpm: Option<f32>,
    pub exercise: Option<Exercise>,
    /// Start of the exercise on the scheduler's clock, for rhythm scoring.
    pub session_start_ms: Option<u64>,
    /// Capacity of the per-note detection window.
    pub detection_window_capacity: usize,
    /// Capacity of the live observation window.
    pub observation_window_capacity: usize,
    pub yin: YinConfig,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        FeedbackProfile::Intermediate.options()
    }
}

impl PipelineOptions {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Tempo from the options, falling back to the exercise's own.
    pub fn effective_bpm(&self) -> Option<f32> {
        self.bpm
            .or_else(|| self.exercise.as_ref().and_then(|e| e.bpm))
            .filter(|bpm| *bpm > 0.0)
    }
}

/// How forgiving feedback should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackProfile {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
}

impl FeedbackProfile {
    pub fn options(self) -> PipelineOptions {
        let (cents_tolerance, required_hold_time_ms) = match self {
            FeedbackProfile::Beginner => (25.0, 400.0),
            FeedbackProfile::Intermediate => (15.0, 500.0),
            FeedbackProfile::Advanced => (10.0, 700.0),
        };
        PipelineOptions {
            min_rms: 0.01,
            min_confidence: 0.85,
            cents_tolerance,
            perfect_cents: 5.0,
            required_hold_time_ms,
            bpm: None,
            exercise: None,
            session_start_ms: None,
            detection_window_capacity: 512,
            observation_window_capacity: 20,
            yin: YinConfig::default(),
        }
    }
}

impl std::str::FromStr for FeedbackProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "beginner" => Ok(FeedbackProfile::Beginner),
            "intermediate" => Ok(FeedbackProfile::Intermediate),
            "advanced" => Ok(FeedbackProfile::Advanced),
            other => Err(format!("unknown feedback profile '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let options =
            PipelineOptions::from_json_str(r#"{"cents_tolerance": 25, "bpm": 90}"#).unwrap();
        assert_eq!(options.cents_tolerance, 25.0);
        assert_eq!(options.bpm, Some(90.0));
        assert_eq!(options.perfect_cents, 5.0);
        assert_eq!(options.yin, YinConfig::default());
    }

    #[test]
    fn json_round_trip() {
        let options = FeedbackProfile::Advanced.options();
        let json = options.to_json_string().unwrap();
        assert_eq!(PipelineOptions::from_json_str(&json).unwrap(), options);
    }

    #[test]
    fn profiles_tighten_with_level() {
        let beginner = FeedbackProfile::Beginner.options();
        let advanced = FeedbackProfile::Advanced.options();
        assert!(beginner.cents_tolerance > advanced.cents_tolerance);
        assert!(beginner.required_hold_time_ms < advanced.required_hold_time_ms);
        assert_eq!("Advanced".parse::<FeedbackProfile>(), Ok(FeedbackProfile::Advanced));
        assert!("expert".parse::<FeedbackProfile>().is_err());
    }

    #[test]
    fn bpm_falls_back_to_exercise() {
        let mut options = PipelineOptions::default();
        assert_eq!(options.effective_bpm(), None);
        options.exercise = Some(Exercise {
            bpm: Some(72.0),
            ..Exercise::default()
        });
        assert_eq!(options.effective_bpm(), Some(72.0));
        options.bpm = Some(100.0);
        assert_eq!(options.effective_bpm(), Some(100.0));
    }
}
