// trainer-core/src/lib.rs

//! The core logic for the instrument practice trainer.
//! This crate turns microphone frames into pitch detections, matches them
//! against a target note sequence, and produces practice events, technique
//! analytics and live tips. It is completely headless and contains no
//! rendering code.

pub mod audio;
pub mod config;
pub mod error;
pub mod fft;
pub mod observation;
pub mod pitch;
pub mod practice;
pub mod session;
pub mod stream;
pub mod technique;
pub mod tuning;

use serde::{Deserialize, Serialize};

pub use config::{FeedbackProfile, PipelineOptions};
pub use error::PipelineError;
pub use observation::{calculate_live_observations, LiveObserver, Observation, ObservationType};
pub use practice::{create_practice_event_pipeline, PracticeEngineEvent, PracticeEventPipeline};
pub use session::{Exercise, SessionCursor, TargetNote, TargetNoteResolver};
pub use stream::{create_raw_detection_stream, CancellationToken, RawDetectionStream};
pub use technique::{analyze_technique, NoteTechnique};

use tuning::NoteMapping;

/// One pitch measurement, produced once per audio frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    /// Estimated fundamental in Hz, 0 when nothing was detected.
    pub frequency_hz: f32,
    /// Estimator confidence in `[0, 1]`.
    pub confidence: f32,
    /// Frame loudness.
    pub rms: f32,
    /// Tick timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Nearest note, `None` when the frequency has no note in range.
    pub note: Option<NoteMapping>,
}

impl RawDetection {
    /// Builds a detection and maps its frequency onto the note table.
    pub fn new(frequency_hz: f32, confidence: f32, rms: f32, timestamp_ms: u64) -> Self {
        let note = if frequency_hz > 0.0 {
            tuning::nearest_note(frequency_hz)
        } else {
            None
        };
        Self {
            frequency_hz,
            confidence: confidence.clamp(0.0, 1.0),
            rms: rms.max(0.0),
            timestamp_ms,
            note,
        }
    }

    /// A frame with no usable signal.
    pub fn silent(timestamp_ms: u64) -> Self {
        Self::new(0.0, 0.0, 0.0, timestamp_ms)
    }

    /// The derived note, if the frequency mapped onto the table.
    pub fn detected_note(&self) -> Option<DetectedNote> {
        self.note.as_ref().map(|note| DetectedNote {
            pitch_name: note.name.clone(),
            frequency_hz: self.frequency_hz,
            cents_deviation: note.cents,
            confidence: self.confidence,
            timestamp_ms: self.timestamp_ms,
        })
    }
}

/// A detection mapped onto its nearest semitone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedNote {
    /// Sharp-spelled note name, e.g. "C#4".
    pub pitch_name: String,
    pub frequency_hz: f32,
    /// Deviation from the nearest semitone, positive = sharp.
    pub cents_deviation: f32,
    pub confidence: f32,
    pub timestamp_ms: u64,
}
