//! Error taxonomy for the practice pipeline.

use thiserror::Error;

/// Errors produced while turning audio into practice events.
///
/// `SignalTooWeak` and `UnmappablePitch` are per-frame classifications that
/// the state machine turns into `NO_NOTE`; only `Resolver` ends a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// RMS or confidence fell below the configured floor.
    #[error("signal too weak for pitch detection")]
    SignalTooWeak,

    /// The detected frequency has no note in the supported range.
    #[error("frequency {frequency_hz:.2} Hz is outside the supported note range")]
    UnmappablePitch {
        /// The rejected frequency.
        frequency_hz: f32,
    },

    /// An externally supplied resolver failed. Fatal for the pipeline.
    #[error("target note resolver failed: {0}")]
    Resolver(#[source] anyhow::Error),

    /// A note name could not be parsed or lies outside the note table.
    #[error("unknown note name: {0}")]
    UnknownNote(String),

    /// Options or an exercise could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl PipelineError {
    /// True for errors that abort the pipeline rather than skip a frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Resolver(_))
    }
}

/// Convenience result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
