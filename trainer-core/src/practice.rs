//! # Practice Event Pipeline
//!
//! The note-matching state machine. It pulls [`RawDetection`]s, compares them
//! with the resolver's current target, and yields [`PracticeEngineEvent`]s.
//!
//! Per note the machine moves `Listening -> Holding -> Matched`. Holding
//! credits every in-tolerance frame with one frame interval; any
//! silence, wrong note or out-of-tolerance frame drops it back to
//! `Listening` with zero progress. Once a note is matched the machine waits,
//! consuming frames silently, until the resolver reports a different index.
//! A resolver with no target left completes the session.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::PipelineOptions;
use crate::error::PipelineError;
use crate::observation::{calculate_live_observations, LiveObserver, Observation};
use crate::session::{TargetNote, TargetNoteResolver};
use crate::stream::CancellationToken;
use crate::technique::{analyze_technique, NoteTechnique, RhythmContext};
use crate::{DetectedNote, RawDetection};

/// Events surfaced to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PracticeEngineEvent {
    /// A note was heard but it is not (in tune with) the target.
    NoteDetected { detection: DetectedNote },
    /// The target is being held in tune.
    HoldingNote { duration_ms: f32 },
    /// The target was held long enough.
    NoteMatched {
        note_index: usize,
        technique: NoteTechnique,
        observations: Vec<Observation>,
        is_perfect: bool,
    },
    /// Nothing usable was heard.
    NoNote,
    /// No target notes remain. Always the last event.
    SessionCompleted,
}

/// Tolerance and hold time in force for the current note.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Difficulty {
    pub cents_tolerance: f32,
    pub required_hold_time_ms: f32,
}

/// Maps the current perfect-note streak to a [`Difficulty`].
///
/// Injected into the pipeline so feedback policy can change without touching
/// the state machine. Closures `Fn(u32) -> Difficulty` implement it too.
pub trait DifficultyPolicy {
    fn difficulty(&self, perfect_streak: u32) -> Difficulty;
}

impl<F: Fn(u32) -> Difficulty> DifficultyPolicy for F {
    fn difficulty(&self, perfect_streak: u32) -> Difficulty {
        self(perfect_streak)
    }
}

/// The same difficulty regardless of streak.
#[derive(Debug, Clone, Copy)]
pub struct FixedDifficulty(pub Difficulty);

impl DifficultyPolicy for FixedDifficulty {
    fn difficulty(&self, _perfect_streak: u32) -> Difficulty {
        self.0
    }
}

/// Tightens tolerance and lengthens the hold as the perfect streak grows.
#[derive(Debug, Clone, Copy)]
pub struct StreakDifficulty {
    pub base: Difficulty,
    /// Cents removed from the tolerance per perfect note.
    pub tolerance_step: f32,
    pub min_tolerance: f32,
    /// Milliseconds added to the hold per perfect note.
    pub hold_step_ms: f32,
    pub max_hold_ms: f32,
}

impl StreakDifficulty {
    pub fn new(base: Difficulty) -> Self {
        Self {
            base,
            tolerance_step: 1.0,
            min_tolerance: 8.0,
            hold_step_ms: 50.0,
            max_hold_ms: base.required_hold_time_ms * 2.0,
        }
    }
}

impl DifficultyPolicy for StreakDifficulty {
    fn difficulty(&self, perfect_streak: u32) -> Difficulty {
        let streak = perfect_streak as f32;
        let min_tolerance = self.min_tolerance.min(self.base.cents_tolerance);
        let max_hold = self.max_hold_ms.max(self.base.required_hold_time_ms);
        Difficulty {
            cents_tolerance: (self.base.cents_tolerance - streak * self.tolerance_step)
                .max(min_tolerance),
            required_hold_time_ms: (self.base.required_hold_time_ms + streak * self.hold_step_ms)
                .min(max_hold),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPhase {
    Listening,
    Holding,
    Matched,
}

/// Hold-time state for the active target note.
#[derive(Debug, Clone)]
pub struct NoteMatchState {
    pub note_index: usize,
    pub phase: MatchPhase,
    pub hold_accumulated_ms: f32,
    pub last_frame_timestamp_ms: Option<u64>,
    /// In-tolerance detections of the current run, oldest evicted first.
    pub detection_window: VecDeque<DetectedNote>,
    window_capacity: usize,
    /// The run's first frame arrived before any frame interval was known.
    uncredited_frame: bool,
}

impl NoteMatchState {
    pub fn new(note_index: usize, window_capacity: usize) -> Self {
        let window_capacity = window_capacity.max(1);
        Self {
            note_index,
            phase: MatchPhase::Listening,
            hold_accumulated_ms: 0.0,
            last_frame_timestamp_ms: None,
            detection_window: VecDeque::with_capacity(window_capacity),
            window_capacity,
            uncredited_frame: false,
        }
    }

    /// Drops all progress on the current run.
    pub fn reset_hold(&mut self) {
        self.phase = MatchPhase::Listening;
        self.hold_accumulated_ms = 0.0;
        self.last_frame_timestamp_ms = None;
        self.detection_window.clear();
        self.uncredited_frame = false;
    }

    /// Adds an in-tolerance detection and returns the accumulated hold.
    ///
    /// Every detection is credited with one frame interval, the time since
    /// the previous raw frame. Without one (the very first frame of a
    /// stream) the credit is deferred to the next detection of the run, so
    /// N detections spaced `d` apart always hold for `N * d`.
    pub fn accumulate(&mut self, detection: DetectedNote, frame_interval_ms: Option<f32>) -> f32 {
        match frame_interval_ms {
            Some(interval) => {
                let frames = if self.uncredited_frame { 2.0 } else { 1.0 };
                self.hold_accumulated_ms += interval * frames;
                self.uncredited_frame = false;
            }
            None => self.uncredited_frame = true,
        }
        self.last_frame_timestamp_ms = Some(detection.timestamp_ms);
        if self.detection_window.len() == self.window_capacity {
            self.detection_window.pop_front();
        }
        self.detection_window.push_back(detection);
        self.phase = MatchPhase::Holding;
        self.hold_accumulated_ms
    }
}

/// Classifies a raw detection into a note or a reason for `NO_NOTE`.
pub fn classify(
    raw: &RawDetection,
    options: &PipelineOptions,
) -> Result<DetectedNote, PipelineError> {
    if raw.frequency_hz <= 0.0
        || raw.rms < options.min_rms
        || raw.confidence < options.min_confidence
    {
        return Err(PipelineError::SignalTooWeak);
    }
    raw.detected_note().ok_or(PipelineError::UnmappablePitch {
        frequency_hz: raw.frequency_hz,
    })
}

/// Pull-based iterator of practice events.
///
/// Yields `Ok` events until the session completes, the raw stream ends, or the
/// token is cancelled. A resolver failure is yielded once as `Err` and ends the
/// iterator.
pub struct PracticeEventPipeline<I, R> {
    raw: I,
    resolver: R,
    options: PipelineOptions,
    difficulty: Box<dyn DifficultyPolicy + Send>,
    cancel: CancellationToken,
    state: NoteMatchState,
    observer: LiveObserver,
    perfect_streak: u32,
    current_target: Option<TargetNote>,
    last_raw_timestamp_ms: Option<u64>,
    finished: bool,
}

impl<I, R> PracticeEventPipeline<I, R>
where
    I: Iterator<Item = RawDetection>,
    R: TargetNoteResolver,
{
    pub fn new(raw: I, resolver: R, options: PipelineOptions, cancel: CancellationToken) -> Self {
        let fixed = FixedDifficulty(Difficulty {
            cents_tolerance: options.cents_tolerance,
            required_hold_time_ms: options.required_hold_time_ms,
        });
        let state = NoteMatchState::new(0, options.detection_window_capacity);
        let observer = LiveObserver::new(options.observation_window_capacity);
        Self {
            raw,
            resolver,
            options,
            difficulty: Box::new(fixed),
            cancel,
            state,
            observer,
            perfect_streak: 0,
            current_target: None,
            last_raw_timestamp_ms: None,
            finished: false,
        }
    }

    /// Replaces the fixed tolerance/hold time with a streak-driven policy.
    pub fn with_difficulty(mut self, policy: impl DifficultyPolicy + Send + 'static) -> Self {
        self.difficulty = Box::new(policy);
        self
    }

    pub fn state(&self) -> &NoteMatchState {
        &self.state
    }

    pub fn perfect_streak(&self) -> u32 {
        self.perfect_streak
    }

    pub fn current_difficulty(&self) -> Difficulty {
        self.difficulty.difficulty(self.perfect_streak)
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Up to two live tips for the current target, from the rolling window.
    pub fn live_observations(&mut self) -> Vec<Observation> {
        match &self.current_target {
            Some(target) => self.observer.observations(&target.pitch_name),
            None => Vec::new(),
        }
    }

    /// Processes one frame. `Ok(None)` means the frame produced no event.
    fn step(&mut self, raw: &RawDetection) -> Result<Option<PracticeEngineEvent>, PipelineError> {
        let frame_interval_ms = self
            .last_raw_timestamp_ms
            .map(|last| raw.timestamp_ms.saturating_sub(last) as f32);
        self.last_raw_timestamp_ms = Some(raw.timestamp_ms);

        // One snapshot of the externally owned state per frame.
        let (index, target) = self.resolver.snapshot().map_err(PipelineError::Resolver)?;

        let past_exercise = self
            .options
            .exercise
            .as_ref()
            .is_some_and(|exercise| index >= exercise.len());
        let target = match target {
            Some(target) if !past_exercise => target,
            _ => {
                tracing::info!(index, "practice session completed");
                return Ok(Some(PracticeEngineEvent::SessionCompleted));
            }
        };
        if target.index != index {
            return Err(PipelineError::Resolver(anyhow::anyhow!(
                "resolver returned note {} while reporting index {}",
                target.index,
                index
            )));
        }

        if self.state.note_index != index {
            tracing::debug!(
                from = self.state.note_index,
                to = index,
                pitch = %target.pitch_name,
                "target note changed"
            );
            self.state = NoteMatchState::new(index, self.options.detection_window_capacity);
        }

        if raw.rms >= self.options.min_rms {
            if let Some(note) = raw.detected_note() {
                self.observer.push(note);
            }
        }

        if self.state.phase == MatchPhase::Matched {
            self.current_target = Some(target);
            return Ok(None);
        }

        let difficulty = self.difficulty.difficulty(self.perfect_streak);
        let event = match classify(raw, &self.options) {
            Err(_) => {
                self.state.reset_hold();
                PracticeEngineEvent::NoNote
            }
            Ok(note)
                if note.pitch_name != target.pitch_name
                    || note.cents_deviation.abs() >= difficulty.cents_tolerance =>
            {
                self.state.reset_hold();
                PracticeEngineEvent::NoteDetected { detection: note }
            }
            Ok(note) => {
                let held = self.state.accumulate(note, frame_interval_ms);
                if held >= difficulty.required_hold_time_ms {
                    self.complete_note(&target, difficulty)
                } else {
                    PracticeEngineEvent::HoldingNote { duration_ms: held }
                }
            }
        };
        self.current_target = Some(target);
        Ok(Some(event))
    }

    fn complete_note(&mut self, target: &TargetNote, difficulty: Difficulty) -> PracticeEngineEvent {
        let window: Vec<DetectedNote> = self.state.detection_window.iter().cloned().collect();
        let rhythm = self.rhythm_context(target);
        let technique = analyze_technique(&window, difficulty.cents_tolerance, rhythm.as_ref());
        let observations = calculate_live_observations(&window, &target.pitch_name);
        let is_perfect = window
            .iter()
            .all(|d| d.cents_deviation.abs() < self.options.perfect_cents);

        self.perfect_streak = if is_perfect { self.perfect_streak + 1 } else { 0 };
        self.state.phase = MatchPhase::Matched;
        tracing::debug!(
            index = target.index,
            pitch = %target.pitch_name,
            held_ms = self.state.hold_accumulated_ms,
            is_perfect,
            streak = self.perfect_streak,
            "note matched"
        );

        PracticeEngineEvent::NoteMatched {
            note_index: target.index,
            technique,
            observations,
            is_perfect,
        }
    }

    fn rhythm_context(&self, target: &TargetNote) -> Option<RhythmContext> {
        let bpm = self.options.effective_bpm()?;
        let session_start_ms = self.options.session_start_ms?;
        Some(RhythmContext {
            bpm,
            session_start_ms,
            expected_onset_beats: self
                .options
                .exercise
                .as_ref()
                .and_then(|e| e.onset_beats(target.index)),
            duration_beats: target.duration_beats,
        })
    }
}

impl<I, R> Iterator for PracticeEventPipeline<I, R>
where
    I: Iterator<Item = RawDetection>,
    R: TargetNoteResolver,
{
    type Item = Result<PracticeEngineEvent, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                tracing::debug!("practice pipeline cancelled");
                self.finished = true;
                return None;
            }
            let Some(raw) = self.raw.next() else {
                self.finished = true;
                return None;
            };
            match self.step(&raw) {
                Ok(Some(event)) => {
                    if event == PracticeEngineEvent::SessionCompleted {
                        self.finished = true;
                    }
                    return Some(Ok(event));
                }
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "practice pipeline aborted");
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl<I, R> std::iter::FusedIterator for PracticeEventPipeline<I, R>
where
    I: Iterator<Item = RawDetection>,
    R: TargetNoteResolver,
{
}

/// Creates an event pipeline over a raw detection stream.
pub fn create_practice_event_pipeline<I, R>(
    raw_stream: I,
    resolver: R,
    options: PipelineOptions,
    cancel: CancellationToken,
) -> PracticeEventPipeline<I::IntoIter, R>
where
    I: IntoIterator<Item = RawDetection>,
    R: TargetNoteResolver,
{
    PracticeEventPipeline::new(raw_stream.into_iter(), resolver, options, cancel)
}
