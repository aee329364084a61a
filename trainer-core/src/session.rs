//! # Session Module
//!
//! Target notes, exercises and the resolver port the pipeline reads the
//! current target through.
//!
//! Resolvers are called on every frame. They must be cheap and free of side
//! effects; the pipeline does not guard against a resolver that mutates
//! session state.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::tuning;

/// A note the performer is asked to play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetNote {
    /// Sharp-spelled note name, e.g. "G3".
    pub pitch_name: String,
    pub reference_frequency_hz: f32,
    /// Position in the exercise.
    pub index: usize,
    pub duration_beats: f32,
}

impl TargetNote {
    /// Builds a target from a note name, accepting flat spellings.
    pub fn new(pitch: &str, index: usize, duration_beats: f32) -> Result<Self> {
        let pitch_name = tuning::normalize_note_name(pitch)
            .ok_or_else(|| PipelineError::UnknownNote(pitch.to_string()))?;
        let reference_frequency_hz = tuning::note_frequency(&pitch_name)
            .ok_or_else(|| PipelineError::UnknownNote(pitch.to_string()))?;
        Ok(Self {
            pitch_name,
            reference_frequency_hz,
            index,
            duration_beats,
        })
    }
}

/// One entry of an exercise file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseNote {
    pub pitch: String,
    #[serde(default = "default_beats")]
    pub beats: f32,
}

fn default_beats() -> f32 {
    1.0
}

/// An ordered note sequence with an optional tempo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bpm: Option<f32>,
    pub notes: Vec<ExerciseNote>,
}

impl Exercise {
    /// Parses an exercise from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builds an exercise from note names, one beat each.
    pub fn from_pitches<S: AsRef<str>>(name: &str, pitches: &[S]) -> Self {
        Self {
            name: name.to_string(),
            bpm: None,
            notes: pitches
                .iter()
                .map(|p| ExerciseNote {
                    pitch: p.as_ref().to_string(),
                    beats: 1.0,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Resolves every note name, failing on the first unknown one.
    pub fn target_notes(&self) -> Result<Vec<TargetNote>> {
        self.notes
            .iter()
            .enumerate()
            .map(|(i, n)| TargetNote::new(&n.pitch, i, n.beats))
            .collect()
    }

    /// Beats elapsed before note `index` starts, `None` past the end.
    pub fn onset_beats(&self, index: usize) -> Option<f32> {
        (index < self.notes.len()).then(|| self.notes[..index].iter().map(|n| n.beats).sum())
    }
}

/// Read-only view of the externally owned session state.
///
/// Both selectors run on every frame. An `Err` is fatal: the pipeline stops
/// and hands the error to its consumer.
pub trait TargetNoteResolver {
    /// The note currently being asked for, `None` once the sequence is over.
    fn current_target(&self) -> anyhow::Result<Option<TargetNote>>;

    /// Index of the current note.
    fn current_index(&self) -> anyhow::Result<usize>;

    /// Index and target read together, as the pipeline sees them once per
    /// frame.
    ///
    /// Resolvers whose state can move between the two selectors (another
    /// thread advancing it) must override this with a single consistent read.
    fn snapshot(&self) -> anyhow::Result<(usize, Option<TargetNote>)> {
        Ok((self.current_index()?, self.current_target()?))
    }
}

impl<R: TargetNoteResolver + ?Sized> TargetNoteResolver for &R {
    fn current_target(&self) -> anyhow::Result<Option<TargetNote>> {
        (**self).current_target()
    }

    fn current_index(&self) -> anyhow::Result<usize> {
        (**self).current_index()
    }

    fn snapshot(&self) -> anyhow::Result<(usize, Option<TargetNote>)> {
        (**self).snapshot()
    }
}

/// Adapts a pair of closures into a [`TargetNoteResolver`].
pub struct FnResolver<T, I> {
    target: T,
    index: I,
}

impl<T, I> FnResolver<T, I>
where
    T: Fn() -> anyhow::Result<Option<TargetNote>>,
    I: Fn() -> anyhow::Result<usize>,
{
    pub fn new(target: T, index: I) -> Self {
        Self { target, index }
    }
}

impl<T, I> TargetNoteResolver for FnResolver<T, I>
where
    T: Fn() -> anyhow::Result<Option<TargetNote>>,
    I: Fn() -> anyhow::Result<usize>,
{
    fn current_target(&self) -> anyhow::Result<Option<TargetNote>> {
        (self.target)()
    }

    fn current_index(&self) -> anyhow::Result<usize> {
        (self.index)()
    }
}

/// Shared cursor over an exercise.
///
/// Clones share the same position: the pipeline holds one clone as its
/// resolver while the consumer advances another when a note is matched.
#[derive(Debug, Clone)]
pub struct SessionCursor {
    notes: Arc<[TargetNote]>,
    index: Arc<AtomicUsize>,
}

impl SessionCursor {
    pub fn new(notes: Vec<TargetNote>) -> Self {
        Self {
            notes: notes.into(),
            index: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Resolves an exercise's note names and starts at the first note.
    pub fn from_exercise(exercise: &Exercise) -> Result<Self> {
        Ok(Self::new(exercise.target_notes()?))
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    /// Moves to the next note and returns the new index.
    pub fn advance(&self) -> usize {
        self.index.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Jumps to `index`, e.g. when the performer skips a note.
    pub fn skip_to(&self, index: usize) {
        self.index.store(index, Ordering::Release);
    }

    pub fn reset(&self) {
        self.skip_to(0);
    }

    pub fn is_complete(&self) -> bool {
        self.index() >= self.notes.len()
    }
}

impl TargetNoteResolver for SessionCursor {
    fn current_target(&self) -> anyhow::Result<Option<TargetNote>> {
        Ok(self.notes.get(self.index()).cloned())
    }

    fn current_index(&self) -> anyhow::Result<usize> {
        Ok(self.index())
    }

    fn snapshot(&self) -> anyhow::Result<(usize, Option<TargetNote>)> {
        let index = self.index();
        Ok((index, self.notes.get(index).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_note_normalizes_flats() {
        let note = TargetNote::new("Bb3", 2, 0.5).unwrap();
        assert_eq!(note.pitch_name, "A#3");
        assert!((note.reference_frequency_hz - 233.08).abs() < 0.01);
        assert_eq!(note.index, 2);
    }

    #[test]
    fn unknown_note_is_an_error() {
        let err = TargetNote::new("X4", 0, 1.0).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownNote(name) if name == "X4"));
    }

    #[test]
    fn exercise_parses_from_json() {
        let exercise = Exercise::from_json_str(
            r#"{"name": "Open strings", "bpm": 60, "notes": [
                {"pitch": "G3", "beats": 2}, {"pitch": "D4"}, {"pitch": "A4"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(exercise.len(), 3);
        assert_eq!(exercise.bpm, Some(60.0));
        assert_eq!(exercise.notes[1].beats, 1.0);
        assert_eq!(exercise.onset_beats(0), Some(0.0));
        assert_eq!(exercise.onset_beats(2), Some(3.0));
        assert_eq!(exercise.onset_beats(3), None);
    }

    #[test]
    fn malformed_exercise_is_a_config_error() {
        let err = Exercise::from_json_str("{\"notes\": 3}").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn cursor_clones_share_position() {
        let exercise = Exercise::from_pitches("scale", &["G3", "A3"]);
        let cursor = SessionCursor::from_exercise(&exercise).unwrap();
        let view = cursor.clone();

        assert_eq!(view.current_target().unwrap().unwrap().pitch_name, "G3");
        assert_eq!(cursor.advance(), 1);
        assert_eq!(view.current_index().unwrap(), 1);
        assert_eq!(view.current_target().unwrap().unwrap().pitch_name, "A3");
        cursor.advance();
        assert!(view.is_complete());
        assert!(view.current_target().unwrap().is_none());
        cursor.reset();
        assert_eq!(view.index(), 0);
    }

    #[test]
    fn snapshot_stays_consistent_while_another_thread_advances() {
        let pitches = vec!["A4"; 2000];
        let cursor = SessionCursor::from_exercise(&Exercise::from_pitches("long", &pitches)).unwrap();
        let advancer = {
            let cursor = cursor.clone();
            std::thread::spawn(move || {
                for _ in 0..1999 {
                    cursor.advance();
                    std::thread::yield_now();
                }
            })
        };
        for _ in 0..20_000 {
            let (index, target) = cursor.snapshot().unwrap();
            if let Some(target) = target {
                assert_eq!(target.index, index);
            }
        }
        advancer.join().unwrap();
        assert_eq!(cursor.snapshot().unwrap().0, 1999);
    }

    #[test]
    fn fn_resolver_forwards_errors() {
        let resolver = FnResolver::new(|| Err(anyhow::anyhow!("store unavailable")), || Ok(0));
        assert!(resolver.current_target().is_err());
        assert_eq!(resolver.current_index().unwrap(), 0);
    }
}
