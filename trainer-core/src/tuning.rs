//! # Musical Tuning Module
//!
//! Maps measured frequencies onto equal-tempered pitch names and cent
//! deviations. Every detection in the practice pipeline goes through
//! [`nearest_note`], and every target note's reference frequency comes from
//! [`note_frequency`].
//!
//! ## Features
//! - 88-key note table (A0 to C8), A4 = 440 Hz
//! - Nearest-semitone mapping with cent deviation
//! - Note name parsing with flat/sharp normalization ("Bb3" -> "A#3")

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of keys in the note table.
pub const KEY_COUNT: usize = 88;

/// Key index of A4 in the note table.
const A4_KEY_INDEX: i32 = 48;

/// Concert pitch used by the note table.
pub const A4_FREQUENCY_HZ: f32 = 440.0;

/// Slack, in semitones, for treating a frequency as exactly half-way.
const HALF_STEP_EPSILON: f64 = 1e-4;

/// Represents a single musical note with its name and frequency.
#[derive(Debug, Clone)]
pub struct Note {
    /// Note name (e.g., "A4", "C#3")
    pub name: String,
    /// Frequency in Hz
    pub frequency: f32,
}

/// The result of mapping a frequency onto the note table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteMapping {
    /// Name of the nearest equal-tempered note.
    pub name: String,
    /// Index of that note in the table (0 is A0).
    pub key_index: u8,
    /// Reference frequency of the nearest note in Hz.
    pub reference_frequency: f32,
    /// Deviation from the reference in cents (positive = sharp).
    pub cents: f32,
}

/// Statically computed notes from A0 to C8.
///
/// Frequencies use equal temperament with A4 = 440 Hz, computed once at
/// startup.
static NOTES: Lazy<Vec<Note>> = Lazy::new(|| {
    const NOTE_NAMES: [&str; 12] = [
        "A", "A#", "B", "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#",
    ];
    (0..KEY_COUNT)
        .map(|i| {
            // f = f0 * 2^(n/12), n semitones away from A4.
            let frequency =
                A4_FREQUENCY_HZ * 2.0_f32.powf((i as f32 - A4_KEY_INDEX as f32) / 12.0);
            // The octave number changes at C, three keys after A.
            let octave = (i + 9) / 12;
            Note {
                name: format!("{}{}", NOTE_NAMES[i % 12], octave),
                frequency,
            }
        })
        .collect()
});

/// Name to key index lookups for normalized (sharp) names.
static NOTE_MAP: Lazy<BTreeMap<String, u8>> = Lazy::new(|| {
    NOTES
        .iter()
        .enumerate()
        .map(|(i, note)| (note.name.clone(), i as u8))
        .collect()
});

/// Finds the nearest equal-tempered note to a frequency.
///
/// Returns `None` for non-finite or non-positive frequencies and for
/// frequencies whose nearest semitone lies outside the A0..C8 table.
pub fn nearest_note(freq: f32) -> Option<NoteMapping> {
    if !freq.is_finite() || freq <= 0.0 {
        return None;
    }
    let semitones = 12.0 * (f64::from(freq) / f64::from(A4_FREQUENCY_HZ)).log2();
    // A frequency exactly between two notes belongs to the lower one.
    let key = (semitones - 0.5 - HALF_STEP_EPSILON).ceil() as i32 + A4_KEY_INDEX;
    if !(0..KEY_COUNT as i32).contains(&key) {
        return None;
    }
    let note = &NOTES[key as usize];
    Some(NoteMapping {
        name: note.name.clone(),
        key_index: key as u8,
        reference_frequency: note.frequency,
        cents: cents_between(freq, note.frequency),
    })
}

/// Looks up a note by its table index (0 is A0, 87 is C8).
pub fn note_by_index(key_index: u8) -> Option<&'static Note> {
    NOTES.get(key_index as usize)
}

/// Gets the table index of a normalized note name such as "C#4".
pub fn key_index_from_name(name: &str) -> Option<u8> {
    NOTE_MAP.get(name).copied()
}

/// Returns the reference frequency of a note name, accepting flats.
pub fn note_frequency(name: &str) -> Option<f32> {
    let normalized = normalize_note_name(name)?;
    let index = key_index_from_name(&normalized)?;
    note_by_index(index).map(|n| n.frequency)
}

/// Normalizes a note name to the table's sharp spelling.
///
/// Accepts `#`/`♯` and `b`/`♭` accidentals, so "Bb3" becomes "A#3" and
/// "Cb4" becomes "B3". Returns `None` for malformed names or names outside
/// the table.
pub fn normalize_note_name(name: &str) -> Option<String> {
    let mut chars = name.trim().chars().peekable();
    let letter = chars.next()?.to_ascii_uppercase();
    let mut pitch_class: i32 = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    while let Some(&c) = chars.peek() {
        match c {
            '#' | '♯' => pitch_class += 1,
            'b' | '♭' => pitch_class -= 1,
            _ => break,
        }
        chars.next();
    }
    let octave: i32 = chars.collect::<String>().parse().ok()?;
    let key = octave * 12 + pitch_class - 9;
    if !(0..KEY_COUNT as i32).contains(&key) {
        return None;
    }
    Some(NOTES[key as usize].name.clone())
}

/// Calculates the deviation from a target frequency in cents.
///
/// 100 cents = 1 semitone, 1200 cents = 1 octave. Positive values are
/// sharp, negative values are flat.
pub fn cents_between(freq: f32, target_freq: f32) -> f32 {
    1200.0 * (freq / target_freq).log2()
}
