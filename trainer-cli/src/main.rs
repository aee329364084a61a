//! # Trainer - Headless Practice Session Runner
//!
//! Listens to the default microphone, walks through an exercise and prints
//! practice events and live tips to stdout as JSON lines. Logs go to stderr.
//!
//! ## Architecture
//! - **Main Thread**: prints events, advances the session cursor on matches
//! - **Pipeline Thread**: owns the audio stream and the event pipeline
//! - **Communication**: crossbeam channel from the pipeline thread to main
//! - **Shutdown**: pressing Enter or finishing the exercise cancels the token

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, Sender};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use trainer_core::{
    audio::CpalFrameSource,
    practice::{Difficulty, StreakDifficulty},
    stream::IntervalScheduler,
    CancellationToken, Exercise, FeedbackProfile, Observation, PipelineOptions,
    PracticeEngineEvent, RawDetectionStream, SessionCursor,
};

/// Practiced when no exercise file is given.
const OPEN_STRINGS: [&str; 4] = ["G3", "D4", "A4", "E5"];

#[derive(Parser, Debug)]
#[command(name = "trainer", about = "Real-time instrument practice trainer")]
struct Args {
    /// Exercise file (JSON). Defaults to the four open violin strings.
    #[arg(long)]
    exercise: Option<PathBuf>,

    /// Pipeline options file (JSON). Command-line flags override it.
    #[arg(long)]
    options: Option<PathBuf>,

    /// Feedback preset: beginner, intermediate or advanced.
    #[arg(long, default_value = "intermediate")]
    profile: FeedbackProfile,

    /// In-tune band in cents.
    #[arg(long)]
    tolerance: Option<f32>,

    /// Hold time required to match a note, in milliseconds.
    #[arg(long)]
    hold_ms: Option<f32>,

    /// Tempo for rhythm scoring.
    #[arg(long)]
    bpm: Option<f32>,

    /// Highest detectable fundamental in Hz.
    #[arg(long)]
    max_frequency: Option<f32>,

    /// Analysis tick period in milliseconds.
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    /// Tighten tolerance and lengthen holds as the perfect streak grows.
    #[arg(long)]
    adaptive: bool,
}

/// Messages from the pipeline thread.
#[derive(Debug)]
enum Update {
    Event(PracticeEngineEvent),
    Tips(Vec<Observation>),
    Failed(String),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let exercise = load_exercise(args.exercise.as_deref())?;
    let options = build_options(&args, exercise.clone())?;
    let cursor = SessionCursor::from_exercise(&exercise)?;
    tracing::info!(
        exercise = %exercise.name,
        notes = cursor.len(),
        tolerance = options.cents_tolerance,
        hold_ms = options.required_hold_time_ms,
        "starting practice session"
    );

    let cancel = CancellationToken::new();
    let (update_tx, update_rx) = crossbeam_channel::unbounded();
    let worker = spawn_pipeline(
        options,
        cursor.clone(),
        cancel.clone(),
        update_tx,
        Duration::from_millis(args.tick_ms.max(1)),
        args.adaptive,
    );

    {
        let cancel = cancel.clone();
        thread::spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            tracing::info!("stop requested");
            cancel.cancel();
        });
    }

    let failure = relay(&update_rx, &cursor, &mut std::io::stdout().lock());

    cancel.cancel();
    if worker.join().is_err() {
        anyhow::bail!("pipeline thread panicked");
    }
    if let Some(reason) = failure? {
        anyhow::bail!("practice session failed: {reason}");
    }
    tracing::info!(completed = cursor.is_complete(), "session finished");
    Ok(())
}

/// Prints updates as JSON lines until the pipeline thread hangs up.
///
/// Advances the cursor on every match. Returns the pipeline's failure, if it
/// reported one.
fn relay<W: Write>(
    updates: &Receiver<Update>,
    cursor: &SessionCursor,
    out: &mut W,
) -> Result<Option<String>> {
    let mut failure = None;
    for update in updates.iter() {
        match update {
            Update::Event(event) => {
                if let PracticeEngineEvent::NoteMatched { .. } = &event {
                    cursor.advance();
                }
                serde_json::to_writer(&mut *out, &json!({ "event": event }))?;
                writeln!(out)?;
            }
            Update::Tips(tips) => {
                serde_json::to_writer(&mut *out, &json!({ "tips": tips }))?;
                writeln!(out)?;
            }
            Update::Failed(reason) => {
                tracing::error!(%reason, "practice pipeline failed");
                failure = Some(reason);
            }
        }
        out.flush()?;
    }
    Ok(failure)
}

fn load_exercise(path: Option<&Path>) -> Result<Exercise> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading exercise {}", path.display()))?;
            Ok(Exercise::from_json_str(&json)?)
        }
        None => Ok(Exercise::from_pitches("Open strings", &OPEN_STRINGS)),
    }
}

fn build_options(args: &Args, exercise: Exercise) -> Result<PipelineOptions> {
    let mut options = match &args.options {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading options {}", path.display()))?;
            PipelineOptions::from_json_str(&json)?
        }
        None => args.profile.options(),
    };
    if let Some(tolerance) = args.tolerance {
        options.cents_tolerance = tolerance;
    }
    if let Some(hold_ms) = args.hold_ms {
        options.required_hold_time_ms = hold_ms;
    }
    if let Some(bpm) = args.bpm {
        options.bpm = Some(bpm);
    }
    if let Some(max_frequency) = args.max_frequency {
        options.yin.max_frequency_hz = max_frequency;
    }
    options.exercise = Some(exercise);
    // The interval scheduler's clock starts when the pipeline does.
    if options.effective_bpm().is_some() && options.session_start_ms.is_none() {
        options.session_start_ms = Some(0);
    }
    Ok(options)
}

/// Starts the dedicated pipeline thread.
///
/// The audio stream is created on this thread and never leaves it. The
/// thread exits when the pipeline ends, the token is cancelled, or the main
/// thread stops listening.
fn spawn_pipeline(
    options: PipelineOptions,
    cursor: SessionCursor,
    cancel: CancellationToken,
    updates: Sender<Update>,
    tick: Duration,
    adaptive: bool,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let source = match CpalFrameSource::start() {
            Ok(source) => source,
            Err(e) => {
                let _ = updates.send(Update::Failed(format!("audio capture: {e:#}")));
                return;
            }
        };

        let raw = RawDetectionStream::new(
            source,
            IntervalScheduler::new(tick),
            options.yin,
            cancel.clone(),
        );
        let base = Difficulty {
            cents_tolerance: options.cents_tolerance,
            required_hold_time_ms: options.required_hold_time_ms,
        };
        let mut pipeline =
            trainer_core::create_practice_event_pipeline(raw, cursor, options, cancel.clone());
        if adaptive {
            pipeline = pipeline.with_difficulty(StreakDifficulty::new(base));
        }

        let mut last_tips: Vec<Observation> = Vec::new();
        while let Some(item) = pipeline.next() {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    let _ = updates.send(Update::Failed(e.to_string()));
                    break;
                }
            };
            let completed = event == PracticeEngineEvent::SessionCompleted;
            if updates.send(Update::Event(event)).is_err() {
                break;
            }
            if completed {
                break;
            }

            let tips = pipeline.live_observations();
            if tips != last_tips {
                if updates.send(Update::Tips(tips.clone())).is_err() {
                    break;
                }
                last_tips = tips;
            }
        }
        tracing::debug!("pipeline thread exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use trainer_core::NoteTechnique;

    fn matched(note_index: usize) -> Update {
        Update::Event(PracticeEngineEvent::NoteMatched {
            note_index,
            technique: NoteTechnique::default(),
            observations: Vec::new(),
            is_perfect: true,
        })
    }

    #[test]
    fn relay_advances_on_matches_and_prints_json_lines() {
        let cursor = SessionCursor::from_exercise(&Exercise::from_pitches("t", &["A4", "B4"])).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(Update::Event(PracticeEngineEvent::NoNote)).unwrap();
        tx.send(matched(0)).unwrap();
        drop(tx);

        let mut out = Vec::new();
        let failure = relay(&rx, &cursor, &mut out).unwrap();

        assert_eq!(failure, None);
        assert_eq!(cursor.index(), 1);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("NO_NOTE"));
        assert!(lines[1].contains("NOTE_MATCHED"));
    }

    #[test]
    fn relay_reports_pipeline_failures() {
        let cursor = SessionCursor::from_exercise(&Exercise::from_pitches("t", &["A4"])).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(Update::Failed("audio capture: no input device".to_string()))
            .unwrap();
        drop(tx);

        let failure = relay(&rx, &cursor, &mut Vec::new()).unwrap();
        assert_eq!(failure.as_deref(), Some("audio capture: no input device"));
        assert_eq!(cursor.index(), 0);
    }
}
