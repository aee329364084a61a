//! # Raw Detection Stream
//!
//! Turns a frame source and a tick source into a pull-based sequence of
//! [`RawDetection`]s. Each call to `next` pulls one frame, runs the RMS gate
//! and the pitch estimator, and returns the detection; the following call
//! first suspends until the next tick. Schedulers fire their first tick
//! immediately, so the first frame is analyzed as soon as the stream is
//! polled.
//!
//! The stream is single-consumer and not restartable. Cancellation is polled
//! before and after every tick wait, so a cancel takes effect within one
//! frame period.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pitch::{rms, PitchEstimate, PitchEstimator, YinConfig};
use crate::RawDetection;

/// Source of PCM frames. Hardware acquisition, retries and device changes are
/// the implementor's business.
pub trait FrameSource {
    fn sample_rate(&self) -> u32;

    /// The most recent frame, or `None` once the source is closed.
    fn frame(&mut self) -> Option<&[f32]>;
}

/// Tick source that paces the detection loop.
pub trait FrameScheduler {
    /// Blocks until the next tick and returns its timestamp in milliseconds.
    /// The first tick fires without waiting. Returns `None` when cancelled or
    /// when the scheduler has run out.
    fn next_tick(&mut self, cancel: &CancellationToken) -> Option<u64>;
}

/// Cooperative cancellation flag shared between a pipeline and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Wall-clock scheduler firing every `period`, backed by a crossbeam ticker.
///
/// Timestamps are milliseconds since the scheduler was created. A slow
/// consumer does not queue ticks: the ticker channel holds at most one.
#[derive(Debug)]
pub struct IntervalScheduler {
    ticker: Receiver<Instant>,
    period: Duration,
    started: Instant,
    fired: bool,
}

impl IntervalScheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            ticker: crossbeam_channel::tick(period),
            period,
            started: Instant::now(),
            fired: false,
        }
    }

    /// Roughly display refresh rate.
    pub fn sixty_hz() -> Self {
        Self::new(Duration::from_micros(16_667))
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl FrameScheduler for IntervalScheduler {
    fn next_tick(&mut self, cancel: &CancellationToken) -> Option<u64> {
        if !self.fired && !cancel.is_cancelled() {
            self.fired = true;
            return Some(self.started.elapsed().as_millis() as u64);
        }
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            // Wake up at least once per period to observe cancellation.
            match self.ticker.recv_timeout(self.period * 2) {
                Ok(at) => return Some(at.duration_since(self.started).as_millis() as u64),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

/// Deterministic scheduler on a virtual clock.
///
/// Ticks start at `start_ms` and advance by `step_ms` without sleeping. With a
/// limit it stops after that many ticks. Used for offline replays and tests.
#[derive(Debug, Clone)]
pub struct StepScheduler {
    now_ms: u64,
    step_ms: u64,
    remaining: Option<usize>,
}

impl StepScheduler {
    pub fn new(start_ms: u64, step_ms: u64) -> Self {
        Self {
            now_ms: start_ms,
            step_ms,
            remaining: None,
        }
    }

    pub fn with_limit(mut self, ticks: usize) -> Self {
        self.remaining = Some(ticks);
        self
    }
}

impl FrameScheduler for StepScheduler {
    fn next_tick(&mut self, cancel: &CancellationToken) -> Option<u64> {
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let now = self.now_ms;
        self.now_ms += self.step_ms;
        Some(now)
    }
}

/// Plays back pre-recorded frames in order, then closes.
#[derive(Debug, Clone)]
pub struct ReplayFrameSource {
    sample_rate: u32,
    frames: VecDeque<Vec<f32>>,
    current: Vec<f32>,
}

impl ReplayFrameSource {
    pub fn new(sample_rate: u32, frames: impl IntoIterator<Item = Vec<f32>>) -> Self {
        Self {
            sample_rate,
            frames: frames.into_iter().collect(),
            current: Vec::new(),
        }
    }

    /// Splits a recording into consecutive non-overlapping frames.
    pub fn from_samples(sample_rate: u32, samples: &[f32], frame_len: usize) -> Self {
        let frame_len = frame_len.max(1);
        Self::new(
            sample_rate,
            samples.chunks_exact(frame_len).map(<[f32]>::to_vec),
        )
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ReplayFrameSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frame(&mut self) -> Option<&[f32]> {
        self.current = self.frames.pop_front()?;
        Some(&self.current)
    }
}

/// Iterator of raw detections driven by a frame source and a scheduler.
pub struct RawDetectionStream<S, C> {
    source: S,
    scheduler: C,
    estimator: PitchEstimator,
    cancel: CancellationToken,
    finished: bool,
}

impl<S: FrameSource, C: FrameScheduler> RawDetectionStream<S, C> {
    pub fn new(source: S, scheduler: C, config: YinConfig, cancel: CancellationToken) -> Self {
        Self {
            source,
            scheduler,
            estimator: PitchEstimator::new(config),
            cancel,
            finished: false,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn finish(&mut self, reason: &str) -> Option<RawDetection> {
        if !self.finished {
            tracing::debug!(reason, "raw detection stream stopped");
            self.finished = true;
        }
        None
    }
}

impl<S: FrameSource, C: FrameScheduler> Iterator for RawDetectionStream<S, C> {
    type Item = RawDetection;

    fn next(&mut self) -> Option<RawDetection> {
        if self.finished || self.cancel.is_cancelled() {
            return self.finish("cancelled");
        }
        let Some(timestamp_ms) = self.scheduler.next_tick(&self.cancel) else {
            return self.finish("scheduler stopped");
        };
        if self.cancel.is_cancelled() {
            return self.finish("cancelled");
        }

        let sample_rate = self.source.sample_rate();
        let Some(frame) = self.source.frame() else {
            return self.finish("frame source closed");
        };

        let level = rms(frame);
        let rms_threshold = self.estimator.config().rms_threshold;
        let estimate = if level < rms_threshold {
            PitchEstimate::NONE
        } else {
            self.estimator.estimate(frame, sample_rate)
        };
        tracing::trace!(
            timestamp_ms,
            frequency_hz = estimate.frequency_hz,
            confidence = estimate.confidence,
            "frame analyzed"
        );

        Some(RawDetection::new(
            estimate.frequency_hz,
            estimate.confidence,
            level,
            timestamp_ms,
        ))
    }
}

impl<S: FrameSource, C: FrameScheduler> std::iter::FusedIterator for RawDetectionStream<S, C> {}

/// Creates a raw detection stream with the default estimator settings.
pub fn create_raw_detection_stream<S: FrameSource, C: FrameScheduler>(
    frame_source: S,
    scheduler: C,
    cancel: CancellationToken,
) -> RawDetectionStream<S, C> {
    RawDetectionStream::new(frame_source, scheduler, YinConfig::default(), cancel)
}
