//! # Audio Capture Module
//!
//! Production [`FrameSource`] backed by CPAL (Cross-Platform Audio Library).
//! The input callback downmixes to mono and ships sample chunks over a
//! bounded crossbeam channel; [`CpalFrameSource::frame`] drains whatever has
//! arrived and returns the most recent [`BUFFER_SIZE`] samples.
//!
//! Device permissions, retries and reconnection are left to the caller. A
//! stream error closes the source.

use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SupportedStreamConfigRange;
use crossbeam_channel::{Receiver, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::stream::FrameSource;

/// Number of samples per analysis frame.
///
/// ~46 ms at 44.1 kHz, which covers more than two periods of the lowest
/// detectable note.
pub const BUFFER_SIZE: usize = 2048;

/// Preferred capture rate.
pub const TARGET_SAMPLE_RATE: u32 = 44_100;

/// Chunks buffered between the audio callback and the analysis loop.
const CHANNEL_CAPACITY: usize = 64;

/// Microphone input as a frame source.
pub struct CpalFrameSource {
    // Capture stops when the stream is dropped.
    _stream: cpal::Stream,
    receiver: Receiver<Vec<f32>>,
    failed: Arc<AtomicBool>,
    sample_rate: u32,
    frame: Vec<f32>,
}

impl CpalFrameSource {
    /// Starts capture from the default input device.
    ///
    /// Picks an f32 input configuration, preferring mono and a rate close to
    /// [`TARGET_SAMPLE_RATE`], and starts the stream immediately.
    pub fn start() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("No input device available"))?;

        tracing::info!(device = %device.name()?, "using audio input device");

        let configs = device.supported_input_configs()?.collect::<Vec<_>>();
        let supported_config = find_supported_config(configs, TARGET_SAMPLE_RATE)
            .ok_or_else(|| anyhow!("No suitable f32 input format found"))?;

        let rate = TARGET_SAMPLE_RATE.clamp(
            supported_config.min_sample_rate().0,
            supported_config.max_sample_rate().0,
        );
        let config = supported_config.with_sample_rate(cpal::SampleRate(rate));
        let sample_rate = config.sample_rate().0;
        let channels = config.channels().max(1) as usize;
        let config: cpal::StreamConfig = config.into();

        tracing::info!(sample_rate, channels, "selected input configuration");

        let (sender, receiver) = crossbeam_channel::bounded::<Vec<f32>>(CHANNEL_CAPACITY);
        let failed = Arc::new(AtomicBool::new(false));
        let failed_flag = Arc::clone(&failed);
        let err_fn = move |err| {
            tracing::error!(error = %err, "audio input stream failed");
            failed_flag.store(true, Ordering::Release);
        };

        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = if channels == 1 {
                    data.to_vec()
                } else {
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                        .collect()
                };
                // A full channel means the analysis loop is behind; older
                // audio is worthless to it, so the chunk is dropped.
                let _ = sender.try_send(mono);
            },
            err_fn,
            None,
        )?;

        stream.play()?;

        Ok(Self {
            _stream: stream,
            receiver,
            failed,
            sample_rate,
            frame: vec![0.0; BUFFER_SIZE],
        })
    }

    fn push_samples(&mut self, chunk: &[f32]) {
        push_latest(&mut self.frame, chunk);
    }
}

impl FrameSource for CpalFrameSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frame(&mut self) -> Option<&[f32]> {
        if self.failed.load(Ordering::Acquire) {
            return None;
        }
        loop {
            match self.receiver.try_recv() {
                Ok(chunk) => self.push_samples(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return None,
            }
        }
        Some(&self.frame)
    }
}

/// Shifts `chunk` into the end of `frame`, keeping the newest samples.
fn push_latest(frame: &mut [f32], chunk: &[f32]) {
    let len = frame.len();
    if chunk.len() >= len {
        frame.copy_from_slice(&chunk[chunk.len() - len..]);
    } else {
        frame.copy_within(chunk.len().., 0);
        frame[len - chunk.len()..].copy_from_slice(chunk);
    }
}

/// Finds the best supported audio configuration for the target sample rate.
///
/// Only 32-bit float formats qualify. Mono wins over multi-channel, then the
/// range closest to `target_rate`.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let covers = c.min_sample_rate().0 <= target_rate && target_rate <= c.max_sample_rate().0;
            let min_diff = (c.min_sample_rate().0 as i64 - target_rate as i64).abs();
            let max_diff = (c.max_sample_rate().0 as i64 - target_rate as i64).abs();
            let rate_distance = if covers { 0 } else { min_diff.min(max_diff) };
            (c.channels() != 1, rate_distance)
        })
}
