//! # Fast Fourier Transform (FFT) Module
//!
//! FFT-backed building blocks for the pitch estimator. The YIN difference
//! function is a sum of squared differences over every candidate lag, which
//! costs O(N²) when computed directly. Expanding the square leaves two energy
//! terms (prefix sums) and one cross-correlation term, and the
//! cross-correlation is computed here in O(N log N) with RustFFT.
//!
//! ## Features
//! - DC offset removal
//! - Cached forward/inverse plans per frame size
//! - Difference function `d(τ)` for all lags up to half the frame

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Removes the DC offset from a signal by making its average value zero.
///
/// A constant offset inflates every lag of the difference function equally
/// and would otherwise bias the normalized minimum.
pub fn remove_dc_offset(signal: &mut [f32]) {
    let len = signal.len();
    if len == 0 {
        return;
    }
    let avg = signal.iter().sum::<f32>() / len as f32;
    if avg.abs() > 1e-6 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Computes the YIN difference function for frames of one fixed size.
///
/// The correlator owns its FFT plans and scratch buffers so repeated calls
/// on same-sized frames do not allocate.
pub struct Correlator {
    frame_len: usize,
    fft_len: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    signal_spectrum: Vec<Complex<f32>>,
    window_spectrum: Vec<Complex<f32>>,
    prefix_energy: Vec<f32>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("frame_len", &self.frame_len)
            .field("fft_len", &self.fft_len)
            .finish()
    }
}

impl Correlator {
    /// Plans transforms for frames of `frame_len` samples.
    pub fn new(frame_len: usize) -> Self {
        // The integration window is half the frame. Zero-padding to at least
        // frame_len + window keeps the circular correlation free of wrap-around
        // for every lag we read back.
        let window = frame_len / 2;
        let fft_len = (frame_len + window).max(1).next_power_of_two();
        let mut planner = FftPlanner::new();
        Self {
            frame_len,
            fft_len,
            forward: planner.plan_fft_forward(fft_len),
            inverse: planner.plan_fft_inverse(fft_len),
            signal_spectrum: vec![Complex::new(0.0, 0.0); fft_len],
            window_spectrum: vec![Complex::new(0.0, 0.0); fft_len],
            prefix_energy: vec![0.0; frame_len + 1],
        }
    }

    /// Frame length this correlator was planned for.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Writes `d(τ) = Σ_{j<W} (x[j] - x[j+τ])²` for `τ` in `0..W` into `out`,
    /// where `W = frame_len / 2`.
    ///
    /// `signal` must be exactly `frame_len` samples; `out` is resized to `W`.
    pub fn difference(&mut self, signal: &[f32], out: &mut Vec<f32>) {
        debug_assert_eq!(signal.len(), self.frame_len);
        let window = self.frame_len / 2;
        out.clear();
        out.resize(window, 0.0);
        if window == 0 {
            return;
        }

        for (slot, &s) in self.signal_spectrum.iter_mut().zip(signal) {
            *slot = Complex::new(s, 0.0);
        }
        for slot in self.signal_spectrum[signal.len()..].iter_mut() {
            *slot = Complex::new(0.0, 0.0);
        }
        for (slot, &s) in self.window_spectrum.iter_mut().zip(&signal[..window]) {
            *slot = Complex::new(s, 0.0);
        }
        for slot in self.window_spectrum[window..].iter_mut() {
            *slot = Complex::new(0.0, 0.0);
        }

        self.forward.process(&mut self.signal_spectrum);
        self.forward.process(&mut self.window_spectrum);
        for (a, b) in self
            .signal_spectrum
            .iter_mut()
            .zip(self.window_spectrum.iter())
        {
            *a *= b.conj();
        }
        self.inverse.process(&mut self.signal_spectrum);
        // RustFFT does not normalize the inverse transform.
        let scale = 1.0 / self.fft_len as f32;

        self.prefix_energy[0] = 0.0;
        for (i, &s) in signal.iter().enumerate() {
            self.prefix_energy[i + 1] = self.prefix_energy[i] + s * s;
        }
        let head_energy = self.prefix_energy[window];

        for (tau, d) in out.iter_mut().enumerate() {
            let shifted_energy = self.prefix_energy[tau + window] - self.prefix_energy[tau];
            let cross = self.signal_spectrum[tau].re * scale;
            // Rounding can push tiny values below zero.
            *d = (head_energy + shifted_energy - 2.0 * cross).max(0.0);
        }
    }
}
