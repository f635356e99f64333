//! Frequency-domain level analysis used by the VAD.
//!
//! ## Algorithm
//!
//! 1. Take the most recent `fft_size` samples (zero-padded at the front when
//!    the window is shorter).
//! 2. Apply a Blackman window and run a forward FFT.
//! 3. For each of the `fft_size / 2` positive-frequency bins, normalise the
//!    magnitude by `fft_size`, convert to dB and map `[min_db, max_db]`
//!    linearly onto a byte scale `[0, 255]`.
//! 4. Return the mean over all bins.
//!
//! The byte scale matches what browser analyser nodes report, so thresholds
//! tuned against those (e.g. `30`) carry over unchanged.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Smallest transform we accept; anything below has too few bins to average.
const MIN_FFT_SIZE: usize = 32;

pub struct SpectralAnalyser {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    min_db: f32,
    max_db: f32,
}

impl SpectralAnalyser {
    pub fn new(fft_size: usize, min_db: f32, max_db: f32) -> Self {
        let fft_size = fft_size.max(MIN_FFT_SIZE);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);
        // Guard against an inverted or empty range from config.
        let max_db = if max_db > min_db { max_db } else { min_db + 1.0 };

        Self {
            fft_size,
            fft,
            window: build_blackman_window(fft_size),
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
            min_db,
            max_db,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Mean byte-scaled magnitude over the positive-frequency bins, in `[0, 255]`.
    pub fn mean_magnitude(&mut self, samples: &[f32]) -> f32 {
        let n = self.fft_size;
        let tail = &samples[samples.len().saturating_sub(n)..];
        let offset = n - tail.len();

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < offset { 0.0 } else { tail[i - offset] };
            let sample = if sample.is_finite() { sample } else { 0.0 };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let bins = n / 2;
        let range = self.max_db - self.min_db;
        let sum: f32 = self.scratch[..bins]
            .iter()
            .map(|bin| {
                let magnitude = bin.norm() / n as f32;
                if magnitude <= 0.0 {
                    return 0.0;
                }
                let db = 20.0 * magnitude.log10();
                (255.0 * (db - self.min_db) / range).clamp(0.0, 255.0)
            })
            .sum();

        sum / bins as f32
    }
}

fn build_blackman_window(n: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    (0..n)
        .map(|i| {
            let x = std::f32::consts::TAU * i as f32 / n as f32;
            A0 - A1 * x.cos() + A2 * (2.0 * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize, amplitude: f32) -> Vec<f32> {
        let mut state = 0x2545_f491_u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state as f32 / u32::MAX as f32 * 2.0 - 1.0) * amplitude
            })
            .collect()
    }

    #[test]
    fn silence_has_zero_magnitude() {
        let mut analyser = SpectralAnalyser::new(256, -100.0, -30.0);
        assert_eq!(analyser.mean_magnitude(&vec![0.0; 4096]), 0.0);
    }

    #[test]
    fn broadband_noise_is_loud_and_bounded() {
        let mut analyser = SpectralAnalyser::new(256, -100.0, -30.0);
        let magnitude = analyser.mean_magnitude(&noise(4096, 0.3));
        assert!(magnitude > 100.0, "magnitude={magnitude}");
        assert!(magnitude <= 255.0);
    }

    #[test]
    fn faint_noise_stays_under_default_threshold() {
        let mut analyser = SpectralAnalyser::new(256, -100.0, -30.0);
        let magnitude = analyser.mean_magnitude(&noise(4096, 0.0005));
        assert!(magnitude < 30.0, "magnitude={magnitude}");
    }

    #[test]
    fn short_input_is_zero_padded() {
        let mut analyser = SpectralAnalyser::new(256, -100.0, -30.0);
        let magnitude = analyser.mean_magnitude(&noise(64, 0.3));
        assert!(magnitude > 0.0);
    }

    #[test]
    fn non_finite_samples_are_ignored() {
        let mut analyser = SpectralAnalyser::new(256, -100.0, -30.0);
        let mut samples = vec![0.0; 256];
        samples[10] = f32::NAN;
        samples[20] = f32::INFINITY;
        assert_eq!(analyser.mean_magnitude(&samples), 0.0);
    }

    #[test]
    fn tiny_fft_size_is_raised_to_minimum() {
        let analyser = SpectralAnalyser::new(4, -100.0, -30.0);
        assert_eq!(analyser.fft_size(), MIN_FFT_SIZE);
    }
}
