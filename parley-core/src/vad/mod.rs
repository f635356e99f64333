//! Voice Activity Detection (VAD) with debounced speech/silence state.
//!
//! ## State machine
//!
//! ```text
//!            magnitude > threshold
//!   Silent ───────────────────────────► Speaking      (emit SpeechStart)
//!     ▲                                    │
//!     │ deadline reached                   │ magnitude < threshold
//!     │ (emit SpeechEnd)                   ▼
//!     └──────────────────────── silence deadline = now + debounce
//!                                          │
//!                                          │ magnitude > threshold
//!                                          ▼
//!                                   deadline cancelled, still Speaking
//! ```
//!
//! A window exactly at the threshold changes nothing.
//!
//! Time is passed in explicitly (`Instant`) so the capture thread drives the
//! deadline with wall-clock time and tests drive it with synthetic instants.
//! Callers must `poll()` before `process()` for the same instant so a due
//! `SpeechEnd` is not swallowed by a later crossing.

pub mod spectrum;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use spectrum::SpectralAnalyser;

/// Tunables for the detector.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Mean byte-scaled spectral magnitude above which a window is speech.
    /// Default: 30.
    pub threshold: f32,
    /// FFT length used for analysis. Default: 256.
    pub fft_size: usize,
    /// Continuous below-threshold interval required before `SpeechEnd`.
    /// Default: 500 ms.
    pub debounce: Duration,
    /// dB value mapped to byte 0. Default: -100.
    pub min_decibels: f32,
    /// dB value mapped to byte 255. Default: -30.
    pub max_decibels: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 30.0,
            fft_size: 256,
            debounce: Duration::from_millis(500),
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

/// Debounced speaking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechState {
    Silent,
    Speaking,
}

impl SpeechState {
    pub fn is_speaking(self) -> bool {
        self == SpeechState::Speaking
    }
}

/// Edge events produced by state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    SpeechEnd,
}

pub struct VoiceActivityDetector {
    config: VadConfig,
    analyser: SpectralAnalyser,
    state: SpeechState,
    /// Pending `SpeechEnd`; `None` means no silence timer is armed.
    silence_deadline: Option<Instant>,
    last_magnitude: f32,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        let analyser =
            SpectralAnalyser::new(config.fft_size, config.min_decibels, config.max_decibels);
        Self {
            config,
            analyser,
            state: SpeechState::Silent,
            silence_deadline: None,
            last_magnitude: 0.0,
        }
    }

    /// Analyse one audio window observed at `now`.
    ///
    /// Returns `Some(SpeechStart)` on the Silent → Speaking edge. Never returns
    /// `SpeechEnd`; that only comes out of [`poll`](Self::poll).
    pub fn process(&mut self, samples: &[f32], now: Instant) -> Option<VadEvent> {
        let magnitude = self.analyser.mean_magnitude(samples);
        self.last_magnitude = magnitude;

        if magnitude > self.config.threshold {
            if self.silence_deadline.take().is_some() {
                debug!(magnitude, "speech resumed — pending silence cancelled");
            }
            if self.state == SpeechState::Silent {
                self.state = SpeechState::Speaking;
                debug!(magnitude, threshold = self.config.threshold, "speech start");
                return Some(VadEvent::SpeechStart);
            }
        } else if magnitude < self.config.threshold
            && self.state == SpeechState::Speaking
            && self.silence_deadline.is_none()
        {
            self.silence_deadline = Some(now + self.config.debounce);
        }

        None
    }

    /// Fire a due `SpeechEnd` if the silence deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<VadEvent> {
        match self.silence_deadline {
            Some(deadline) if now >= deadline => {
                self.silence_deadline = None;
                self.state = SpeechState::Silent;
                debug!("speech end");
                Some(VadEvent::SpeechEnd)
            }
            _ => None,
        }
    }

    pub fn state(&self) -> SpeechState {
        self.state
    }

    /// Whether a `SpeechEnd` is currently scheduled.
    pub fn has_pending_silence(&self) -> bool {
        self.silence_deadline.is_some()
    }

    /// Mean spectral magnitude of the most recent window, byte scale.
    pub fn magnitude(&self) -> f32 {
        self.last_magnitude
    }

    /// Instantaneous, non-debounced level in `[0, 1]`.
    pub fn level(&self) -> f32 {
        (self.last_magnitude / 255.0).clamp(0.0, 1.0)
    }

    /// Cancel any pending deadline and return to Silent.
    pub fn reset(&mut self) {
        self.silence_deadline = None;
        self.state = SpeechState::Silent;
        self.last_magnitude = 0.0;
    }
}
