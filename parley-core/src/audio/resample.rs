//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Two directions use this:
//!
//! - capture: device native rate (commonly 44.1/48 kHz) → 16 kHz wire rate,
//!   streamed window by window on the capture thread;
//! - playback: payload rate (24 kHz from the remote service) → output device
//!   rate, converted one payload at a time with [`RateConverter::convert`].
//!
//! When both rates match, `RateConverter` is a passthrough and no rubato
//! session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{ParleyError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when input rate == output rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input chunks between calls.
    input_buf: Vec<f32>,
    /// Input frame count per rubato call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    ratio: f64,
}

impl RateConverter {
    /// # Errors
    /// Returns `ParleyError::AudioStream` if rubato fails to initialise.
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self> {
        if input_rate == output_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                ratio: 1.0,
            });
        }

        if input_rate == 0 || output_rate == 0 {
            return Err(ParleyError::AudioStream(format!(
                "invalid resampling rates {input_rate} → {output_rate}"
            )));
        }

        let ratio = output_rate as f64 / input_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| ParleyError::AudioStream(format!("resampler init: {e}")))?;

        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];

        debug!(input_rate, output_rate, chunk_size, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
            ratio,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated until a full `chunk_size` block is available;
    /// any remainder waits for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Push out whatever partial chunk is still buffered.
    ///
    /// rubato zero-pads the partial chunk; only the share of output that
    /// corresponds to real input is returned.
    pub fn flush(&mut self) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return Vec::new();
        };
        if self.input_buf.is_empty() {
            return Vec::new();
        }

        let remainder = std::mem::take(&mut self.input_buf);
        let wave_in = [remainder.as_slice()];
        match resampler.process_partial_into_buffer(Some(&wave_in[..]), &mut self.output_buf, None)
        {
            Ok((_consumed, produced)) => {
                let expected = (remainder.len() as f64 * self.ratio).ceil() as usize;
                self.output_buf[0][..produced.min(expected)].to_vec()
            }
            Err(e) => {
                error!("resampler flush error: {e}");
                Vec::new()
            }
        }
    }

    /// Convert a complete, self-contained buffer in one go.
    pub fn convert(&mut self, samples: &[f32]) -> Vec<f32> {
        let mut out = self.process(samples);
        out.extend(self.flush());
        out
    }

    /// Returns `true` when input rate == output rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
