//! Inbound audio payload decoding.
//!
//! Two payload shapes reach playback:
//!
//! - RIFF/WAVE containers (any bit depth hound reads, any channel count);
//! - raw signed 16-bit little-endian mono PCM, rate taken from a `rate=`
//!   MIME parameter (`audio/pcm;rate=24000`) or the configured default.

use std::io::Cursor;
use std::ops::RangeInclusive;

use hound::{SampleFormat, WavReader};

use crate::error::DecodeError;

/// Mono f32 samples plus their rate.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Decode `bytes` into mono f32 samples.
///
/// `mime` may be `None` for native binary frames. `default_rate` applies to
/// raw PCM when the MIME type names no rate.
pub fn decode_payload(
    bytes: &[u8],
    mime: Option<&str>,
    default_rate: u32,
) -> Result<DecodedAudio, DecodeError> {
    if is_riff_wave(bytes) {
        return decode_wav(bytes);
    }

    let mut sample_rate = default_rate;
    if let Some(mime) = mime {
        let mut parts = mime.split(';').map(str::trim);
        let essence = parts.next().unwrap_or_default().to_ascii_lowercase();
        if !matches!(
            essence.as_str(),
            "" | "audio/pcm" | "audio/l16" | "audio/raw" | "application/octet-stream"
        ) {
            return Err(DecodeError::UnsupportedAudio(format!(
                "mime type `{essence}`"
            )));
        }
        for param in parts {
            if let Some((key, value)) = param.split_once('=') {
                if key.trim().eq_ignore_ascii_case("rate") {
                    sample_rate = value.trim().parse().map_err(|_| {
                        DecodeError::UnsupportedAudio(format!("bad rate parameter `{value}`"))
                    })?;
                }
            }
        }
    }

    check_rate(sample_rate)?;
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::UnsupportedAudio(format!(
            "odd PCM16 byte length {}",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Payload rates accepted from the wire. Anything outside would make the
/// resampler allocate and emit audio out of proportion to the payload.
pub const PAYLOAD_RATES: RangeInclusive<u32> = 8_000..=192_000;

fn check_rate(sample_rate: u32) -> Result<(), DecodeError> {
    if PAYLOAD_RATES.contains(&sample_rate) {
        Ok(())
    } else {
        Err(DecodeError::UnsupportedAudio(format!(
            "sample rate {sample_rate} Hz outside {}..={} Hz",
            PAYLOAD_RATES.start(),
            PAYLOAD_RATES.end()
        )))
    }
}

fn is_riff_wave(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio, DecodeError> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    check_rate(spec.sample_rate)?;
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            if !(1..=32).contains(&bits) {
                return Err(DecodeError::UnsupportedAudio(format!("{bits}-bit WAV")));
            }
            let scale = (1u64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}
