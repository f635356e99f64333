//! Offline VAD probe: run the speech detector over a WAV file and print the
//! detected speech segments.
//!
//! ```text
//! vad_probe <file.wav> [--threshold 30] [--debounce-ms 500] [--json]
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use parley_core::{
    audio::{decode::decode_payload, resample::RateConverter, SAMPLE_RATE},
    buffering::FrameAssembler,
    VadConfig, VadEvent, VoiceActivityDetector,
};
use serde::Serialize;

#[derive(Debug)]
struct Args {
    input: PathBuf,
    threshold: f32,
    debounce_ms: u64,
    json: bool,
}

#[derive(Debug, Serialize)]
struct Segment {
    start_ms: u64,
    end_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct Report {
    file: String,
    duration_ms: u64,
    windows: usize,
    peak_magnitude: f32,
    segments: Vec<Segment>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("vad_probe failed: {e}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Args, String> {
    let mut input: Option<PathBuf> = None;
    let defaults = VadConfig::default();
    let mut threshold = defaults.threshold;
    let mut debounce_ms = defaults.debounce.as_millis() as u64;
    let mut json = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--threshold" => {
                threshold = it
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or("--threshold needs a number")?;
            }
            "--debounce-ms" => {
                debounce_ms = it
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or("--debounce-ms needs an integer")?;
            }
            "--json" => json = true,
            "-h" | "--help" => {
                return Err(
                    "usage: vad_probe <file.wav> [--threshold N] [--debounce-ms N] [--json]".into(),
                )
            }
            other if input.is_none() => input = Some(PathBuf::from(other)),
            other => return Err(format!("unexpected argument `{other}`")),
        }
    }

    Ok(Args {
        input: input.ok_or("missing input WAV path")?,
        threshold,
        debounce_ms,
        json,
    })
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let bytes = std::fs::read(&args.input)
        .map_err(|e| format!("read {}: {e}", args.input.display()))?;
    let decoded = decode_payload(&bytes, Some("audio/wav"), SAMPLE_RATE)
        .map_err(|e| format!("decode {}: {e}", args.input.display()))?;

    let mut resampler = RateConverter::new(decoded.sample_rate, SAMPLE_RATE, 1024)
        .map_err(|e| e.to_string())?;
    let samples = resampler.convert(&decoded.samples);

    let config = VadConfig {
        threshold: args.threshold,
        debounce: Duration::from_millis(args.debounce_ms),
        ..VadConfig::default()
    };
    let mut vad = VoiceActivityDetector::new(config);
    let mut framer = FrameAssembler::new(parley_core::audio::FRAME_SAMPLES);

    // Synthetic clock: one window advances time by its audio duration.
    let origin = Instant::now();
    let window_ms = parley_core::audio::FRAME_SAMPLES as u64 * 1000 / u64::from(SAMPLE_RATE);
    let mut segments: Vec<Segment> = Vec::new();
    let mut windows = 0usize;
    let mut peak = 0f32;

    let record = |event: VadEvent, at_ms: u64, segments: &mut Vec<Segment>| match event {
        VadEvent::SpeechStart => segments.push(Segment {
            start_ms: at_ms,
            end_ms: None,
        }),
        VadEvent::SpeechEnd => {
            if let Some(open) = segments.last_mut() {
                open.end_ms = Some(at_ms);
            }
        }
    };

    for window in framer.push(&samples) {
        let at_ms = windows as u64 * window_ms;
        let now = origin + Duration::from_millis(at_ms);
        if let Some(event) = vad.poll(now) {
            record(event, at_ms, &mut segments);
        }
        if let Some(event) = vad.process(&window, now) {
            record(event, at_ms, &mut segments);
        }
        peak = peak.max(vad.magnitude());
        windows += 1;
    }

    let duration_ms = samples.len() as u64 * 1000 / u64::from(SAMPLE_RATE);
    if vad.has_pending_silence() {
        let end = origin + Duration::from_millis(duration_ms) + Duration::from_millis(args.debounce_ms);
        if let Some(event) = vad.poll(end) {
            record(event, duration_ms, &mut segments);
        }
    }

    let report = Report {
        file: args.input.display().to_string(),
        duration_ms,
        windows,
        peak_magnitude: peak,
        segments,
    };

    if args.json {
        let out = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{out}");
    } else {
        println!(
            "{}: {} ms, {} windows, peak magnitude {:.1}",
            report.file, report.duration_ms, report.windows, report.peak_magnitude
        );
        for (i, seg) in report.segments.iter().enumerate() {
            match seg.end_ms {
                Some(end) => println!("  speech #{:<3} {:>8} ms → {:>8} ms", i + 1, seg.start_ms, end),
                None => println!("  speech #{:<3} {:>8} ms → (open)", i + 1, seg.start_ms),
            }
        }
    }
    Ok(())
}
