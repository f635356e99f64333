//! Blocking capture loop.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Poll the VAD silence deadline (SpeechEnd is time-driven, not frame-driven)
//! 2. Drain ring buffer → Vec<f32> at the device rate
//! 3. Resample to 16 kHz
//! 4. Cut into fixed 4096-sample windows; for each window:
//!    a. noise gate / adaptive input gain
//!    b. VAD analyse → broadcast CaptureEvent::Speech
//!    c. level + AudioActivityEvent
//!    d. PCM16 conversion → broadcast CaptureEvent::Frame
//! ```
//!
//! Speech events for a window are always published before that window's
//! frame, so a subscriber reacting to `SpeechStart` acts before the frame.
//!
//! The loop runs on its own OS thread, keeping the Tokio executor free for
//! the transport.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::{
    audio::{resample::RateConverter, AudioFrame, CaptureConfig, CaptureEvent},
    buffering::{AudioConsumer, Consumer, FrameAssembler},
    ipc::events::AudioActivityEvent,
    vad::{VadEvent, VoiceActivityDetector},
};

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub samples_in: AtomicUsize,
    pub windows: AtomicUsize,
    pub frames_emitted: AtomicUsize,
    pub gated_windows: AtomicUsize,
    pub speech_starts: AtomicUsize,
    pub speech_ends: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.samples_in.store(0, Ordering::Relaxed);
        self.windows.store(0, Ordering::Relaxed);
        self.frames_emitted.store(0, Ordering::Relaxed);
        self.gated_windows.store(0, Ordering::Relaxed);
        self.speech_starts.store(0, Ordering::Relaxed);
        self.speech_ends.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            windows: self.windows.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            gated_windows: self.gated_windows.load(Ordering::Relaxed),
            speech_starts: self.speech_starts.load(Ordering::Relaxed),
            speech_ends: self.speech_ends.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub samples_in: usize,
    pub windows: usize,
    pub frames_emitted: usize,
    pub gated_windows: usize,
    pub speech_starts: usize,
    pub speech_ends: usize,
}

/// All context the loop needs, passed as one struct so the thread closure stays tidy.
pub struct PipelineContext {
    pub config: CaptureConfig,
    pub vad: VoiceActivityDetector,
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    pub events_tx: broadcast::Sender<CaptureEvent>,
    pub activity_tx: broadcast::Sender<AudioActivityEvent>,
    /// Latest VAD level as `f32` bits.
    pub level: Arc<AtomicU32>,
    pub capture_sample_rate: u32,
    /// Device rate → `config.sample_rate`, built before the thread starts.
    pub resampler: RateConverter,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Samples drained from the ring per iteration (20 ms at 48 kHz).
pub(crate) const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty. Also bounds SpeechEnd latency.
const EMPTY_SLEEP: Duration = Duration::from_millis(5);

/// Adaptive gain only lifts windows already above this RMS, so room noise
/// that passes the gate is not amplified into speech.
const AUTO_GAIN_MIN_RMS: f32 = 0.01;
const AUTO_GAIN_TARGET_RMS: f32 = 0.05;
const AUTO_GAIN_MAX: f32 = 4.0;

/// Run the capture loop until `ctx.running` becomes false.
pub fn run(mut ctx: PipelineContext) {
    info!("capture pipeline started");

    if !ctx.resampler.is_passthrough() {
        info!(
            "resampling enabled from={} to={}",
            ctx.capture_sample_rate, ctx.config.sample_rate
        );
    }

    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut framer = FrameAssembler::new(ctx.config.frame_samples);
    let mut frame_seq = 0u64;
    let mut activity_seq = 0u64;

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        if let Some(event) = ctx.vad.poll(Instant::now()) {
            publish_speech(&ctx, event);
        }

        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(EMPTY_SLEEP);
            continue;
        }
        ctx.diagnostics.samples_in.fetch_add(n, Ordering::Relaxed);

        let resampled = ctx.resampler.process(&raw[..n]);
        if resampled.is_empty() {
            continue;
        }

        for mut window in framer.push(&resampled) {
            process_window(&mut ctx, &mut window, frame_seq, activity_seq);
            frame_seq = frame_seq.saturating_add(1);
            activity_seq = activity_seq.saturating_add(1);
        }
    }

    // Pending silence timers die with the capture session; no SpeechEnd
    // is emitted for them.
    ctx.vad.reset();
    ctx.level.store(0f32.to_bits(), Ordering::Relaxed);

    let snap = ctx.diagnostics.snapshot();
    info!(
        samples_in = snap.samples_in,
        windows = snap.windows,
        frames_emitted = snap.frames_emitted,
        gated_windows = snap.gated_windows,
        speech_starts = snap.speech_starts,
        speech_ends = snap.speech_ends,
        "capture pipeline stopped — diagnostics"
    );
}

fn process_window(ctx: &mut PipelineContext, window: &mut [f32], frame_seq: u64, activity_seq: u64) {
    ctx.diagnostics.windows.fetch_add(1, Ordering::Relaxed);

    let raw_rms = compute_rms(window);
    if ctx.config.noise_suppression && raw_rms < ctx.config.noise_gate_floor {
        window.fill(0.0);
        ctx.diagnostics.gated_windows.fetch_add(1, Ordering::Relaxed);
    } else if ctx.config.auto_gain_control {
        apply_adaptive_input_gain(window);
    }
    let rms = compute_rms(window);

    // A deadline that elapsed while this window was being assembled fires
    // before the new window can cancel it.
    let now = Instant::now();
    if let Some(event) = ctx.vad.poll(now) {
        publish_speech(ctx, event);
    }
    if let Some(event) = ctx.vad.process(window, now) {
        publish_speech(ctx, event);
    }

    let level = ctx.vad.level();
    ctx.level.store(level.to_bits(), Ordering::Relaxed);
    let is_speaking = ctx.vad.state().is_speaking();
    let _ = ctx.activity_tx.send(AudioActivityEvent {
        seq: activity_seq,
        level,
        rms,
        is_speaking,
    });

    if activity_seq % 50 == 0 {
        debug!(
            rms = format_args!("{:.4}", rms),
            magnitude = format_args!("{:.1}", ctx.vad.magnitude()),
            is_speaking,
            "audio level check"
        );
    }

    let frame = AudioFrame::from_f32(frame_seq, window);
    ctx.diagnostics.frames_emitted.fetch_add(1, Ordering::Relaxed);
    // No subscribers is fine: capture keeps running while nobody listens.
    let _ = ctx.events_tx.send(CaptureEvent::Frame(frame));
}

fn publish_speech(ctx: &PipelineContext, event: VadEvent) {
    match event {
        VadEvent::SpeechStart => ctx.diagnostics.speech_starts.fetch_add(1, Ordering::Relaxed),
        VadEvent::SpeechEnd => ctx.diagnostics.speech_ends.fetch_add(1, Ordering::Relaxed),
    };
    debug!(?event, "speech state changed");
    let _ = ctx.events_tx.send(CaptureEvent::Speech(event));
}

pub(crate) fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq = samples.iter().map(|s| s * s).sum::<f32>();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Lift quiet speech toward a working band, like a browser's auto gain.
fn apply_adaptive_input_gain(samples: &mut [f32]) {
    let rms = compute_rms(samples);
    if !(AUTO_GAIN_MIN_RMS..AUTO_GAIN_TARGET_RMS).contains(&rms) {
        return;
    }
    let gain = (AUTO_GAIN_TARGET_RMS / rms).clamp(1.0, AUTO_GAIN_MAX);
    if gain <= 1.03 {
        return;
    }
    for sample in samples.iter_mut() {
        *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use tokio::sync::broadcast::error::TryRecvError;

    use crate::buffering::{create_audio_ring, Producer};
    use crate::vad::VadConfig;

    fn recv_with_timeout<T: Clone>(rx: &mut broadcast::Receiver<T>, timeout: Duration) -> T {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(ev) => return ev,
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        panic!("timed out waiting for capture event");
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("capture channel closed unexpectedly"),
            }
        }
    }

    fn noise(len: usize, amplitude: f32) -> Vec<f32> {
        let mut state = 0x2545_f491u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state as f32 / u32::MAX as f32 * 2.0 - 1.0) * amplitude
            })
            .collect()
    }

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            auto_gain_control: false,
            noise_suppression: false,
            ..CaptureConfig::default()
        }
    }

    struct Harness {
        running: Arc<AtomicBool>,
        events: broadcast::Receiver<CaptureEvent>,
        activity: broadcast::Receiver<AudioActivityEvent>,
        diagnostics: Arc<PipelineDiagnostics>,
        handle: thread::JoinHandle<()>,
    }

    fn spawn(config: CaptureConfig, vad: VadConfig, capture_rate: u32, input: &[f32]) -> Harness {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(input);

        let (events_tx, events) = broadcast::channel(64);
        let (activity_tx, activity) = broadcast::channel(64);
        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let resampler = RateConverter::new(capture_rate, config.sample_rate, DRAIN_CHUNK).unwrap();

        let ctx = PipelineContext {
            config,
            vad: VoiceActivityDetector::new(vad),
            consumer,
            running: Arc::clone(&running),
            events_tx,
            activity_tx,
            level: Arc::new(AtomicU32::new(0)),
            capture_sample_rate: capture_rate,
            resampler,
            diagnostics: Arc::clone(&diagnostics),
        };
        let handle = thread::spawn(move || run(ctx));

        Harness {
            running,
            events,
            activity,
            diagnostics,
            handle,
        }
    }

    impl Harness {
        fn stop(self) -> Arc<PipelineDiagnostics> {
            self.running.store(false, Ordering::SeqCst);
            self.handle.join().expect("pipeline thread panicked");
            self.diagnostics
        }
    }

    #[test]
    fn speech_start_precedes_frame_of_same_window() {
        let mut h = spawn(test_config(), VadConfig::default(), 16_000, &noise(4096, 0.3));

        let first = recv_with_timeout(&mut h.events, Duration::from_secs(1));
        let second = recv_with_timeout(&mut h.events, Duration::from_secs(1));
        assert!(matches!(first, CaptureEvent::Speech(VadEvent::SpeechStart)));
        match second {
            CaptureEvent::Frame(frame) => {
                assert_eq!(frame.seq, 0);
                assert_eq!(frame.samples.len(), 4096);
            }
            other => panic!("expected frame, got {other:?}"),
        }

        let activity = recv_with_timeout(&mut h.activity, Duration::from_secs(1));
        assert!(activity.is_speaking);
        assert!(activity.level > 0.0);

        let diag = h.stop().snapshot();
        assert_eq!(diag.speech_starts, 1);
        assert_eq!(diag.frames_emitted, 1);
    }

    #[test]
    fn silence_emits_frames_without_speech_events() {
        let mut h = spawn(test_config(), VadConfig::default(), 16_000, &vec![0.0; 4096 * 2]);

        for expected_seq in 0..2u64 {
            match recv_with_timeout(&mut h.events, Duration::from_secs(1)) {
                CaptureEvent::Frame(frame) => {
                    assert_eq!(frame.seq, expected_seq);
                    assert!(frame.samples.iter().all(|&s| s == 0));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        let diag = h.stop().snapshot();
        assert_eq!(diag.speech_starts, 0);
        assert_eq!(diag.windows, 2);
    }

    #[test]
    fn speech_end_fires_from_poll_after_debounce() {
        let vad = VadConfig {
            debounce: Duration::from_millis(40),
            ..VadConfig::default()
        };
        let mut input = noise(4096, 0.3);
        input.extend(vec![0.0; 4096]);
        let mut h = spawn(test_config(), vad, 16_000, &input);

        let mut seen = Vec::new();
        while seen.len() < 4 {
            seen.push(recv_with_timeout(&mut h.events, Duration::from_secs(1)));
        }
        assert!(matches!(seen[0], CaptureEvent::Speech(VadEvent::SpeechStart)));
        assert!(matches!(seen[1], CaptureEvent::Frame(_)));
        assert!(matches!(seen[2], CaptureEvent::Frame(_)));
        assert!(matches!(seen[3], CaptureEvent::Speech(VadEvent::SpeechEnd)));
        assert_eq!(h.stop().snapshot().speech_ends, 1);
    }

    #[test]
    fn stop_discards_pending_silence_without_speech_end() {
        let vad = VadConfig {
            debounce: Duration::from_secs(30),
            ..VadConfig::default()
        };
        let mut input = noise(4096, 0.3);
        input.extend(vec![0.0; 4096]);
        let mut h = spawn(test_config(), vad, 16_000, &input);

        for _ in 0..3 {
            recv_with_timeout(&mut h.events, Duration::from_secs(1));
        }
        let diag = h.stop().snapshot();
        assert_eq!(diag.speech_starts, 1);
        assert_eq!(diag.speech_ends, 0);
    }

    #[test]
    fn noise_gate_zeroes_faint_windows() {
        let config = CaptureConfig {
            noise_suppression: true,
            ..test_config()
        };
        let mut h = spawn(config, VadConfig::default(), 16_000, &noise(4096, 0.001));

        match recv_with_timeout(&mut h.events, Duration::from_secs(1)) {
            CaptureEvent::Frame(frame) => assert!(frame.samples.iter().all(|&s| s == 0)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.stop().snapshot().gated_windows, 1);
    }

    #[test]
    fn device_rate_is_resampled_to_wire_rate() {
        // 7 × 4096 samples at 48 kHz → a little over two 16 kHz frames.
        let mut h = spawn(test_config(), VadConfig::default(), 48_000, &vec![0.0; 4096 * 7]);

        for _ in 0..2 {
            match recv_with_timeout(&mut h.events, Duration::from_secs(2)) {
                CaptureEvent::Frame(frame) => assert_eq!(frame.samples.len(), 4096),
                other => panic!("unexpected {other:?}"),
            }
        }
        let diag = h.stop().snapshot();
        assert!(diag.samples_in >= 4096 * 6);
    }

    #[test]
    fn adaptive_gain_lifts_quiet_speech_only() {
        let mut quiet = vec![0.02f32; 64];
        apply_adaptive_input_gain(&mut quiet);
        assert!((compute_rms(&quiet) - AUTO_GAIN_TARGET_RMS).abs() < 1e-3);

        let mut hiss = vec![0.004f32; 64];
        apply_adaptive_input_gain(&mut hiss);
        assert_eq!(hiss[0], 0.004);

        let mut loud = vec![0.2f32; 64];
        apply_adaptive_input_gain(&mut loud);
        assert_eq!(loud[0], 0.2);
    }
}
