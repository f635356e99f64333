//! Microphone capture and PCM framing.
//!
//! # Design constraints
//!
//! The device input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate on the steady path, block on a mutex, or perform
//! I/O. The callback only downmixes and pushes into an SPSC ring buffer
//! producer whose `push_slice` is lock-free; everything else happens on the
//! `parley-capture` thread (see [`pipeline`]).
//!
//! ## Lifecycle
//!
//! ```text
//! AudioCapture::new()
//!     └─► start()   → device open, capture thread spawned
//!         └─► stop() → running=false, thread joined, device released
//! ```
//!
//! `stop()` is idempotent. `start()` while capturing returns
//! `ParleyError::AlreadyCapturing`.

pub mod decode;
pub mod device;
pub mod pipeline;
pub mod playback;
pub mod resample;

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::create_audio_ring,
    error::{ParleyError, Result},
    ipc::events::AudioActivityEvent,
    vad::{VadConfig, VadEvent, VoiceActivityDetector},
};

pub use device::{ActiveStream, AudioDevice, DeviceInfo};
pub use pipeline::{DiagnosticsSnapshot, PipelineDiagnostics};

/// Wire sample rate for outbound audio (Hz).
pub const SAMPLE_RATE: u32 = 16_000;

/// Samples per outbound frame (one capture window).
pub const FRAME_SAMPLES: usize = 4096;

/// Broadcast capacity: ~65 s of frames buffered for slow subscribers.
const BROADCAST_CAP: usize = 256;

/// Convert one float sample to signed 16-bit PCM.
///
/// Clamps to [-1, 1]; negatives scale by 32768, non-negatives by 32767, and
/// the product truncates toward zero. NaN maps to 0.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// One outbound frame of mono 16 kHz PCM16.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Monotonic per capture session, starting at 0.
    pub seq: u64,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn from_f32(seq: u64, samples: &[f32]) -> Self {
        Self {
            seq,
            samples: samples.iter().copied().map(f32_to_pcm16).collect(),
        }
    }

    /// Little-endian byte layout sent on the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Microphone constraints and framing.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Output rate of frames (Hz). Default: 16000.
    pub sample_rate: u32,
    /// Output channel count. Only mono is produced. Default: 1.
    pub channels: u16,
    /// Samples per frame / VAD window. Default: 4096.
    pub frame_samples: usize,
    /// Requested from the host; cpal exposes no AEC so this is advisory.
    pub echo_cancellation: bool,
    /// Zero windows whose RMS is below `noise_gate_floor`.
    pub noise_suppression: bool,
    /// Lift quiet speech toward a working RMS band.
    pub auto_gain_control: bool,
    /// RMS below which a window counts as noise. Default: 0.002.
    pub noise_gate_floor: f32,
    /// Input device name; `None` uses the system default.
    pub preferred_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: 1,
            frame_samples: FRAME_SAMPLES,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            noise_gate_floor: 0.002,
            preferred_device: None,
        }
    }
}

/// Everything the capture thread publishes, in per-window order.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Speech(VadEvent),
    Frame(AudioFrame),
}

struct ActiveCapture {
    stream: Box<dyn ActiveStream>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

/// Microphone capture handle.
///
/// `Send + Sync`; all mutable state sits behind interior mutability so the
/// session can share it through an `Arc`.
pub struct AudioCapture {
    device: Arc<dyn AudioDevice>,
    config: CaptureConfig,
    vad_config: VadConfig,
    active: Mutex<Option<ActiveCapture>>,
    events_tx: broadcast::Sender<CaptureEvent>,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    /// Latest VAD level as `f32` bits.
    level: Arc<AtomicU32>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl AudioCapture {
    pub fn new(device: Arc<dyn AudioDevice>, config: CaptureConfig, vad_config: VadConfig) -> Self {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            device,
            config,
            vad_config,
            active: Mutex::new(None),
            events_tx,
            activity_tx,
            level: Arc::new(AtomicU32::new(0)),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        }
    }

    /// Open the microphone and spawn the capture thread.
    ///
    /// Blocks until the device is confirmed open (or fails).
    ///
    /// # Errors
    /// - `ParleyError::AlreadyCapturing` if already started.
    /// - Device errors from the backend; nothing is retained on failure.
    pub fn start(&self) -> Result<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(ParleyError::AlreadyCapturing);
        }

        let (producer, consumer) = create_audio_ring();
        let mut stream = self.device.open_input(&self.config, producer)?;
        let capture_sample_rate = stream.sample_rate();
        let resampler = match RateConverter::new(
            capture_sample_rate,
            self.config.sample_rate,
            pipeline::DRAIN_CHUNK,
        ) {
            Ok(r) => r,
            Err(e) => {
                stream.close();
                return Err(e);
            }
        };

        self.diagnostics.reset();
        let running = Arc::new(AtomicBool::new(true));
        let ctx = pipeline::PipelineContext {
            config: self.config.clone(),
            vad: VoiceActivityDetector::new(self.vad_config.clone()),
            consumer,
            running: Arc::clone(&running),
            events_tx: self.events_tx.clone(),
            activity_tx: self.activity_tx.clone(),
            level: Arc::clone(&self.level),
            capture_sample_rate,
            resampler,
            diagnostics: Arc::clone(&self.diagnostics),
        };

        let worker = match thread::Builder::new()
            .name("parley-capture".into())
            .spawn(move || pipeline::run(ctx))
        {
            Ok(handle) => handle,
            Err(e) => {
                stream.close();
                return Err(ParleyError::Io(e));
            }
        };

        *active = Some(ActiveCapture {
            stream,
            running,
            worker: Some(worker),
        });
        info!(capture_sample_rate, "capture started");
        Ok(())
    }

    /// Release the device and stop the capture thread. No-op when idle.
    pub fn stop(&self) {
        let Some(mut capture) = self.active.lock().take() else {
            return;
        };

        capture.running.store(false, Ordering::SeqCst);
        capture.stream.close();
        if let Some(worker) = capture.worker.take() {
            if worker.join().is_err() {
                warn!("capture thread panicked");
            }
        }
        self.level.store(0f32.to_bits(), Ordering::Relaxed);
        info!("capture stopped");
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Latest instantaneous level in [0, 1]; 0 while idle.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    /// Speech edges and PCM frames, in capture order.
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.activity_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
