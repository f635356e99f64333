//! Speaker playback with immediate interruption (barge-in).
//!
//! Decoded payloads are appended to one shared [`PlaybackQueue`]; the output
//! device callback drains it through [`PlaybackQueue::fill`]. Each payload
//! carries a completion notifier that resolves once its last sample has been
//! handed to the device, or as `Interrupted`/`Stopped` when the queue is
//! cleared first.
//!
//! `interrupt()` keeps the output stream open so the next reply starts without
//! a device reopen; `stop()` releases it.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

use crate::{
    audio::{decode::decode_payload, device::ActiveStream, resample::RateConverter, AudioDevice},
    error::Result,
};

const BROADCAST_CAP: usize = 64;

/// Input block size for per-payload rate conversion.
const RESAMPLE_CHUNK: usize = 1024;

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Rate assumed for raw PCM payloads without a `rate=` parameter.
    /// Default: 24000 (the remote service's output rate).
    pub default_sample_rate: u32,
    /// Output device name; `None` uses the system default.
    pub preferred_device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_sample_rate: 24_000,
            preferred_device: None,
        }
    }
}

/// How a payload's playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackOutcome {
    Completed,
    Interrupted,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackEvent {
    /// Queue went from empty to non-empty.
    Started,
    /// Queue drained naturally.
    Finished,
    Interrupted,
    Stopped,
}

impl From<PlaybackOutcome> for PlaybackEvent {
    fn from(outcome: PlaybackOutcome) -> Self {
        match outcome {
            PlaybackOutcome::Completed => PlaybackEvent::Finished,
            PlaybackOutcome::Interrupted => PlaybackEvent::Interrupted,
            PlaybackOutcome::Stopped => PlaybackEvent::Stopped,
        }
    }
}

#[derive(Default)]
struct QueueState {
    samples: VecDeque<f32>,
    /// (cumulative end position, notifier) per payload, in queue order.
    pending: VecDeque<(u64, oneshot::Sender<PlaybackOutcome>)>,
    enqueued: u64,
    emitted: u64,
    active: bool,
}

/// The single active playback session: queued samples plus completion
/// notifiers. Shared between [`AudioPlayback`] and the output callback.
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    events_tx: broadcast::Sender<PlaybackEvent>,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackQueue {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            state: Mutex::new(QueueState::default()),
            events_tx,
        }
    }

    /// Append samples (already at the device rate).
    pub fn push(&self, samples: Vec<f32>) -> oneshot::Receiver<PlaybackOutcome> {
        let (tx, rx) = oneshot::channel();
        if samples.is_empty() {
            let _ = tx.send(PlaybackOutcome::Completed);
            return rx;
        }

        let mut state = self.state.lock();
        state.enqueued += samples.len() as u64;
        let end = state.enqueued;
        state.pending.push_back((end, tx));
        state.samples.extend(samples);
        if !state.active {
            state.active = true;
            let _ = self.events_tx.send(PlaybackEvent::Started);
        }
        rx
    }

    /// Fill `out` with the next mono samples, zero-padding when the queue
    /// runs dry. Called from the output device callback.
    pub fn fill(&self, out: &mut [f32]) {
        let mut state = self.state.lock();
        let n = out.len().min(state.samples.len());
        for (slot, sample) in out.iter_mut().zip(state.samples.drain(..n)) {
            *slot = sample;
        }
        out[n..].fill(0.0);
        state.emitted += n as u64;

        while state
            .pending
            .front()
            .is_some_and(|(end, _)| *end <= state.emitted)
        {
            if let Some((_, tx)) = state.pending.pop_front() {
                let _ = tx.send(PlaybackOutcome::Completed);
            }
        }

        if state.active && state.samples.is_empty() {
            state.active = false;
            let _ = self.events_tx.send(PlaybackEvent::Finished);
        }
    }

    /// Drop everything queued and resolve pending payloads with `outcome`.
    /// Returns the number of discarded samples.
    pub fn clear(&self, outcome: PlaybackOutcome) -> usize {
        let mut state = self.state.lock();
        let discarded = state.samples.len();
        state.samples.clear();
        state.emitted = state.enqueued;
        for (_, tx) in state.pending.drain(..) {
            let _ = tx.send(outcome);
        }
        if std::mem::take(&mut state.active) {
            let _ = self.events_tx.send(outcome.into());
        }
        discarded
    }

    pub fn queued_samples(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events_tx.subscribe()
    }
}

/// Resolves when one enqueued payload finishes.
#[derive(Debug)]
pub struct PlaybackHandle {
    done: oneshot::Receiver<PlaybackOutcome>,
}

impl PlaybackHandle {
    pub async fn finished(self) -> PlaybackOutcome {
        // A dropped notifier means the queue itself went away.
        self.done.await.unwrap_or(PlaybackOutcome::Stopped)
    }
}

struct OpenOutput {
    stream: Box<dyn ActiveStream>,
    sample_rate: u32,
}

pub struct AudioPlayback {
    device: Arc<dyn AudioDevice>,
    config: PlaybackConfig,
    queue: Arc<PlaybackQueue>,
    output: Mutex<Option<OpenOutput>>,
}

impl AudioPlayback {
    pub fn new(device: Arc<dyn AudioDevice>, config: PlaybackConfig) -> Self {
        Self {
            device,
            config,
            queue: Arc::new(PlaybackQueue::new()),
            output: Mutex::new(None),
        }
    }

    /// Decode a payload and queue it behind anything already playing.
    ///
    /// Opens the output device on first use (or after `stop()`).
    ///
    /// # Errors
    /// `ParleyError::Decode` for undecodable payloads; device errors when the
    /// output cannot be opened.
    pub fn enqueue(&self, bytes: &[u8], mime: Option<&str>) -> Result<PlaybackHandle> {
        let decoded = decode_payload(bytes, mime, self.config.default_sample_rate)?;
        let device_rate = self.ensure_output()?;

        let samples = if decoded.sample_rate == device_rate {
            decoded.samples
        } else {
            RateConverter::new(decoded.sample_rate, device_rate, RESAMPLE_CHUNK)?
                .convert(&decoded.samples)
        };

        debug!(
            bytes = bytes.len(),
            samples = samples.len(),
            payload_rate = decoded.sample_rate,
            device_rate,
            "audio payload queued"
        );
        Ok(PlaybackHandle {
            done: self.queue.push(samples),
        })
    }

    /// Decode and play a payload, resolving when it ends.
    ///
    /// Decoding and opening the device happen before the first await.
    pub async fn play(&self, bytes: &[u8], mime: Option<&str>) -> Result<PlaybackOutcome> {
        let handle = self.enqueue(bytes, mime)?;
        Ok(handle.finished().await)
    }

    /// Barge-in: silence output now and drop the queue. The device stays open.
    pub fn interrupt(&self) -> usize {
        let discarded = self.queue.clear(PlaybackOutcome::Interrupted);
        if discarded > 0 {
            info!(discarded, "playback interrupted");
        }
        discarded
    }

    /// Drop the queue and release the output device. Idempotent.
    pub fn stop(&self) {
        self.queue.clear(PlaybackOutcome::Stopped);
        if let Some(mut output) = self.output.lock().take() {
            output.stream.close();
            info!("playback stopped");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.queue.is_active()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.queue.subscribe()
    }

    fn ensure_output(&self) -> Result<u32> {
        let mut output = self.output.lock();
        if let Some(open) = output.as_ref() {
            return Ok(open.sample_rate);
        }
        let stream = self
            .device
            .open_output(&self.config, Arc::clone(&self.queue))?;
        let sample_rate = stream.sample_rate();
        info!(sample_rate, "output device opened");
        *output = Some(OpenOutput {
            stream,
            sample_rate,
        });
        Ok(sample_rate)
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}
