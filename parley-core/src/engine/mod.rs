//! `VoiceSession` — wires capture, playback and transport together.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceSession::new()        → routers spawned, nothing open yet
//!     ├─► connect()          → transport Connecting → Connected
//!     ├─► start()            → microphone open, frames flow when Connected
//!     ├─► stop()             → microphone + speaker released
//!     └─► shutdown()         → routers aborted, everything closed
//! ```
//!
//! ## Routing
//!
//! | Source | Reaction |
//! |--------|----------|
//! | `SpeechStart` | `playback.interrupt()`, then `control{speech_start}` |
//! | `SpeechEnd` | `control{speech_end}` |
//! | capture frame | `send_audio` while Connected, else skipped |
//! | inbound audio | `playback.enqueue` |
//! | inbound text/control/error/function call | `SessionEvent` |
//!
//! The capture router consumes one ordered stream, so an interruption
//! triggered by a window always lands before that window's frame is sent.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        playback::{AudioPlayback, PlaybackConfig, PlaybackEvent},
        AudioCapture, AudioDevice, CaptureConfig, CaptureEvent, DiagnosticsSnapshot,
    },
    error::Result,
    ipc::events::{AudioActivityEvent, SessionEvent},
    protocol::ProtocolMessage,
    transport::{ConnectionState, Transport, TransportClient, TransportConfig, TransportEvent},
    vad::{SpeechState, VadConfig, VadEvent},
};

const BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    pub capture: CaptureConfig,
    pub vad: VadConfig,
    pub playback: PlaybackConfig,
}

#[derive(Default)]
struct SessionCounters {
    frames_forwarded: AtomicUsize,
    frames_skipped: AtomicUsize,
    interruptions: AtomicUsize,
    inbound_audio: AtomicUsize,
    playback_errors: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDiagnostics {
    pub frames_forwarded: usize,
    /// Frames captured while not connected.
    pub frames_skipped: usize,
    /// Barge-ins that actually cut off queued audio.
    pub interruptions: usize,
    pub inbound_audio: usize,
    pub playback_errors: usize,
    pub capture: DiagnosticsSnapshot,
}

/// The top-level conversation handle.
///
/// `Send + Sync`; wrap in an `Arc` to share with host tasks.
pub struct VoiceSession {
    capture: Arc<AudioCapture>,
    playback: Arc<AudioPlayback>,
    transport: Arc<TransportClient>,
    events_tx: broadcast::Sender<SessionEvent>,
    counters: Arc<SessionCounters>,
    routers: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceSession {
    /// Build a session and spawn its routers. Must be called inside a Tokio
    /// runtime. Opens nothing.
    pub fn new(
        config: SessionConfig,
        device: Arc<dyn AudioDevice>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let capture = Arc::new(AudioCapture::new(
            Arc::clone(&device),
            config.capture,
            config.vad,
        ));
        let playback = Arc::new(AudioPlayback::new(device, config.playback));
        let transport = Arc::new(TransportClient::new(config.transport, transport));
        let (events_tx, _) = broadcast::channel(BROADCAST_CAP);
        let counters = Arc::new(SessionCounters::default());

        // Subscribe before spawning so nothing published after `new()` is missed.
        let routers = vec![
            tokio::spawn(route_capture(
                capture.subscribe(),
                Arc::clone(&playback),
                Arc::clone(&transport),
                events_tx.clone(),
                Arc::clone(&counters),
            )),
            tokio::spawn(route_inbound(
                transport.subscribe_messages(),
                Arc::clone(&playback),
                events_tx.clone(),
                Arc::clone(&counters),
            )),
            tokio::spawn(route_transport_events(transport.subscribe(), events_tx.clone())),
            tokio::spawn(route_playback_events(playback.subscribe(), events_tx.clone())),
        ];

        Self {
            capture,
            playback,
            transport,
            events_tx,
            counters,
            routers: Mutex::new(routers),
        }
    }

    pub fn connect(&self) {
        self.transport.connect();
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// Start microphone capture.
    ///
    /// Blocks while the input device opens; async callers should run it on
    /// the blocking pool.
    ///
    /// # Errors
    /// Device errors and `ParleyError::AlreadyCapturing` from [`AudioCapture::start`].
    pub fn start(&self) -> Result<()> {
        self.capture.start()
    }

    /// Stop capture and playback, releasing both devices. Idempotent.
    ///
    /// Joins the capture thread.
    pub fn stop(&self) {
        self.capture.stop();
        self.playback.stop();
    }

    /// Send typed user input. Returns `false` when not connected.
    pub fn send_text(&self, text: &str) -> bool {
        self.transport
            .send(&ProtocolMessage::TextInput(text.to_string()))
    }

    /// Instantaneous microphone level in [0, 1].
    pub fn volume(&self) -> f32 {
        self.capture.volume()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_active()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.capture.subscribe_activity()
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    pub fn playback(&self) -> &AudioPlayback {
        &self.playback
    }

    pub fn diagnostics_snapshot(&self) -> SessionDiagnostics {
        let c = &self.counters;
        SessionDiagnostics {
            frames_forwarded: c.frames_forwarded.load(Ordering::Relaxed),
            frames_skipped: c.frames_skipped.load(Ordering::Relaxed),
            interruptions: c.interruptions.load(Ordering::Relaxed),
            inbound_audio: c.inbound_audio.load(Ordering::Relaxed),
            playback_errors: c.playback_errors.load(Ordering::Relaxed),
            capture: self.capture.diagnostics_snapshot(),
        }
    }

    /// Abort routers, stop devices and disconnect. Idempotent.
    ///
    /// Blocks like [`VoiceSession::stop`].
    pub fn shutdown(&self) {
        let routers = std::mem::take(&mut *self.routers.lock());
        if routers.is_empty() {
            return;
        }
        for router in routers {
            router.abort();
        }
        self.stop();
        self.transport.disconnect();
        info!("session shut down");
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn route_capture(
    mut rx: broadcast::Receiver<CaptureEvent>,
    playback: Arc<AudioPlayback>,
    transport: Arc<TransportClient>,
    events_tx: broadcast::Sender<SessionEvent>,
    counters: Arc<SessionCounters>,
) {
    loop {
        match rx.recv().await {
            Ok(CaptureEvent::Speech(VadEvent::SpeechStart)) => {
                if playback.interrupt() > 0 {
                    counters.interruptions.fetch_add(1, Ordering::Relaxed);
                }
                if transport.is_connected() {
                    transport.send(&ProtocolMessage::control("speech_start"));
                }
                let _ = events_tx.send(SessionEvent::Speech {
                    state: SpeechState::Speaking,
                });
            }
            Ok(CaptureEvent::Speech(VadEvent::SpeechEnd)) => {
                if transport.is_connected() {
                    transport.send(&ProtocolMessage::control("speech_end"));
                }
                let _ = events_tx.send(SessionEvent::Speech {
                    state: SpeechState::Silent,
                });
            }
            Ok(CaptureEvent::Frame(frame)) => {
                if transport.is_connected() && transport.send_audio(frame.to_le_bytes()) {
                    counters.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "capture router lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn route_inbound(
    mut rx: broadcast::Receiver<ProtocolMessage>,
    playback: Arc<AudioPlayback>,
    events_tx: broadcast::Sender<SessionEvent>,
    counters: Arc<SessionCounters>,
) {
    loop {
        let message = match rx.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "inbound router lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let event = match message {
            ProtocolMessage::Audio { data, mime_type } => {
                counters.inbound_audio.fetch_add(1, Ordering::Relaxed);
                // Opening the output device and resampling both block; awaiting
                // the join keeps payloads queued in arrival order.
                let player = Arc::clone(&playback);
                let queued = tokio::task::spawn_blocking(move || {
                    player.enqueue(&data, mime_type.as_deref()).map(|_| ())
                })
                .await;
                let failure = match queued {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(e) => Some(format!("playback task failed: {e}")),
                };
                if let Some(reason) = failure {
                    counters.playback_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("inbound audio dropped: {reason}");
                }
                continue;
            }
            ProtocolMessage::Text(text) => SessionEvent::TextReceived { text },
            ProtocolMessage::Control { action, params } => SessionEvent::Control { action, params },
            ProtocolMessage::Error { reason } => SessionEvent::RemoteError { reason },
            ProtocolMessage::TurnComplete => SessionEvent::TurnComplete,
            ProtocolMessage::FunctionCall {
                name,
                arguments,
                result,
            } => SessionEvent::FunctionCall {
                name,
                arguments,
                result,
            },
            other => {
                debug!(kind = other.kind(), "inbound message not routed");
                continue;
            }
        };
        let _ = events_tx.send(event);
    }
}

async fn route_transport_events(
    mut rx: broadcast::Receiver<TransportEvent>,
    events_tx: broadcast::Sender<SessionEvent>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(TransportEvent::StateChanged(state)) => SessionEvent::Connection { state },
            Ok(TransportEvent::ReconnectScheduled { attempt, delay }) => {
                SessionEvent::ReconnectScheduled {
                    attempt,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                }
            }
            Ok(TransportEvent::ReconnectExhausted { attempts }) => {
                SessionEvent::ConnectivityLost { attempts }
            }
            Ok(TransportEvent::Error(message)) => SessionEvent::TransportError { message },
            Ok(TransportEvent::DecodeFailed(reason)) => SessionEvent::TransportError {
                message: format!("decode failed: {reason}"),
            },
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "transport event router lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let _ = events_tx.send(event);
    }
}

async fn route_playback_events(
    mut rx: broadcast::Receiver<PlaybackEvent>,
    events_tx: broadcast::Sender<SessionEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(status) => {
                let _ = events_tx.send(SessionEvent::Playback { status });
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "playback event router lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
