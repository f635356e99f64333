//! # parley-core
//!
//! Live spoken-conversation client: microphone capture, voice activity
//! detection, barge-in playback and a reconnecting RTVI transport.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioDevice callback → SPSC RingBuffer → capture thread
//!                                                          │
//!                                            resample · VAD · PCM16 frame
//!                                                          │
//!                                        broadcast::Sender<CaptureEvent>
//!                                                          │
//!                    SpeechStart ─► AudioPlayback::interrupt ─┤
//!                                                          ▼
//!                                TransportClient ──► WebSocket ──► service
//!                                      ▲                            │
//!                     ProtocolCodec ◄──┴──────── inbound frames ◄───┘
//!                          │
//!                 audio → AudioPlayback · text/control → SessionEvent
//! ```
//!
//! The audio callbacks never block; all heap work happens on the capture
//! thread or Tokio tasks. Devices and sockets sit behind the
//! [`AudioDevice`] and [`Transport`] traits.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod protocol;
pub mod transport;
pub mod vad;

// Convenience re-exports for downstream crates
pub use audio::{
    playback::{AudioPlayback, PlaybackConfig, PlaybackEvent, PlaybackOutcome},
    AudioCapture, AudioDevice, AudioFrame, CaptureConfig, CaptureEvent, DeviceInfo,
};
pub use engine::{SessionConfig, SessionDiagnostics, VoiceSession};
pub use error::{DecodeError, ParleyError, Result};
pub use ipc::events::{AudioActivityEvent, SessionEvent};
pub use protocol::{ProtocolMessage, WireFrame};
pub use transport::{
    ConnectionState, Transport, TransportClient, TransportConfig, TransportEvent,
    WebSocketTransport,
};
pub use vad::{SpeechState, VadConfig, VadEvent, VoiceActivityDetector};

#[cfg(feature = "audio-cpal")]
pub use audio::device::CpalDevice;
