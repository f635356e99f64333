//! Event types published by a [`VoiceSession`](crate::engine::VoiceSession)
//! for UI and text-command layers.
//!
//! ## Streams
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `SessionEvent` | `VoiceSession::subscribe()` |
//! | `AudioActivityEvent` | `VoiceSession::subscribe_activity()` |
//!
//! Both serialise as camelCase JSON so a host can forward them verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    audio::playback::PlaybackEvent, transport::ConnectionState, vad::SpeechState,
};

// ---------------------------------------------------------------------------
// Session events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    /// Connection state changed.
    Connection { state: ConnectionState },
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    /// Automatic reconnection gave up; a manual connect is required.
    ConnectivityLost { attempts: u32 },
    TransportError { message: String },
    /// Local debounced speech state.
    Speech { state: SpeechState },
    Playback { status: PlaybackEvent },
    /// Assistant text.
    TextReceived { text: String },
    Control {
        action: String,
        params: Map<String, Value>,
    },
    /// Error reported by the remote service.
    RemoteError { reason: String },
    TurnComplete,
    FunctionCall {
        name: String,
        arguments: Value,
        result: Option<Value>,
    },
}

// ---------------------------------------------------------------------------
// Audio activity events
// ---------------------------------------------------------------------------

/// One per processed capture window, for level meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    /// Monotonically increasing per capture session.
    pub seq: u64,
    /// Instantaneous VAD level in [0.0, 1.0] (not debounced).
    pub level: f32,
    /// Root-mean-square of the window after gain/gate.
    pub rms: f32,
    /// Debounced speaking state after this window.
    pub is_speaking: bool,
}
