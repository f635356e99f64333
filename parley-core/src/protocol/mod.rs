//! RTVI-style wire protocol.
//!
//! Two frame kinds travel over the socket:
//!
//! - **binary** frames carry raw audio and nothing else;
//! - **text** frames carry a JSON [`Envelope`]
//!   `{"type": .., "data": .., "timestamp": .., ...extra}`.
//!
//! [`codec`] maps between frames and [`ProtocolMessage`].

pub mod codec;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use codec::{decode, encode, handshake};

/// Sub-protocol announced by the connect handshake.
pub const RTVI_PROTOCOL: &str = "rtvi";

/// One frame as it crosses the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// JSON envelope of a text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    /// Type-specific top-level fields (`text`, `mime_type`, `function_name`, ..).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            timestamp: None,
            extra: Map::new(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// Top-level field lookup that falls back to the same key inside an
    /// object `data`.
    pub(crate) fn field(&self, key: &str) -> Option<&Value> {
        self.extra
            .get(key)
            .or_else(|| self.data.as_ref().and_then(|d| d.get(key)))
    }

    pub(crate) fn into_value(self) -> Value {
        let mut map = Map::with_capacity(self.extra.len() + 3);
        map.insert("type".into(), Value::String(self.kind));
        if let Some(data) = self.data {
            map.insert("data".into(), data);
        }
        if let Some(ts) = self.timestamp {
            map.insert("timestamp".into(), Value::from(ts));
        }
        for (key, value) in self.extra {
            map.entry(key).or_insert(value);
        }
        Value::Object(map)
    }
}

/// Decoded/encodable application messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    /// Audio bytes; `mime_type` is `None` for native binary frames.
    Audio {
        data: Vec<u8>,
        mime_type: Option<String>,
    },
    /// Assistant text.
    Text(String),
    Control {
        action: String,
        params: Map<String, Value>,
    },
    Error {
        reason: String,
    },
    TurnComplete,
    /// A tool invocation the remote service executed on the user's behalf.
    FunctionCall {
        name: String,
        arguments: Value,
        result: Option<Value>,
    },
    /// Typed user input.
    TextInput(String),
    Ping,
    Pong,
    StatusRequest,
    /// Service acknowledgements (`connection_established`, `audio_received`, ..).
    Notice {
        kind: String,
        body: Option<Value>,
    },
}

impl ProtocolMessage {
    /// Control message without parameters.
    pub fn control(action: impl Into<String>) -> Self {
        ProtocolMessage::Control {
            action: action.into(),
            params: Map::new(),
        }
    }

    /// Wire `type` discriminator.
    pub fn kind(&self) -> &str {
        match self {
            ProtocolMessage::Audio { .. } => "audio",
            ProtocolMessage::Text(_) => "text",
            ProtocolMessage::Control { .. } => "control",
            ProtocolMessage::Error { .. } => "error",
            ProtocolMessage::TurnComplete => "turn_complete",
            ProtocolMessage::FunctionCall { .. } => "function_call",
            ProtocolMessage::TextInput(_) => "text_input",
            ProtocolMessage::Ping => "ping",
            ProtocolMessage::Pong => "pong",
            ProtocolMessage::StatusRequest => "status_request",
            ProtocolMessage::Notice { kind, .. } => kind.as_str(),
        }
    }
}
