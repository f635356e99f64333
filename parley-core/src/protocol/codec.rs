use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;

use super::{Envelope, ProtocolMessage, WireFrame, RTVI_PROTOCOL};
use crate::error::DecodeError;

/// Acknowledgement types the service sends that carry no conversation content.
const NOTICE_KINDS: &[&str] = &[
    "connection_established",
    "audio_received",
    "text_received",
    "config_updated",
    "status_response",
    "rtvi_message_received",
];

fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// The message sent right after every successful open.
pub fn handshake() -> ProtocolMessage {
    let mut params = Map::new();
    params.insert("protocol".into(), Value::from(RTVI_PROTOCOL));
    ProtocolMessage::Control {
        action: "connect".into(),
        params,
    }
}

/// Encode a message for the socket. Audio always goes out as a binary frame.
pub fn encode(message: &ProtocolMessage) -> WireFrame {
    let envelope = match message {
        ProtocolMessage::Audio { data, .. } => return WireFrame::Binary(data.clone()),
        ProtocolMessage::Text(text) => Envelope::new("text").with_data(Value::from(text.as_str())),
        ProtocolMessage::Control { action, params } => {
            let mut data = params.clone();
            data.insert("action".into(), Value::from(action.as_str()));
            Envelope::new("control").with_data(Value::Object(data))
        }
        ProtocolMessage::Error { reason } => {
            Envelope::new("error").with_data(Value::from(reason.as_str()))
        }
        ProtocolMessage::TurnComplete => Envelope::new("turn_complete").with_data(Value::Bool(true)),
        ProtocolMessage::FunctionCall {
            name,
            arguments,
            result,
        } => {
            let mut env = Envelope::new("function_call")
                .with_field("function_name", Value::from(name.as_str()))
                .with_field("arguments", arguments.clone());
            if let Some(result) = result {
                env = env.with_field("result", result.clone());
            }
            env
        }
        ProtocolMessage::TextInput(text) => {
            Envelope::new("text_input").with_field("text", Value::from(text.as_str()))
        }
        ProtocolMessage::Ping => Envelope::new("ping"),
        ProtocolMessage::Pong => Envelope::new("pong"),
        ProtocolMessage::StatusRequest => Envelope::new("status_request"),
        ProtocolMessage::Notice { kind, body } => {
            let env = Envelope::new(kind.as_str());
            match body {
                Some(body) => env.with_data(body.clone()),
                None => env,
            }
        }
    };

    WireFrame::Text(envelope.with_timestamp(now_seconds()).into_value().to_string())
}

/// Decode one inbound frame.
///
/// `Ok(None)` means a well-formed envelope of a type this client ignores.
pub fn decode(frame: WireFrame) -> Result<Option<ProtocolMessage>, DecodeError> {
    let text = match frame {
        WireFrame::Binary(data) => {
            return Ok(Some(ProtocolMessage::Audio {
                data,
                mime_type: None,
            }))
        }
        WireFrame::Text(text) => text,
    };

    let value: Value = serde_json::from_str(&text)?;
    if !value.get("type").is_some_and(Value::is_string) {
        return Err(DecodeError::MissingType);
    }
    let envelope: Envelope = serde_json::from_value(value)?;

    let kind = envelope.kind.clone();
    let message = match kind.as_str() {
        "audio" => decode_audio(&envelope)?,
        "text" => ProtocolMessage::Text(
            text_field(&envelope, "text").ok_or(DecodeError::MissingPayload("text"))?,
        ),
        "control" => decode_control(envelope)?,
        "error" => ProtocolMessage::Error {
            reason: error_reason(&envelope),
        },
        "turn_complete" => ProtocolMessage::TurnComplete,
        "function_call" => ProtocolMessage::FunctionCall {
            name: envelope
                .field("function_name")
                .or_else(|| envelope.field("name"))
                .and_then(Value::as_str)
                .ok_or(DecodeError::MissingPayload("function_call"))?
                .to_string(),
            arguments: envelope.field("arguments").cloned().unwrap_or(Value::Null),
            result: envelope.field("result").cloned(),
        },
        "text_input" => ProtocolMessage::TextInput(
            text_field(&envelope, "text").ok_or(DecodeError::MissingPayload("text_input"))?,
        ),
        "ping" => ProtocolMessage::Ping,
        "pong" => ProtocolMessage::Pong,
        "status_request" => ProtocolMessage::StatusRequest,
        kind if NOTICE_KINDS.contains(&kind) => {
            let body = match envelope.data {
                Some(data) => Some(data),
                None if !envelope.extra.is_empty() => Some(Value::Object(envelope.extra)),
                None => None,
            };
            ProtocolMessage::Notice {
                kind: envelope.kind,
                body,
            }
        }
        other => {
            debug!(kind = other, "ignoring unrecognised message type");
            return Ok(None);
        }
    };

    Ok(Some(message))
}

/// `data` as a string, or `data.<key>` / top-level `<key>`.
fn text_field(envelope: &Envelope, key: &str) -> Option<String> {
    if let Some(Value::String(s)) = &envelope.data {
        return Some(s.clone());
    }
    envelope
        .field(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn decode_audio(envelope: &Envelope) -> Result<ProtocolMessage, DecodeError> {
    let encoded = match &envelope.data {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(Value::Object(obj)) => obj
            .get("data")
            .or_else(|| obj.get("audio"))
            .and_then(Value::as_str),
        _ => None,
    }
    .ok_or(DecodeError::MissingPayload("audio"))?;

    let data = STANDARD.decode(encoded.trim())?;
    let mime_type = envelope
        .field("mime_type")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ProtocolMessage::Audio { data, mime_type })
}

fn decode_control(envelope: Envelope) -> Result<ProtocolMessage, DecodeError> {
    let Some(Value::Object(mut params)) = envelope.data else {
        return Err(DecodeError::MissingPayload("control"));
    };
    let action = match params.remove("action") {
        Some(Value::String(action)) => action,
        _ => return Err(DecodeError::MissingPayload("control")),
    };
    Ok(ProtocolMessage::Control { action, params })
}

fn error_reason(envelope: &Envelope) -> String {
    match &envelope.data {
        Some(Value::String(s)) => return s.clone(),
        Some(Value::Object(obj)) => {
            if let Some(reason) = ["message", "error", "reason"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
            {
                return reason.to_string();
            }
        }
        _ => {}
    }
    ["error", "message"]
        .iter()
        .find_map(|k| envelope.extra.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| "unknown error".to_string())
}
