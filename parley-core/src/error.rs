use thiserror::Error;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("capture is already running")]
    AlreadyCapturing,

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures turning wire frames or audio payloads into usable data.
///
/// Always non-fatal: the offending message is dropped and the connection
/// stays open.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON envelope: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("envelope has no string `type` field")]
    MissingType,

    #[error("invalid base64 audio payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("`{0}` message carries no payload")]
    MissingPayload(&'static str),

    #[error("unsupported audio payload: {0}")]
    UnsupportedAudio(String),

    #[error("WAV payload error: {0}")]
    Wav(#[from] hound::Error),
}

pub type Result<T> = std::result::Result<T, ParleyError>;
