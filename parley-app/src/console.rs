//! Terminal rendering of session events.

use parley_core::{ConnectionState, PlaybackEvent, SessionEvent, SpeechState};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

/// One printable line per event, or `None` for events not worth showing.
pub fn render(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::Connection { state } => match state {
            ConnectionState::Connecting => "· connecting…".to_string(),
            ConnectionState::Connected => "· connected".to_string(),
            ConnectionState::Disconnected => "· disconnected".to_string(),
        },
        SessionEvent::ReconnectScheduled { attempt, delay_ms } => {
            format!("· reconnecting in {delay_ms} ms (attempt {attempt})")
        }
        SessionEvent::ConnectivityLost { attempts } => {
            format!("! connection lost after {attempts} attempts")
        }
        SessionEvent::TransportError { message } => format!("! {message}"),
        SessionEvent::Speech { state } => match state {
            SpeechState::Speaking => "you: (speaking)".to_string(),
            SpeechState::Silent => return None,
        },
        SessionEvent::Playback { status } => match status {
            PlaybackEvent::Interrupted => "assistant: (interrupted)".to_string(),
            _ => return None,
        },
        SessionEvent::TextReceived { text } => format!("assistant: {text}"),
        SessionEvent::Control { action, .. } => format!("· control {action}"),
        SessionEvent::RemoteError { reason } => format!("! service error: {reason}"),
        SessionEvent::TurnComplete => "· turn complete".to_string(),
        SessionEvent::FunctionCall {
            name,
            arguments,
            result,
        } => match result {
            Some(result) => format!("ƒ {name}({arguments}) = {result}"),
            None => format!("ƒ {name}({arguments})"),
        },
    };
    Some(line)
}

/// Print events until the channel closes.
pub async fn print_events(mut rx: broadcast::Receiver<SessionEvent>, mode: OutputMode) {
    loop {
        match rx.recv().await {
            Ok(event) => match mode {
                OutputMode::Json => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("event not serialisable: {e}"),
                },
                OutputMode::Human => {
                    if let Some(line) = render(&event) {
                        println!("{line}");
                    }
                }
            },
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "console lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
