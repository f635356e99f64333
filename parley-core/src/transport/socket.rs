//! Socket capability used by [`TransportClient`](super::TransportClient).
//!
//! An open [`Connection`] is a pair of channels: frames to send go into
//! `outbound`, everything the socket reports comes out of `inbound`. The
//! inbound stream ends after a [`SocketEvent::Closed`]; ending without one
//! counts as an unclean close.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{error::Result, protocol::WireFrame};

/// Close code sent and expected for an intentional shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(WireFrame),
    /// Send a normal-closure close frame and shut the socket.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Frame(WireFrame),
    /// Recoverable socket error. Does not end the connection by itself.
    Error(String),
    Closed {
        /// A close frame with code 1000 was received.
        clean: bool,
        code: Option<u16>,
        reason: String,
    },
}

impl SocketEvent {
    /// Close event derived from an optional close code.
    pub fn closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        SocketEvent::Closed {
            clean: code == Some(NORMAL_CLOSURE),
            code,
            reason: reason.into(),
        }
    }
}

pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Something that can open a message socket to a URL.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// # Errors
    /// `ParleyError::Transport` when the endpoint cannot be reached or the
    /// upgrade fails.
    async fn open(&self, url: &str) -> Result<Connection>;
}
