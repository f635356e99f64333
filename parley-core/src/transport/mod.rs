//! `TransportClient` — one logical connection to the conversation service.
//!
//! ## State machine
//!
//! ```text
//!              connect()                 open ok
//! Disconnected ─────────► Connecting ─────────────► Connected
//!      ▲                      │                         │
//!      │      open failed /   │         socket closed   │
//!      └──────── timeout ─────┴─────────────────────────┘
//!                  │
//!                  └─► unclean and attempts < max: attempts += 1,
//!                      reconnect after base · 2^(attempts-1)
//! ```
//!
//! Every transition happens under the `link` mutex and every event is
//! broadcast while it is held, so subscribers observe transitions in order.
//! The mutex is never held across an `.await`.
//!
//! Each connection attempt carries a generation number. Tasks belonging to
//! an older generation (a cancelled connect, a reader racing `disconnect()`)
//! find the number changed and leave the state alone.

pub mod socket;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::protocol::{self, ProtocolMessage, WireFrame};

pub use socket::{Connection, Outbound, SocketEvent, Transport, NORMAL_CLOSURE};
pub use websocket::WebSocketTransport;

const BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Default: `ws://localhost:5050/ws`.
    pub url: String,
    /// Default: 5.
    pub max_reconnect_attempts: u32,
    /// Delay before the first retry; doubles per attempt. Default: 1 s.
    pub reconnect_base_delay: Duration,
    /// Upper bound on one open attempt. Default: 10 s.
    pub connect_timeout: Duration,
    /// Application-level `ping` interval while connected. `None` disables.
    /// Default: 20 s.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5050/ws".into(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Some(Duration::from_secs(20)),
        }
    }
}

/// Backoff before retry number `attempt` (1-based): `base · 2^(attempt-1)`.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Automatic reconnection gave up; only a manual `connect()` retries.
    ReconnectExhausted { attempts: u32 },
    /// Recoverable error; never triggers a reconnect by itself.
    Error(String),
    /// An inbound frame could not be decoded and was dropped.
    DecodeFailed(String),
}

struct Link {
    state: ConnectionState,
    attempts: u32,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    io_task: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

struct Inner {
    config: TransportConfig,
    transport: Arc<dyn Transport>,
    link: Mutex<Link>,
    events_tx: broadcast::Sender<TransportEvent>,
    messages_tx: broadcast::Sender<ProtocolMessage>,
}

/// Reconnecting protocol client.
///
/// Operations must be called from within a Tokio runtime; they never block.
pub struct TransportClient {
    inner: Arc<Inner>,
}

impl TransportClient {
    pub fn new(config: TransportConfig, transport: Arc<dyn Transport>) -> Self {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (messages_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    attempts: 0,
                    generation: 0,
                    outbound: None,
                    io_task: None,
                    reconnect: None,
                    heartbeat: None,
                }),
                events_tx,
                messages_tx,
            }),
        }
    }

    /// Open the connection. No-op while connecting or connected.
    ///
    /// A manual connect cancels any pending reconnect and resets the attempt
    /// counter, including after `ReconnectExhausted`.
    pub fn connect(&self) {
        let mut link = self.inner.link.lock();
        if link.state != ConnectionState::Disconnected {
            debug!(state = ?link.state, "connect ignored");
            return;
        }
        if let Some(timer) = link.reconnect.take() {
            timer.abort();
        }
        link.attempts = 0;
        Inner::begin_connect(&self.inner, &mut link);
    }

    /// Close cleanly and suppress automatic reconnection. Idempotent.
    pub fn disconnect(&self) {
        let mut link = self.inner.link.lock();
        if let Some(timer) = link.reconnect.take() {
            timer.abort();
        }
        if let Some(heartbeat) = link.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(outbound) = link.outbound.take() {
            let _ = outbound.send(Outbound::Close);
        }
        if let Some(io) = link.io_task.take() {
            io.abort();
        }
        link.generation += 1;
        link.attempts = 0;
        if link.state != ConnectionState::Disconnected {
            info!("disconnect requested");
        }
        self.inner.set_state(&mut link, ConnectionState::Disconnected);
    }

    /// Encode and send a message. Returns `false` (and logs) when not connected.
    pub fn send(&self, message: &ProtocolMessage) -> bool {
        self.inner.send_frame(protocol::encode(message), message.kind())
    }

    /// Send raw PCM as a binary frame. Returns `false` when not connected.
    pub fn send_audio(&self, bytes: Vec<u8>) -> bool {
        self.inner.send_frame(WireFrame::Binary(bytes), "audio")
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Consecutive failed automatic attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.inner.link.lock().attempts
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Decoded inbound messages.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<ProtocolMessage> {
        self.inner.messages_tx.subscribe()
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&self, link: &mut Link, state: ConnectionState) {
        if link.state == state {
            return;
        }
        debug!(from = ?link.state, to = ?state, "connection state");
        link.state = state;
        self.emit(TransportEvent::StateChanged(state));
    }

    fn begin_connect(this: &Arc<Self>, link: &mut Link) {
        link.generation += 1;
        let generation = link.generation;
        if let Some(stale) = link.io_task.take() {
            stale.abort();
        }
        this.set_state(link, ConnectionState::Connecting);
        info!(url = this.config.url.as_str(), generation, "connecting");

        let me = Arc::clone(this);
        link.io_task = Some(tokio::spawn(me.run_connection(generation)));
    }

    async fn run_connection(self: Arc<Self>, generation: u64) {
        let opened =
            tokio::time::timeout(self.config.connect_timeout, self.transport.open(&self.config.url))
                .await;

        let mut conn = match opened {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("connect failed: {e}");
                self.report_error(generation, e.to_string());
                self.on_close(generation, false);
                return;
            }
            Err(_) => {
                warn!(timeout = ?self.config.connect_timeout, "connect timed out");
                self.report_error(generation, "connect timed out".into());
                self.on_close(generation, false);
                return;
            }
        };

        if !self.on_open(generation, &conn.outbound) {
            return;
        }

        while let Some(event) = conn.inbound.recv().await {
            match event {
                SocketEvent::Frame(frame) => self.dispatch(frame),
                SocketEvent::Error(message) => {
                    warn!("socket error: {message}");
                    self.report_error(generation, message);
                }
                SocketEvent::Closed {
                    clean,
                    code,
                    reason,
                } => {
                    info!(clean, ?code, reason = reason.as_str(), "socket closed");
                    self.on_close(generation, clean);
                    return;
                }
            }
        }
        self.on_close(generation, false);
    }

    fn on_open(&self, generation: u64, outbound: &mpsc::UnboundedSender<Outbound>) -> bool {
        let mut link = self.link.lock();
        if link.generation != generation || link.state != ConnectionState::Connecting {
            debug!(generation, "stale open discarded");
            return false;
        }

        link.attempts = 0;
        link.outbound = Some(outbound.clone());
        self.set_state(&mut link, ConnectionState::Connected);
        info!(url = self.config.url.as_str(), "connected");

        let _ = outbound.send(Outbound::Frame(protocol::encode(&protocol::handshake())));

        if let Some(interval) = self.config.heartbeat_interval {
            let outbound = outbound.clone();
            link.heartbeat = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let ping = protocol::encode(&ProtocolMessage::Ping);
                    if outbound.send(Outbound::Frame(ping)).is_err() {
                        break;
                    }
                }
            }));
        }
        true
    }

    fn on_close(self: &Arc<Self>, generation: u64, clean: bool) {
        let mut link = self.link.lock();
        if link.generation != generation {
            return;
        }

        link.outbound = None;
        link.io_task = None;
        if let Some(heartbeat) = link.heartbeat.take() {
            heartbeat.abort();
        }
        self.set_state(&mut link, ConnectionState::Disconnected);

        if clean {
            info!("connection closed cleanly, not reconnecting");
            return;
        }

        let max = self.config.max_reconnect_attempts;
        if link.attempts >= max {
            warn!(attempts = link.attempts, "reconnect attempts exhausted");
            self.emit(TransportEvent::ReconnectExhausted {
                attempts: link.attempts,
            });
            return;
        }

        link.attempts += 1;
        let attempt = link.attempts;
        let delay = reconnect_delay(self.config.reconnect_base_delay, attempt);
        info!(attempt, max, ?delay, "reconnect scheduled");
        self.emit(TransportEvent::ReconnectScheduled { attempt, delay });

        let me = Arc::clone(self);
        link.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            me.fire_reconnect(generation);
        }));
    }

    fn fire_reconnect(self: &Arc<Self>, ticket: u64) {
        let mut link = self.link.lock();
        if link.generation != ticket || link.state != ConnectionState::Disconnected {
            return;
        }
        link.reconnect = None;
        Self::begin_connect(self, &mut link);
    }

    fn report_error(&self, generation: u64, message: String) {
        let link = self.link.lock();
        if link.generation == generation {
            self.emit(TransportEvent::Error(message));
        }
    }

    fn dispatch(&self, frame: WireFrame) {
        match protocol::decode(frame) {
            Ok(Some(message)) => {
                if message == ProtocolMessage::Ping {
                    self.send_frame(protocol::encode(&ProtocolMessage::Pong), "pong");
                }
                let _ = self.messages_tx.send(message);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("dropping undecodable frame: {e}");
                self.emit(TransportEvent::DecodeFailed(e.to_string()));
            }
        }
    }

    fn send_frame(&self, frame: WireFrame, kind: &str) -> bool {
        let link = self.link.lock();
        match (&link.state, &link.outbound) {
            (ConnectionState::Connected, Some(outbound)) => {
                outbound.send(Outbound::Frame(frame)).is_ok()
            }
            _ => {
                warn!(kind, state = ?link.state, "not connected, message dropped");
                false
            }
        }
    }
}
