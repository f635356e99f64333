//! Shared test utilities: in-memory audio device and socket transport.

#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{
    audio::{
        device::ActiveStream,
        playback::{PlaybackConfig, PlaybackQueue},
    },
    buffering::{AudioProducer, Producer},
    transport::{Connection, Outbound, SocketEvent},
    AudioDevice, CaptureConfig, ParleyError, Result, Transport, WireFrame,
};
use serde_json::Value;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Audio device
// ---------------------------------------------------------------------------

struct FakeStream {
    rate: u32,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

impl ActiveStream for FakeStream {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn channels(&self) -> u16 {
        1
    }

    fn close(&mut self) {
        if !std::mem::replace(&mut self.closed, true) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Audio device driven by the test: push microphone samples in, pull
/// speaker samples out.
pub struct FakeDevice {
    pub input_rate: u32,
    pub output_rate: u32,
    pub deny_input: AtomicBool,
    pub input_opens: AtomicUsize,
    pub input_closes: Arc<AtomicUsize>,
    pub output_opens: AtomicUsize,
    pub output_closes: Arc<AtomicUsize>,
    /// Time `open_output` spends blocked, like a slow audio backend.
    pub open_output_delay: Mutex<Duration>,
    producer: Mutex<Option<AudioProducer>>,
    output: Mutex<Option<Arc<PlaybackQueue>>>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Self::with_rates(16_000, 24_000)
    }

    pub fn with_rates(input_rate: u32, output_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            input_rate,
            output_rate,
            deny_input: AtomicBool::new(false),
            input_opens: AtomicUsize::new(0),
            input_closes: Arc::new(AtomicUsize::new(0)),
            output_opens: AtomicUsize::new(0),
            output_closes: Arc::new(AtomicUsize::new(0)),
            open_output_delay: Mutex::new(Duration::ZERO),
            producer: Mutex::new(None),
            output: Mutex::new(None),
        })
    }

    /// Feed microphone samples as if from the device callback.
    pub fn push_input(&self, samples: &[f32]) {
        let mut guard = self.producer.lock();
        let producer = guard.as_mut().expect("input stream not open");
        assert_eq!(producer.push_slice(samples), samples.len(), "ring full");
    }

    /// Run the speaker callback for `n` samples.
    pub fn pull(&self, n: usize) -> Vec<f32> {
        let mut out = vec![0.0; n];
        if let Some(queue) = self.output.lock().as_ref() {
            queue.fill(&mut out);
        }
        out
    }
}

impl AudioDevice for FakeDevice {
    fn open_input(
        &self,
        _config: &CaptureConfig,
        producer: AudioProducer,
    ) -> Result<Box<dyn ActiveStream>> {
        if self.deny_input.load(Ordering::SeqCst) {
            return Err(ParleyError::Device("permission denied".into()));
        }
        *self.producer.lock() = Some(producer);
        self.input_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            rate: self.input_rate,
            closes: Arc::clone(&self.input_closes),
            closed: false,
        }))
    }

    fn open_output(
        &self,
        _config: &PlaybackConfig,
        source: Arc<PlaybackQueue>,
    ) -> Result<Box<dyn ActiveStream>> {
        let delay = *self.open_output_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        *self.output.lock() = Some(source);
        self.output_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            rate: self.output_rate,
            closes: Arc::clone(&self.output_closes),
            closed: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The service side of one fake socket.
pub struct ServerEnd {
    pub to_client: mpsc::UnboundedSender<SocketEvent>,
    pub from_client: mpsc::UnboundedReceiver<Outbound>,
}

impl ServerEnd {
    /// Next thing the client wrote, or `None` after `timeout`.
    pub async fn next(&mut self, timeout: Duration) -> Option<Outbound> {
        tokio::time::timeout(timeout, self.from_client.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next outbound frame parsed as JSON; panics on binary or timeout.
    pub async fn next_json(&mut self) -> Value {
        match self.next(Duration::from_secs(5)).await {
            Some(Outbound::Frame(WireFrame::Text(text))) => {
                serde_json::from_str(&text).expect("client sent invalid JSON")
            }
            other => panic!("expected JSON frame, got {other:?}"),
        }
    }

    pub async fn expect_handshake(&mut self) {
        let v = self.next_json().await;
        assert_eq!(v["type"], "control");
        assert_eq!(v["data"]["action"], "connect");
        assert_eq!(v["data"]["protocol"], "rtvi");
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(value.to_string());
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self
            .to_client
            .send(SocketEvent::Frame(WireFrame::Text(text.into())));
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.to_client.send(SocketEvent::Frame(WireFrame::Binary(bytes)));
    }

    pub fn error(&self, message: &str) {
        let _ = self.to_client.send(SocketEvent::Error(message.into()));
    }

    /// Close from the server side; code 1000 is a clean close.
    pub fn close(&self, code: Option<u16>) {
        let _ = self.to_client.send(SocketEvent::closed(code, "server close"));
    }
}

/// Transport whose sockets are in-memory channel pairs.
pub struct FakeTransport {
    pub opens: AtomicUsize,
    pub open_times: Mutex<Vec<tokio::time::Instant>>,
    pub refuse: AtomicBool,
    pub open_delay: Mutex<Duration>,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            opens: AtomicUsize::new(0),
            open_times: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
            open_delay: Mutex::new(Duration::ZERO),
            servers,
        });
        (transport, rx)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, _url: &str) -> Result<Connection> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_times.lock().push(tokio::time::Instant::now());

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ParleyError::Transport("connection refused".into()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerEnd {
            to_client: in_tx,
            from_client: out_rx,
        });
        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(30), servers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("transport dropped")
}

/// Poll `cond` until it holds or `timeout` (wall clock) passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Deterministic white noise in [-amplitude, amplitude].
pub fn noise(len: usize, amplitude: f32) -> Vec<f32> {
    let mut state = 0x9e37_79b9u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state as f32 / u32::MAX as f32 * 2.0 - 1.0) * amplitude
        })
        .collect()
}

pub fn pcm16_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
