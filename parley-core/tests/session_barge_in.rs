//! End-to-end session routing over a fake device and socket.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{next_server, noise, pcm16_bytes, wait_until, FakeDevice, FakeTransport, ServerEnd};
use parley_core::{
    transport::Outbound, AudioDevice, CaptureConfig, ConnectionState, ParleyError,
    PlaybackEvent, SessionConfig, SessionEvent, SpeechState, Transport, TransportConfig,
    VoiceSession, WireFrame,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(3);

struct Rig {
    session: VoiceSession,
    device: Arc<FakeDevice>,
    transport: Arc<FakeTransport>,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
    events: broadcast::Receiver<SessionEvent>,
}

fn rig() -> Rig {
    rig_with(FakeDevice::new())
}

fn rig_with(device: Arc<FakeDevice>) -> Rig {
    let (transport, servers) = FakeTransport::new();
    let config = SessionConfig {
        transport: TransportConfig {
            heartbeat_interval: None,
            ..TransportConfig::default()
        },
        capture: CaptureConfig {
            auto_gain_control: false,
            noise_suppression: false,
            ..CaptureConfig::default()
        },
        ..SessionConfig::default()
    };
    let session = VoiceSession::new(
        config,
        Arc::clone(&device) as Arc<dyn AudioDevice>,
        Arc::clone(&transport) as Arc<dyn Transport>,
    );
    let events = session.subscribe();
    Rig {
        session,
        device,
        transport,
        servers,
        events,
    }
}

async fn connected(rig: &mut Rig) -> ServerEnd {
    rig.session.connect();
    let mut server = next_server(&mut rig.servers).await;
    server.expect_handshake().await;
    assert!(
        wait_until(WAIT, || rig.session.connection_state() == ConnectionState::Connected).await
    );
    server
}

/// Drain session events until `pred` matches one, returning everything seen.
async fn events_until(
    rx: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("session event not observed")
            .expect("session event channel closed");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_speech_start_interrupts_before_frame_is_sent() {
    let mut rig = rig();
    let mut server = connected(&mut rig).await;
    rig.session.start().unwrap();

    // Two seconds of assistant audio at the device rate.
    server.send_binary(pcm16_bytes(&vec![8000i16; 48_000]));
    assert!(wait_until(WAIT, || rig.session.playback().is_playing()).await);
    let playing = rig.device.pull(480);
    assert!(playing.iter().all(|&s| (s - 8000.0 / 32768.0).abs() < 1e-6));

    rig.device.push_input(&noise(4096, 0.3));

    let control = server.next_json().await;
    assert_eq!(control["type"], "control");
    assert_eq!(control["data"]["action"], "speech_start");

    match server.next(WAIT).await {
        Some(Outbound::Frame(WireFrame::Binary(bytes))) => {
            assert_eq!(bytes.len(), 4096 * 2);
            // By the time the frame is on the wire, playback is already cut.
            assert!(!rig.session.playback().is_playing());
            assert!(rig.device.pull(480).iter().all(|&s| s == 0.0));
        }
        other => panic!("expected binary frame, got {other:?}"),
    }

    // Speech and playback events come from separate routers; order between
    // them is not fixed.
    let interrupted = SessionEvent::Playback {
        status: PlaybackEvent::Interrupted,
    };
    let mut seen = events_until(&mut rig.events, |e| {
        matches!(
            e,
            SessionEvent::Speech {
                state: SpeechState::Speaking
            }
        )
    })
    .await;
    if !seen.contains(&interrupted) {
        seen = events_until(&mut rig.events, |e| *e == interrupted).await;
    }
    assert!(seen.contains(&interrupted));

    assert!(wait_until(WAIT, || rig.session.diagnostics_snapshot().frames_forwarded == 1).await);
    assert_eq!(rig.session.diagnostics_snapshot().interruptions, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_speech_without_playback_counts_no_interruption() {
    let mut rig = rig();
    let mut server = connected(&mut rig).await;
    rig.session.start().unwrap();

    rig.device.push_input(&noise(4096, 0.3));
    let control = server.next_json().await;
    assert_eq!(control["data"]["action"], "speech_start");
    assert!(wait_until(WAIT, || rig.session.diagnostics_snapshot().frames_forwarded == 1).await);
    assert_eq!(rig.session.diagnostics_snapshot().interruptions, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_are_skipped_while_disconnected() {
    let rig = rig();
    rig.session.start().unwrap();
    assert!(rig.session.is_capturing());

    rig.device.push_input(&vec![0.0; 4096 * 2]);
    assert!(wait_until(WAIT, || rig.session.diagnostics_snapshot().frames_skipped == 2).await);

    let diag = rig.session.diagnostics_snapshot();
    assert_eq!(diag.frames_forwarded, 0);
    assert_eq!(diag.capture.frames_emitted, 2);
    assert_eq!(rig.transport.opens(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_and_base64_audio_play_identically() {
    let mut rig = rig();
    let server = connected(&mut rig).await;
    let pcm: Vec<i16> = vec![1000, -2000, 3000, -4000, i16::MAX, i16::MIN];
    let bytes = pcm16_bytes(&pcm);
    let expected: Vec<f32> = pcm.iter().map(|&s| f32::from(s) / 32768.0).collect();

    server.send_binary(bytes.clone());
    assert!(wait_until(WAIT, || rig.session.playback().is_playing()).await);
    let from_binary = rig.device.pull(pcm.len());
    assert!(!rig.session.playback().is_playing());

    server.send_json(json!({
        "type": "audio",
        "data": STANDARD.encode(&bytes),
        "mime_type": "audio/pcm;rate=24000",
    }));
    assert!(wait_until(WAIT, || rig.session.playback().is_playing()).await);
    let from_base64 = rig.device.pull(pcm.len());

    assert_eq!(from_binary, expected);
    assert_eq!(from_base64, expected);
    assert_eq!(rig.session.diagnostics_snapshot().inbound_audio, 2);
    assert_eq!(rig.device.output_opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_audio_payload_is_counted_and_dropped() {
    let mut rig = rig();
    let server = connected(&mut rig).await;

    // Odd byte count cannot be PCM16.
    server.send_binary(vec![1, 2, 3]);
    assert!(wait_until(WAIT, || rig.session.diagnostics_snapshot().playback_errors == 1).await);
    assert!(!rig.session.playback().is_playing());
    assert_eq!(rig.session.connection_state(), ConnectionState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inbound_messages_surface_as_session_events() {
    let mut rig = rig();
    let server = connected(&mut rig).await;

    server.send_json(json!({ "type": "text", "data": "hello there" }));
    server.send_json(json!({
        "type": "function_call",
        "function_name": "get_weather",
        "arguments": { "city": "Oslo" },
        "result": { "temp": 4 },
    }));
    server.send_json(json!({ "type": "error", "error": "quota exceeded" }));
    server.send_json(json!({ "type": "turn_complete", "data": true }));

    let seen = events_until(&mut rig.events, |e| matches!(e, SessionEvent::TurnComplete)).await;
    assert!(seen.contains(&SessionEvent::TextReceived {
        text: "hello there".into()
    }));
    assert!(seen.contains(&SessionEvent::FunctionCall {
        name: "get_weather".into(),
        arguments: json!({ "city": "Oslo" }),
        result: Some(json!({ "temp": 4 })),
    }));
    assert!(seen.contains(&SessionEvent::RemoteError {
        reason: "quota exceeded".into()
    }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_text_goes_out_as_text_input() {
    let mut rig = rig();
    assert!(!rig.session.send_text("too early"));

    let mut server = connected(&mut rig).await;
    assert!(rig.session.send_text("what time is it"));
    let v = server.next_json().await;
    assert_eq!(v["type"], "text_input");
    assert_eq!(v["text"], "what time is it");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_reports_device_errors_and_double_start() {
    let rig = rig();
    rig.device.deny_input.store(true, Ordering::SeqCst);
    assert!(matches!(rig.session.start(), Err(ParleyError::Device(_))));
    assert!(!rig.session.is_capturing());

    rig.device.deny_input.store(false, Ordering::SeqCst);
    rig.session.start().unwrap();
    assert!(matches!(
        rig.session.start(),
        Err(ParleyError::AlreadyCapturing)
    ));
    assert_eq!(rig.device.input_opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unusable_capture_rate_fails_start_and_releases_device() {
    let rig = rig_with(FakeDevice::with_rates(0, 24_000));
    assert!(matches!(
        rig.session.start(),
        Err(ParleyError::AudioStream(_))
    ));
    assert!(!rig.session.is_capturing());
    assert_eq!(rig.device.input_opens.load(Ordering::SeqCst), 1);
    assert_eq!(rig.device.input_closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slow_output_open_does_not_stall_the_runtime() {
    let mut rig = rig();
    *rig.device.open_output_delay.lock() = Duration::from_millis(500);
    let server = connected(&mut rig).await;

    // Single-threaded runtime: any blocking in a session task delays this.
    let ticker = tokio::spawn(async {
        let mut worst = Duration::ZERO;
        for _ in 0..60 {
            let before = std::time::Instant::now();
            tokio::time::sleep(Duration::from_millis(10)).await;
            worst = worst.max(before.elapsed());
        }
        worst
    });

    server.send_binary(pcm16_bytes(&vec![500i16; 24_000]));
    let worst = ticker.await.unwrap();
    assert!(worst < Duration::from_millis(200), "runtime stalled for {worst:?}");

    assert!(wait_until(WAIT, || rig.session.playback().is_playing()).await);
    assert_eq!(rig.device.output_opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_releases_everything_once() {
    let mut rig = rig();
    let mut server = connected(&mut rig).await;
    rig.session.start().unwrap();
    server.send_binary(pcm16_bytes(&[100; 2400]));
    assert!(wait_until(WAIT, || rig.session.playback().is_playing()).await);

    rig.session.shutdown();
    rig.session.shutdown();

    assert!(!rig.session.is_capturing());
    assert_eq!(rig.session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(rig.device.input_closes.load(Ordering::SeqCst), 1);
    assert_eq!(rig.device.output_closes.load(Ordering::SeqCst), 1);

    // The client closed the socket on the way out.
    loop {
        match server.next(WAIT).await {
            Some(Outbound::Close) => break,
            Some(_) => continue,
            None => panic!("no close frame after shutdown"),
        }
    }
}
