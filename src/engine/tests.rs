use super::*;
use crate::audio::MemoryAudioPort;
use crate::protocol::parse_server_message;
use crate::router::test_support::RecordingSink;
use crate::router::HandlerError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;

struct Harness {
    engine: TurnEngine,
    sink: Arc<RecordingSink>,
    port: Arc<MemoryAudioPort>,
    events: broadcast::Receiver<AgentEvent>,
    transport_tx: mpsc::Sender<TransportEvent>,
}

fn test_config() -> EngineConfig {
    EngineConfig {
        vad_threshold: 3,
        vad_poll_interval: Duration::from_millis(10),
        playback_timeout: Duration::from_millis(80),
        ..EngineConfig::default()
    }
}

fn harness(config: EngineConfig, handler: Option<Arc<dyn ToolHandler>>) -> Harness {
    let sink = RecordingSink::new("s1");
    let port = Arc::new(MemoryAudioPort::new(480_000));
    let (events_tx, events) = broadcast::channel(256);
    let engine = TurnEngine::new(
        config,
        sink.clone(),
        Some(port.clone() as Arc<dyn AudioPort>),
        Arc::new(CodecAdapter::pcm()),
        events_tx,
        handler,
    );
    let (transport_tx, transport_rx) = mpsc::channel(64);
    engine.start(transport_rx);
    Harness {
        engine,
        sink,
        port,
        events,
        transport_tx,
    }
}

fn control(text: &str) -> TransportEvent {
    TransportEvent::Control(parse_server_message(text).unwrap())
}

fn tone(sample: i16, samples: usize) -> Vec<u8> {
    sample.to_le_bytes().repeat(samples)
}

/// Everything emitted so far except state changes.
fn drain(events: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !matches!(event, AgentEvent::StateChanged { .. }) {
            out.push(event);
        }
    }
    out
}

struct EchoHandler;

#[async_trait]
impl ToolHandler for EchoHandler {
    async fn handle(&self, payload: Value) -> Result<Option<Value>, HandlerError> {
        Ok(Some(json!({"jsonrpc": "2.0", "id": payload["id"], "result": {}})))
    }
}

#[tokio::test]
async fn test_manual_listening_round_trip() {
    let h = harness(test_config(), None);

    h.engine.start_listening(ListenMode::Manual).await.unwrap();
    assert_eq!(h.engine.state(), TurnState::ListeningManual);
    assert!(h.port.is_capturing());

    let messages = h.sink.messages();
    assert_eq!(messages[0]["type"], "listen");
    assert_eq!(messages[0]["state"], "start");
    assert_eq!(messages[0]["mode"], "manual");
    assert_eq!(messages[0]["session_id"], "s1");

    // Manual turns ignore silence
    for _ in 0..5 {
        h.port.push_capture(&tone(0, 960));
    }
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.state(), TurnState::ListeningManual);

    h.engine.stop_listening().await;
    h.engine.stop_listening().await;
    assert_eq!(h.sink.count_listen("stop"), 1);
    assert_eq!(h.engine.state(), TurnState::Idle);
    assert!(!h.port.is_capturing());
}

#[tokio::test]
async fn test_captured_frames_are_encoded_and_sent() {
    let h = harness(test_config(), None);
    h.engine.start_listening(ListenMode::Manual).await.unwrap();

    h.port.push_capture(&tone(1000, 500));
    sleep(Duration::from_millis(100)).await;

    let frames = h.sink.audio_frames();
    assert_eq!(frames.len(), 1);
    // Padded to one 60 ms frame at 16 kHz
    assert_eq!(frames[0].len(), 1920);

    h.engine.stop_listening().await;
    assert!(!h.port.push_capture(&tone(1000, 960)));
}

#[tokio::test]
async fn test_auto_stop_after_threshold() {
    let h = harness(test_config(), None);
    h.engine.start_listening(ListenMode::Auto).await.unwrap();
    assert_eq!(h.engine.state(), TurnState::ListeningAuto);

    for _ in 0..3 {
        h.port.push_capture(&tone(0, 960));
    }
    sleep(Duration::from_millis(200)).await;

    assert_eq!(h.engine.state(), TurnState::Idle);
    assert_eq!(h.sink.count_listen("stop"), 1);
    assert!(!h.port.is_capturing());
    assert!(h.engine.inner.cycle.lock().await.monitor.is_none());
}

#[tokio::test]
async fn test_speech_resets_silence() {
    let h = harness(test_config(), None);
    h.engine.start_listening(ListenMode::Auto).await.unwrap();

    h.port.push_capture(&tone(0, 960));
    h.port.push_capture(&tone(0, 960));
    h.port.push_capture(&tone(10000, 960));
    h.port.push_capture(&tone(0, 960));
    h.port.push_capture(&tone(0, 960));
    sleep(Duration::from_millis(150)).await;

    assert_eq!(h.engine.state(), TurnState::ListeningAuto);
    assert_eq!(h.sink.count_listen("stop"), 0);
}

#[tokio::test]
async fn test_realtime_keeps_listening() {
    let h = harness(test_config(), None);
    h.engine
        .start_listening(ListenMode::Realtime)
        .await
        .unwrap();

    for _ in 0..6 {
        h.port.push_capture(&tone(0, 960));
    }
    sleep(Duration::from_millis(150)).await;

    assert_eq!(h.engine.state(), TurnState::ListeningRealtime);
    assert!(h.port.is_capturing());
    assert_eq!(h.sink.count_listen("stop"), 0);
}

#[tokio::test]
async fn test_restart_cancels_previous_monitor() {
    let h = harness(test_config(), None);

    h.engine.start_listening(ListenMode::Auto).await.unwrap();
    let first = h.engine.inner.cycle.lock().await.monitor.clone().unwrap();

    h.engine.start_listening(ListenMode::Auto).await.unwrap();
    let second = h.engine.inner.cycle.lock().await.monitor.clone().unwrap();

    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());
    assert_eq!(h.sink.count_listen("start"), 2);

    for _ in 0..3 {
        h.port.push_capture(&tone(0, 960));
    }
    sleep(Duration::from_millis(200)).await;

    // Only the live monitor stops the turn
    assert_eq!(h.sink.count_listen("stop"), 1);
    assert_eq!(h.engine.state(), TurnState::Idle);
}

#[tokio::test]
async fn test_stop_before_threshold_wins() {
    let h = harness(test_config(), None);
    h.engine.start_listening(ListenMode::Auto).await.unwrap();
    h.port.push_capture(&tone(0, 960));

    h.engine.stop_listening().await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(h.sink.count_listen("stop"), 1);
    assert_eq!(h.engine.state(), TurnState::Idle);
    assert!(h.engine.inner.cycle.lock().await.monitor.is_none());
}

#[tokio::test]
async fn test_message_classification() {
    let mut h = harness(test_config(), None);

    for text in [
        r#"{"type":"stt","text":"What time is it?","session_id":"s1"}"#,
        r#"{"type":"tts","state":"sentence_start","text":"Hello"}"#,
        r#"{"type":"tts","state":"sentence_end","text":"Hello"}"#,
        r#"{"type":"tts","state":"stop"}"#,
        r#"{"type":"llm","emotion":"happy","text":"😀"}"#,
        r#"{"type":"system","command":"reboot"}"#,
    ] {
        h.transport_tx.send(control(text)).await.unwrap();
    }
    sleep(Duration::from_millis(100)).await;

    assert_eq!(
        drain(&mut h.events),
        vec![
            AgentEvent::Question("What time is it?".to_string()),
            AgentEvent::AudioStart,
            AgentEvent::Answer("Hello".to_string()),
            AgentEvent::AnswerStop,
            AgentEvent::Emotion("happy".to_string()),
            AgentEvent::EmotionText("😀".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_playback_timer_debounces_audio_stop() {
    let mut h = harness(test_config(), None);

    for _ in 0..5 {
        h.transport_tx
            .send(TransportEvent::Audio(tone(100, 1440)))
            .await
            .unwrap();
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.engine.state(), TurnState::Speaking);
    sleep(Duration::from_millis(300)).await;

    let stops = drain(&mut h.events)
        .into_iter()
        .filter(|e| *e == AgentEvent::AudioStop)
        .count();
    assert_eq!(stops, 1);
    assert_eq!(h.engine.state(), TurnState::Idle);
    assert_eq!(h.port.drain_playback().len(), 5 * 1440);
}

#[tokio::test]
async fn test_listening_is_not_overwritten_by_playback() {
    let h = harness(test_config(), None);
    h.engine.start_listening(ListenMode::Manual).await.unwrap();

    h.transport_tx
        .send(TransportEvent::Audio(tone(100, 1440)))
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(h.engine.state(), TurnState::ListeningManual);
}

#[tokio::test]
async fn test_hello_renegotiates_downlink() {
    let h = harness(test_config(), None);
    assert_eq!(h.engine.downlink_spec().sample_rate, 24000);

    h.transport_tx
        .send(control(
            r#"{"type":"hello","transport":"websocket","session_id":"s9","audio_params":{"sample_rate":16000,"frame_duration":20}}"#,
        ))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let spec = h.engine.downlink_spec();
    assert_eq!(spec.sample_rate, 16000);
    assert_eq!(spec.frame_duration_ms, 20);
    assert_eq!(spec.channels, 1);
}

#[tokio::test]
async fn test_tool_payload_is_dispatched() {
    let mut h = harness(test_config(), Some(Arc::new(EchoHandler)));

    h.transport_tx
        .send(control(
            r#"{"type":"mcp","session_id":"s1","payload":{"jsonrpc":"2.0","id":7,"method":"tools/list"}}"#,
        ))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let events = drain(&mut h.events);
    assert!(matches!(&events[0], AgentEvent::ToolProtocol(p) if p["id"] == 7));

    let replies: Vec<_> = h
        .sink
        .messages()
        .into_iter()
        .filter(|m| m["type"] == "mcp")
        .collect();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["payload"]["id"], 7);
    assert_eq!(replies[0]["session_id"], "s1");
}

#[tokio::test]
async fn test_abort_keeps_capture_by_default() {
    let h = harness(test_config(), None);
    h.engine.start_listening(ListenMode::Manual).await.unwrap();

    h.engine.abort().await;

    let aborts: Vec<_> = h
        .sink
        .messages()
        .into_iter()
        .filter(|m| m["type"] == "abort")
        .collect();
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0]["reason"], "wake_word_detected");
    assert_eq!(h.engine.state(), TurnState::ListeningManual);
    assert!(h.port.is_capturing());
}

#[tokio::test]
async fn test_abort_can_stop_capture() {
    let config = EngineConfig {
        abort_policy: AbortPolicy::StopCapture,
        ..test_config()
    };
    let h = harness(config, None);
    h.engine.start_listening(ListenMode::Auto).await.unwrap();

    h.engine.abort().await;

    assert_eq!(h.engine.state(), TurnState::Idle);
    assert!(!h.port.is_capturing());
    assert_eq!(h.sink.count_listen("stop"), 0);
}

#[tokio::test]
async fn test_chat_message_and_tool_reply() {
    let h = harness(test_config(), None);
    h.engine.chat_message("turn on the light").await;
    h.engine.send_tool_reply(json!({"id": 1})).await;

    let messages = h.sink.messages();
    assert_eq!(messages[0]["state"], "detect");
    assert_eq!(messages[0]["text"], "turn on the light");
    assert_eq!(messages[1]["type"], "mcp");
    assert_eq!(messages[1]["payload"]["id"], 1);
}

#[tokio::test]
async fn test_sends_are_dropped_while_closed() {
    let h = harness(test_config(), None);
    h.sink
        .open
        .store(false, std::sync::atomic::Ordering::Release);

    h.engine.chat_message("hello?").await;
    h.engine.start_listening(ListenMode::Manual).await.unwrap();
    assert!(h.sink.messages().is_empty());
}

#[tokio::test]
async fn test_closed_transport_emits_disconnected() {
    let mut h = harness(test_config(), None);
    h.transport_tx
        .send(TransportEvent::Closed(Some("bye".to_string())))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(
        drain(&mut h.events),
        vec![AgentEvent::Disconnected {
            reason: Some("bye".to_string())
        }]
    );
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let h = harness(test_config(), None);
    h.engine.start_listening(ListenMode::Auto).await.unwrap();

    h.engine.shutdown().await;
    h.engine.shutdown().await;

    assert_eq!(h.engine.state(), TurnState::Idle);
    assert!(!h.port.is_capturing());
    assert!(h.engine.inner.cycle.lock().await.monitor.is_none());
    assert!(!h.engine.inner.playback_timer.is_armed());
}

#[tokio::test]
async fn test_shutdown_cancels_pending_audio_stop() {
    let mut h = harness(test_config(), None);
    h.transport_tx
        .send(TransportEvent::Audio(tone(100, 1440)))
        .await
        .unwrap();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(h.engine.state(), TurnState::Speaking);
    assert!(h.engine.inner.playback_timer.is_armed());

    h.engine.shutdown().await;
    sleep(Duration::from_millis(200)).await;

    let stops = drain(&mut h.events)
        .into_iter()
        .filter(|e| *e == AgentEvent::AudioStop)
        .count();
    assert_eq!(stops, 0);
    assert!(!h.engine.inner.playback_timer.is_armed());
}

#[tokio::test]
async fn test_capture_outside_listening_is_not_sent() {
    let h = harness(test_config(), None);

    // Microphone running while the engine is idle
    h.port.start_capture().unwrap();
    assert!(h.port.push_capture(&tone(1000, 960)));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(h.engine.state(), TurnState::Idle);

    h.transport_tx
        .send(TransportEvent::Audio(tone(100, 1440)))
        .await
        .unwrap();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(h.engine.state(), TurnState::Speaking);
    assert!(h.port.push_capture(&tone(1000, 960)));
    sleep(Duration::from_millis(30)).await;

    assert!(h.sink.audio_frames().is_empty());
}

#[tokio::test]
async fn test_failed_capture_start_changes_nothing() {
    let h = harness(test_config(), None);
    h.port.shutdown();

    assert!(h.engine.start_listening(ListenMode::Auto).await.is_err());
    assert_eq!(h.engine.state(), TurnState::Idle);
    assert_eq!(h.sink.count_listen("start"), 0);
    assert_eq!(h.sink.count_listen("stop"), 0);
    assert!(h.engine.inner.cycle.lock().await.monitor.is_none());
}

#[tokio::test]
async fn test_failed_restart_keeps_running_turn() {
    let h = harness(test_config(), None);
    h.engine.start_listening(ListenMode::Auto).await.unwrap();
    let monitor = h.engine.inner.cycle.lock().await.monitor.clone().unwrap();

    h.port.shutdown();
    assert!(h.engine.start_listening(ListenMode::Auto).await.is_err());

    assert_eq!(h.engine.state(), TurnState::ListeningAuto);
    assert_eq!(h.sink.count_listen("start"), 1);
    assert!(!monitor.is_cancelled());
}

#[tokio::test]
async fn test_without_audio_listening_is_a_no_op() {
    let sink = RecordingSink::new("s1");
    let (events_tx, _events) = broadcast::channel(16);
    let engine = TurnEngine::new(
        test_config(),
        sink.clone(),
        None,
        Arc::new(CodecAdapter::pcm()),
        events_tx,
        None,
    );

    engine.start_listening(ListenMode::Auto).await.unwrap();
    assert_eq!(engine.state(), TurnState::Idle);
    assert!(sink.messages().is_empty());
}
