//! Turn-state engine: the single owner of the conversational state.
//!
//! It consumes transport events, turns control messages into [`AgentEvent`]s,
//! moves audio between the codec, the audio port and the session, and runs
//! the listening controls including silence based auto-stop.

mod events;
mod monitor;
mod playback_timer;
mod state;

pub use events::AgentEvent;
pub use playback_timer::PlaybackTimer;
pub use state::TurnState;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioError, AudioPort};
use crate::codec::{CodecAdapter, FrameSpec};
use crate::config::{AbortPolicy, AgentConfig};
use crate::protocol::{
    ControlMessage, Envelope, HelloReply, ListenMode, ServerMessage, TtsMessage, TtsState,
};
use crate::router::{ControlRouter, ToolHandler};
use crate::transport::{SessionSink, TransportEvent};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub uplink: FrameSpec,
    pub downlink: FrameSpec,
    pub vad_threshold: u32,
    pub vad_poll_interval: Duration,
    pub playback_timeout: Duration,
    pub abort_policy: AbortPolicy,
}

impl EngineConfig {
    pub fn from_agent_config(config: &AgentConfig) -> Self {
        Self {
            uplink: config.audio.uplink(),
            downlink: config.audio.downlink(),
            vad_threshold: config.vad_threshold,
            vad_poll_interval: config.vad_poll_interval,
            playback_timeout: config.playback_timeout,
            abort_policy: config.abort_policy,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_agent_config(&AgentConfig::default())
    }
}

/// State guarded by the engine mutex. `generation` changes every time a
/// listening cycle starts or ends, so a monitor can tell whether its cycle is
/// still current.
struct TurnCycle {
    state: TurnState,
    generation: u64,
    monitor: Option<CancellationToken>,
}

struct EngineInner {
    config: EngineConfig,
    cycle: tokio::sync::Mutex<TurnCycle>,
    state_tx: watch::Sender<TurnState>,
    sink: Arc<dyn SessionSink>,
    audio: Option<Arc<dyn AudioPort>>,
    codec: Arc<CodecAdapter>,
    events: broadcast::Sender<AgentEvent>,
    router: ControlRouter,
    playback_timer: PlaybackTimer,
    downlink: Mutex<FrameSpec>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct TurnEngine {
    inner: Arc<EngineInner>,
}

impl TurnEngine {
    pub fn new(
        config: EngineConfig,
        sink: Arc<dyn SessionSink>,
        audio: Option<Arc<dyn AudioPort>>,
        codec: Arc<CodecAdapter>,
        events: broadcast::Sender<AgentEvent>,
        tool_handler: Option<Arc<dyn ToolHandler>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(TurnState::Idle);
        let router = ControlRouter::new(tool_handler, Arc::clone(&sink));
        let playback_timer = PlaybackTimer::new(config.playback_timeout);
        let downlink = Mutex::new(config.downlink);

        Self {
            inner: Arc::new(EngineInner {
                config,
                cycle: tokio::sync::Mutex::new(TurnCycle {
                    state: TurnState::Idle,
                    generation: 0,
                    monitor: None,
                }),
                state_tx,
                sink,
                audio,
                codec,
                events,
                router,
                playback_timer,
                downlink,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start consuming transport events and captured audio.
    pub fn start(&self, transport_events: mpsc::Receiver<TransportEvent>) {
        let (playback_tx, playback_rx) = mpsc::channel(64);
        let mut tasks = Vec::new();

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            engine.run_event_loop(transport_events, playback_tx).await;
        }));

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            engine.run_playback_pump(playback_rx).await;
        }));

        if let Some(audio) = &self.inner.audio {
            let frames = audio.subscribe();
            let engine = self.clone();
            tasks.push(tokio::spawn(async move {
                engine.run_capture_pump(frames).await;
            }));
        }

        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(tasks);
    }

    /// Current state without waiting for the engine lock.
    pub fn state(&self) -> TurnState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TurnState> {
        self.inner.state_tx.subscribe()
    }

    pub fn downlink_spec(&self) -> FrameSpec {
        *self.inner.downlink.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn session_id(&self) -> String {
        self.inner.sink.session_id()
    }

    /// Open the microphone and tell the server a listening turn started.
    /// Auto and realtime turns get a fresh silence monitor.
    pub async fn start_listening(&self, mode: ListenMode) -> Result<(), AudioError> {
        let Some(audio) = self.inner.audio.clone() else {
            log::warn!("⚠️ Audio is disabled, cannot start listening");
            return Ok(());
        };

        let mut cycle = self.inner.cycle.lock().await;
        // Nothing changes and nothing is sent unless the microphone opened
        audio.start_capture()?;
        if let Some(previous) = cycle.monitor.take() {
            previous.cancel();
        }
        cycle.generation += 1;

        self.inner
            .sink
            .send(&ControlMessage::ListenStart { mode })
            .await;
        self.set_state(&mut cycle, TurnState::listening(mode));
        log::info!("🎤 Listening ({})", mode);

        if mode != ListenMode::Manual {
            let token = CancellationToken::new();
            cycle.monitor = Some(token.clone());
            let engine = self.clone();
            let generation = cycle.generation;
            tokio::spawn(async move {
                engine.run_auto_stop_monitor(token, generation, mode).await;
            });
        }
        Ok(())
    }

    /// End the current listening turn. Does nothing unless listening.
    pub async fn stop_listening(&self) {
        let mut cycle = self.inner.cycle.lock().await;
        if !cycle.state.is_listening() {
            log::debug!("Not listening, nothing to stop");
            return;
        }
        self.end_listening(&mut cycle, true).await;
        log::info!("🔇 Stopped listening");
    }

    /// Ask the server to stop speaking.
    pub async fn abort(&self) {
        self.inner.sink.send(&ControlMessage::abort()).await;
        if let Some(audio) = &self.inner.audio {
            audio.clear_playback();
        }

        if self.inner.config.abort_policy == AbortPolicy::StopCapture {
            let mut cycle = self.inner.cycle.lock().await;
            if cycle.state.is_listening() {
                self.end_listening(&mut cycle, false).await;
            }
        }
    }

    /// Send typed text as if it had been spoken.
    pub async fn chat_message(&self, text: &str) {
        self.inner
            .sink
            .send(&ControlMessage::ListenDetect {
                text: text.to_string(),
            })
            .await;
    }

    pub async fn send_tool_reply(&self, payload: serde_json::Value) {
        self.inner.sink.send(&ControlMessage::Mcp { payload }).await;
    }

    /// Stop every task and timer owned by the engine. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.playback_timer.cancel();

        {
            let mut cycle = self.inner.cycle.lock().await;
            if let Some(monitor) = cycle.monitor.take() {
                monitor.cancel();
            }
            cycle.generation += 1;
            if let Some(audio) = &self.inner.audio {
                if cycle.state.is_listening() {
                    if let Err(e) = audio.stop_capture() {
                        log::warn!("⚠️ Failed to stop capture: {}", e);
                    }
                }
                audio.clear_playback();
            }
            self.set_state(&mut cycle, TurnState::Idle);
        }

        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        log::debug!("Turn engine shut down");
    }

    /// Stop capture and return to idle. The caller holds the cycle lock and
    /// has checked that a listening turn is active.
    async fn end_listening(&self, cycle: &mut TurnCycle, notify_server: bool) {
        if let Some(monitor) = cycle.monitor.take() {
            monitor.cancel();
        }
        cycle.generation += 1;
        if let Some(audio) = &self.inner.audio {
            if let Err(e) = audio.stop_capture() {
                log::warn!("⚠️ Failed to stop capture: {}", e);
            }
        }
        if notify_server {
            self.inner.sink.send(&ControlMessage::ListenStop).await;
        }
        self.set_state(cycle, TurnState::Idle);
    }

    fn set_state(&self, cycle: &mut TurnCycle, next: TurnState) {
        let from = cycle.state;
        if from == next {
            return;
        }
        cycle.state = next;
        self.inner.state_tx.send_replace(next);
        log::debug!("Turn state {} -> {}", from, next);
        self.emit(AgentEvent::StateChanged { from, to: next });
    }

    fn emit(&self, event: AgentEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    async fn run_event_loop(
        &self,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        playback_tx: mpsc::Sender<Vec<u8>>,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                event = transport_events.recv() => event,
            };

            match event {
                Some(TransportEvent::Control(envelope)) => self.handle_control(envelope).await,
                Some(TransportEvent::Audio(frame)) => self.handle_audio(frame, &playback_tx).await,
                Some(TransportEvent::Closed(reason)) => {
                    log::warn!("🔌 Session closed: {}", reason.as_deref().unwrap_or("no reason"));
                    self.emit(AgentEvent::Disconnected { reason });
                    break;
                }
                None => break,
            }
        }
        log::debug!("Engine event loop finished");
    }

    async fn handle_control(&self, envelope: Envelope) {
        match envelope.message {
            ServerMessage::Hello(reply) => self.apply_hello(reply),
            ServerMessage::Stt(stt) => {
                let text = stt.text.unwrap_or_default();
                log::info!("🗣️ Question: {}", text);
                self.emit(AgentEvent::Question(text));
                self.emit(AgentEvent::AudioStart);
            }
            ServerMessage::Tts(tts) => self.handle_tts(tts).await,
            ServerMessage::Llm(llm) => {
                self.emit(AgentEvent::Emotion(llm.emotion.unwrap_or_default()));
                self.emit(AgentEvent::EmotionText(llm.text.unwrap_or_default()));
            }
            ServerMessage::Mcp(mcp) => {
                self.emit(AgentEvent::ToolProtocol(mcp.payload.clone()));
                self.inner.router.dispatch(mcp.payload);
            }
            ServerMessage::Iot(iot) => {
                log::debug!("Ignoring iot message: {}", iot.commands);
            }
            ServerMessage::Other => {
                log::debug!("Ignoring unhandled '{}' message", envelope.kind);
            }
        }
    }

    async fn handle_tts(&self, tts: TtsMessage) {
        match tts.state {
            TtsState::Start => self.mark_speaking().await,
            TtsState::SentenceStart => {
                let text = tts.text.unwrap_or_default();
                log::info!("💬 Answer: {}", text);
                self.emit(AgentEvent::Answer(text));
            }
            TtsState::Stop => {
                self.emit(AgentEvent::AnswerStop);
                let mut cycle = self.inner.cycle.lock().await;
                if cycle.state == TurnState::Speaking {
                    self.set_state(&mut cycle, TurnState::Idle);
                }
            }
            TtsState::SentenceEnd | TtsState::Other => {
                log::debug!("tts state {:?}", tts.state);
            }
        }
    }

    fn apply_hello(&self, reply: HelloReply) {
        log::info!(
            "👋 Server hello (transport: {})",
            reply.transport.as_deref().unwrap_or("unknown")
        );
        let Some(params) = reply.audio_params else {
            return;
        };
        let mut downlink = self.inner.downlink.lock().unwrap_or_else(|p| p.into_inner());
        let updated = FrameSpec {
            sample_rate: params.sample_rate.unwrap_or(downlink.sample_rate),
            channels: params.channels.unwrap_or(downlink.channels),
            frame_duration_ms: params.frame_duration.unwrap_or(downlink.frame_duration_ms),
        };
        if updated != *downlink {
            log::info!(
                "🔧 Downlink audio renegotiated: {}Hz x{} {}ms",
                updated.sample_rate,
                updated.channels,
                updated.frame_duration_ms
            );
            *downlink = updated;
        }
    }

    async fn mark_speaking(&self) {
        if self.state() != TurnState::Idle {
            return;
        }
        let mut cycle = self.inner.cycle.lock().await;
        if cycle.state == TurnState::Idle {
            self.set_state(&mut cycle, TurnState::Speaking);
        }
    }

    async fn handle_audio(&self, frame: Vec<u8>, playback_tx: &mpsc::Sender<Vec<u8>>) {
        self.mark_speaking().await;

        if self.inner.audio.is_some() && playback_tx.send(frame).await.is_err() {
            log::debug!("Playback pump is gone, dropping frame");
        }

        let engine = self.clone();
        self.inner.playback_timer.arm(async move {
            engine.finish_playback().await;
        });
    }

    async fn finish_playback(&self) {
        let mut cycle = self.inner.cycle.lock().await;
        log::debug!("🔈 Playback finished");
        self.emit(AgentEvent::AudioStop);
        if cycle.state == TurnState::Speaking {
            self.set_state(&mut cycle, TurnState::Idle);
        }
    }

    async fn run_playback_pump(&self, mut frames: mpsc::Receiver<Vec<u8>>) {
        while let Some(frame) = frames.recv().await {
            let Some(audio) = self.inner.audio.clone() else {
                continue;
            };
            let codec = Arc::clone(&self.inner.codec);
            let spec = self.downlink_spec();

            let result = tokio::task::spawn_blocking(move || {
                let pcm = codec.decode(&frame, spec);
                if pcm.is_empty() {
                    return Ok(());
                }
                audio.enqueue_playback(&pcm)
            })
            .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("⚠️ Dropped playback frame: {}", e),
                Err(e) => log::error!("❌ Decode task failed: {}", e),
            }
        }
    }

    async fn run_capture_pump(&self, mut frames: broadcast::Receiver<Vec<u8>>) {
        loop {
            let frame = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                frame = frames.recv() => frame,
            };

            match frame {
                Ok(pcm) => {
                    if !self.state().is_listening() {
                        continue;
                    }
                    let codec = Arc::clone(&self.inner.codec);
                    let spec = self.inner.config.uplink;
                    match tokio::task::spawn_blocking(move || codec.encode(&pcm, spec)).await {
                        Ok(encoded) => self.inner.sink.send_audio(encoded).await,
                        Err(e) => log::error!("❌ Encode task failed: {}", e),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("⚠️ Capture pump lagged, {} frames skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests;
