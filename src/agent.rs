//! Session supervisor: one provisioning, transport and engine cycle at a time,
//! plus the reconnect loop.

use secrecy::SecretBox;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioPort;
use crate::codec::CodecAdapter;
use crate::config::AgentConfig;
use crate::engine::{AgentEvent, EngineConfig, TurnEngine, TurnState};
use crate::error::Result;
use crate::identity::DeviceIdentity;
use crate::ota::{OtaClient, OtaResponse};
use crate::protocol::{AudioParams, ControlMessage, ListenMode};
use crate::router::ToolHandler;
use crate::transport::{
    ConnectionStatus, SessionInfo, SessionSink, SessionTransport, TransportConfig,
};

struct ActiveSession {
    transport: Arc<SessionTransport>,
    engine: TurnEngine,
}

pub struct Agent {
    config: Arc<AgentConfig>,
    identity: DeviceIdentity,
    audio: Option<Arc<dyn AudioPort>>,
    codec: Arc<CodecAdapter>,
    tool_handler: Option<Arc<dyn ToolHandler>>,
    events: broadcast::Sender<AgentEvent>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    latest_ota: Mutex<Option<Arc<OtaResponse>>>,
    supervisor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Agent {
    pub fn new(config: AgentConfig, identity: DeviceIdentity) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config: Arc::new(config),
            identity,
            audio: None,
            codec: Arc::new(CodecAdapter::pcm()),
            tool_handler: None,
            events,
            session: tokio::sync::Mutex::new(None),
            latest_ota: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }

    pub fn with_audio(mut self, audio: Arc<dyn AudioPort>) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_codec(mut self, codec: CodecAdapter) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_tool_handler(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.tool_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Events as a stream. Lagged subscribers see an error item and continue.
    pub fn event_stream(&self) -> BroadcastStream<AgentEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    pub fn latest_ota(&self) -> Option<Arc<OtaResponse>> {
        self.latest_ota
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Run the provisioning check. Failures are reported and yield `None`.
    pub async fn check_ota(&self) -> Option<Arc<OtaResponse>> {
        let client = match OtaClient::new(
            self.config.ota_url.as_str(),
            self.identity.clone(),
            self.config.language.as_str(),
        ) {
            Ok(client) => client,
            Err(e) => {
                log::warn!("⚠️ Cannot build provisioning client: {}", e);
                self.emit(AgentEvent::ProvisioningFailed(e.to_string()));
                return None;
            }
        };

        match client.check_version(&self.identity.version, None).await {
            Ok(response) => {
                response.log_summary();
                let response = Arc::new(response);
                *self.latest_ota.lock().unwrap_or_else(|p| p.into_inner()) =
                    Some(Arc::clone(&response));
                self.emit(AgentEvent::Provisioned(Arc::clone(&response)));
                Some(response)
            }
            Err(e) => {
                log::warn!("⚠️ Provisioning failed, using configured endpoint: {}", e);
                self.emit(AgentEvent::ProvisioningFailed(e.to_string()));
                None
            }
        }
    }

    /// Provision, connect and start a fresh engine. Any previous session is
    /// torn down first.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            teardown(previous).await;
        }

        let ota = self.check_ota().await;
        let (endpoint, token) = resolve_endpoint(&self.config, ota.as_deref());

        let info = SessionInfo {
            endpoint: endpoint.clone(),
            token: SecretBox::new(Box::new(token)),
            identity: self.identity.clone(),
        };
        let transport_config = TransportConfig {
            hello: self.hello(),
            connect_timeout: self.config.connect_timeout,
            event_capacity: self.config.event_capacity,
            outbound_capacity: self.config.event_capacity,
        };

        let (transport, transport_events) = SessionTransport::connect(info, transport_config).await?;
        let transport = Arc::new(transport);

        let engine = TurnEngine::new(
            EngineConfig::from_agent_config(&self.config),
            Arc::clone(&transport) as Arc<dyn SessionSink>,
            self.audio.clone(),
            Arc::clone(&self.codec),
            self.events.clone(),
            self.tool_handler.clone(),
        );
        engine.start(transport_events);

        self.emit(AgentEvent::Connected { endpoint });
        *session = Some(ActiveSession { transport, engine });
        Ok(())
    }

    /// Tear the session down and start a new one.
    pub async fn restart(&self) -> Result<()> {
        log::info!("🔄 Restarting session");
        self.start().await
    }

    /// Keep the session alive: whenever the connection is not open, restart
    /// it and back off before checking again. Replaces any running supervisor.
    pub fn spawn_supervisor(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let agent = Arc::clone(self);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            agent.supervise(task_token).await;
        });

        let previous = self
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace((token, handle));
        if let Some((previous_token, _)) = previous {
            previous_token.cancel();
        }
    }

    async fn supervise(&self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_poll_interval) => {}
            }

            if self.connection_status().await == ConnectionStatus::Open {
                continue;
            }

            log::warn!("⚠️ Session is not open, reconnecting");
            if let Err(e) = self.restart().await {
                log::error!("❌ Reconnect failed: {}", e);
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        log::debug!("Supervisor stopped");
    }

    /// Stop everything the agent started. Safe to call more than once.
    pub async fn shutdown(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some((token, handle)) = supervisor {
            token.cancel();
            handle.abort();
        }

        if let Some(active) = self.session.lock().await.take() {
            teardown(active).await;
        }
        if let Some(audio) = &self.audio {
            audio.shutdown();
        }
        log::info!("👋 Agent shut down");
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        match self.session.lock().await.as_ref() {
            Some(active) => active.transport.status(),
            None => ConnectionStatus::Disconnected,
        }
    }

    pub async fn turn_state(&self) -> TurnState {
        match self.session.lock().await.as_ref() {
            Some(active) => active.engine.state(),
            None => TurnState::Idle,
        }
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|active| active.transport.session_id())
    }

    pub async fn start_listening(&self, mode: ListenMode) -> Result<()> {
        match self.engine().await {
            Some(engine) => Ok(engine.start_listening(mode).await?),
            None => {
                log::warn!("⚠️ No active session, cannot start listening");
                Ok(())
            }
        }
    }

    pub async fn stop_listening(&self) {
        if let Some(engine) = self.engine().await {
            engine.stop_listening().await;
        }
    }

    pub async fn abort(&self) {
        if let Some(engine) = self.engine().await {
            engine.abort().await;
        }
    }

    pub async fn chat_message(&self, text: &str) {
        match self.engine().await {
            Some(engine) => engine.chat_message(text).await,
            None => log::warn!("⚠️ No active session, message dropped"),
        }
    }

    pub async fn mcp_message(&self, payload: serde_json::Value) {
        if let Some(engine) = self.engine().await {
            engine.send_tool_reply(payload).await;
        }
    }

    fn hello(&self) -> ControlMessage {
        ControlMessage::Hello {
            mcp: self.config.mcp_enabled && self.tool_handler.is_some(),
            audio_params: AudioParams::new(self.codec.format(), self.config.audio.uplink()),
        }
    }

    async fn engine(&self) -> Option<TurnEngine> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|active| active.engine.clone())
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}

async fn teardown(active: ActiveSession) {
    active.engine.shutdown().await;
    active.transport.shutdown().await;
}

/// Session endpoint and token: the provisioning answer's websocket block when
/// present, the configured values otherwise.
pub fn resolve_endpoint(config: &AgentConfig, ota: Option<&OtaResponse>) -> (String, String) {
    let url = ota
        .and_then(OtaResponse::websocket_url)
        .unwrap_or(config.ws_url.as_str())
        .to_string();
    let token = ota
        .and_then(OtaResponse::websocket_token)
        .unwrap_or(config.token())
        .to_string();
    (url, token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::WebSocketInfo;

    #[test]
    fn test_resolve_uses_configured_defaults() {
        let config = AgentConfig::default();
        let (url, token) = resolve_endpoint(&config, None);
        assert_eq!(url, config.ws_url);
        assert_eq!(token, "test-token");
    }

    #[test]
    fn test_resolve_prefers_provisioned_websocket() {
        let config = AgentConfig::default();
        let ota = OtaResponse {
            websocket: Some(WebSocketInfo {
                url: "wss://h/p".to_string(),
                token: "T".to_string(),
            }),
            ..Default::default()
        };
        assert_eq!(
            resolve_endpoint(&config, Some(&ota)),
            ("wss://h/p".to_string(), "T".to_string())
        );
    }

    #[test]
    fn test_resolve_falls_back_per_field() {
        let config = AgentConfig::default();
        let ota = OtaResponse {
            websocket: Some(WebSocketInfo {
                url: "wss://h/p".to_string(),
                token: String::new(),
            }),
            ..Default::default()
        };
        let (url, token) = resolve_endpoint(&config, Some(&ota));
        assert_eq!(url, "wss://h/p");
        assert_eq!(token, "test-token");
    }

    #[tokio::test]
    async fn test_idle_agent_without_session() {
        let agent = Agent::new(
            AgentConfig::default(),
            DeviceIdentity::new("aa:bb:cc:dd:ee:ff", "c"),
        );
        assert_eq!(agent.connection_status().await, ConnectionStatus::Disconnected);
        assert_eq!(agent.turn_state().await, TurnState::Idle);
        assert!(agent.session_id().await.is_none());
        agent.start_listening(ListenMode::Auto).await.unwrap();
        agent.chat_message("hello").await;
        agent.shutdown().await;
    }

    #[test]
    fn test_hello_announces_codec_and_tools() {
        let agent = Agent::new(
            AgentConfig::default(),
            DeviceIdentity::new("aa:bb:cc:dd:ee:ff", "c"),
        );
        match agent.hello() {
            ControlMessage::Hello { mcp, audio_params } => {
                assert!(!mcp);
                assert_eq!(audio_params.format, "pcm");
                assert_eq!(audio_params.sample_rate, 16000);
                assert_eq!(audio_params.frame_duration, 60);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
