//! Persistent WebSocket session carrying JSON control frames and binary audio.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use secrecy::{ExposeSecret, SecretBox};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::identity::DeviceIdentity;
use crate::protocol::{parse_server_message, ControlMessage, Envelope, PROTOCOL_VERSION};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket connection failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: &'static str, reason: String },
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum ConnectionStatus {
    Disconnected = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
}

#[derive(Debug)]
struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: ConnectionStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    fn get(&self) -> ConnectionStatus {
        match self.0.load(Ordering::Acquire) {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Open,
            3 => ConnectionStatus::Closing,
            _ => ConnectionStatus::Disconnected,
        }
    }

    fn set(&self, status: ConnectionStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Where and as whom to open a session.
#[derive(Debug)]
pub struct SessionInfo {
    pub endpoint: String,
    pub token: SecretBox<String>,
    pub identity: DeviceIdentity,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// First message sent once the connection is open.
    pub hello: ControlMessage,
    pub connect_timeout: Duration,
    pub event_capacity: usize,
    pub outbound_capacity: usize,
}

impl TransportConfig {
    pub fn new(hello: ControlMessage) -> Self {
        Self {
            hello,
            connect_timeout: Duration::from_secs(10),
            event_capacity: 256,
            outbound_capacity: 256,
        }
    }
}

/// Everything the receive loop hands upward, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Control(Envelope),
    Audio(Vec<u8>),
    /// The connection ended, with the peer's or the error's reason.
    Closed(Option<String>),
}

/// Outbound half of a session as the engine uses it.
#[async_trait]
pub trait SessionSink: Send + Sync {
    /// Send a control message stamped with the current session id. Dropped
    /// silently unless the connection is open.
    async fn send(&self, message: &ControlMessage);

    /// Send one compressed audio frame. Dropped silently unless open.
    async fn send_audio(&self, frame: Vec<u8>);

    fn session_id(&self) -> String;

    fn is_open(&self) -> bool;
}

pub struct SessionTransport {
    endpoint: String,
    status: Arc<StatusCell>,
    session_id: Arc<RwLock<String>>,
    outbound: mpsc::Sender<Message>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    shut_down: AtomicBool,
}

impl SessionTransport {
    /// Open the connection, send the hello and start the send and receive
    /// loops.
    pub async fn connect(
        info: SessionInfo,
        config: TransportConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let status = Arc::new(StatusCell::new(ConnectionStatus::Connecting));
        log::info!("🔌 Connecting to {}", info.endpoint);

        let request = match build_request(&info) {
            Ok(request) => request,
            Err(e) => {
                status.set(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        let ws_stream =
            match tokio::time::timeout(config.connect_timeout, connect_async(request)).await {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(e)) => {
                    status.set(ConnectionStatus::Disconnected);
                    return Err(e.into());
                }
                Err(_) => {
                    status.set(ConnectionStatus::Disconnected);
                    return Err(TransportError::Timeout(config.connect_timeout));
                }
            };

        status.set(ConnectionStatus::Open);
        log::info!("✅ Session connected to {}", info.endpoint);

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(config.outbound_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let session_id = Arc::new(RwLock::new(String::new()));

        let send_status = Arc::clone(&status);
        let sender_handle = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    log::error!("❌ WebSocket write failed: {}", e);
                    send_status.set(ConnectionStatus::Disconnected);
                    break;
                }
                if closing {
                    break;
                }
            }
            log::debug!("Session send loop finished");
        });

        let recv_status = Arc::clone(&status);
        let recv_session = Arc::clone(&session_id);
        let receiver_handle = tokio::spawn(async move {
            let mut reason = None;
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match parse_server_message(text.as_str()) {
                        Ok(envelope) => {
                            if let Some(id) = &envelope.session_id {
                                record_session_id(&recv_session, id);
                            }
                            log::debug!("⬅️ {} message", envelope.kind);
                            if event_tx.send(TransportEvent::Control(envelope)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!(
                                "⚠️ Skipping malformed control frame ({}): {}",
                                e,
                                text.as_str()
                            );
                        }
                    },
                    Ok(Message::Binary(data)) => {
                        let frame = data.as_slice().to_vec();
                        if event_tx.send(TransportEvent::Audio(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        log::info!("🔌 Server closed the session: {:?}", frame);
                        reason = frame.map(|f| f.reason.to_string());
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("❌ WebSocket read failed: {}", e);
                        reason = Some(e.to_string());
                        break;
                    }
                }
            }
            recv_status.set(ConnectionStatus::Disconnected);
            let _ = event_tx.send(TransportEvent::Closed(reason)).await;
            log::debug!("Session receive loop finished");
        });

        let transport = Self {
            endpoint: info.endpoint,
            status,
            session_id,
            outbound,
            tasks: Mutex::new(Some((sender_handle, receiver_handle))),
            shut_down: AtomicBool::new(false),
        };

        transport.send(&config.hello).await;
        Ok((transport, event_rx))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    /// Close the connection and stop both loops. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("🔌 Closing session to {}", self.endpoint);
        self.status.set(ConnectionStatus::Closing);
        let _ = self.outbound.try_send(Message::Close(None));

        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some((mut sender, receiver)) = tasks {
            if tokio::time::timeout(Duration::from_secs(1), &mut sender)
                .await
                .is_err()
            {
                log::debug!("Send loop did not finish in time");
            }
            sender.abort();
            receiver.abort();
        }
        self.status.set(ConnectionStatus::Disconnected);
    }
}

#[async_trait]
impl SessionSink for SessionTransport {
    async fn send(&self, message: &ControlMessage) {
        let status = self.status();
        if status != ConnectionStatus::Open {
            log::debug!("Dropping {} message, session is {}", message.kind(), status);
            return;
        }
        let text = message.to_text(&self.session_id());
        log::debug!("➡️ {}", text);
        if self.outbound.send(Message::Text(text.into())).await.is_err() {
            log::warn!("⚠️ Send loop is gone, {} message lost", message.kind());
        }
    }

    async fn send_audio(&self, frame: Vec<u8>) {
        if frame.is_empty() || self.status() != ConnectionStatus::Open {
            return;
        }
        if self.outbound.send(Message::Binary(frame.into())).await.is_err() {
            log::warn!("⚠️ Send loop is gone, audio frame lost");
        }
    }

    fn session_id(&self) -> String {
        self.session_id
            .read()
            .map(|id| id.clone())
            .unwrap_or_default()
    }

    fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }
}

fn record_session_id(cell: &RwLock<String>, id: &str) {
    let mut current = cell.write().unwrap_or_else(|p| p.into_inner());
    if current.as_str() != id {
        log::info!("🆔 Session id: {}", id);
        *current = id.to_string();
    }
}

/// Handshake request with the bearer token and identity headers.
pub fn build_request(info: &SessionInfo) -> Result<Request, TransportError> {
    let url = Url::parse(&info.endpoint)?;
    let mut request = url.as_str().into_client_request()?;

    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        header_value(
            "Authorization",
            &format!("Bearer {}", info.token.expose_secret()),
        )?,
    );
    headers.insert(
        "Protocol-Version",
        header_value("Protocol-Version", &PROTOCOL_VERSION.to_string())?,
    );
    headers.insert(
        "Device-Id",
        header_value("Device-Id", &info.identity.device_id)?,
    );
    headers.insert(
        "Client-Id",
        header_value("Client-Id", &info.identity.client_id)?,
    );

    Ok(request)
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value).map_err(|e| TransportError::InvalidHeader {
        name,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameSpec;
    use crate::protocol::AudioParams;

    fn info(endpoint: &str) -> SessionInfo {
        SessionInfo {
            endpoint: endpoint.to_string(),
            token: SecretBox::new(Box::new("T".to_string())),
            identity: DeviceIdentity::new("aa:bb:cc:dd:ee:ff", "client-1"),
        }
    }

    fn hello() -> ControlMessage {
        ControlMessage::Hello {
            mcp: false,
            audio_params: AudioParams::new("pcm", FrameSpec::new(16000, 1, 60)),
        }
    }

    #[test]
    fn test_build_request_headers() {
        let request = build_request(&info("wss://api.example.com/xiaozhi/v1/")).unwrap();
        let headers = request.headers();
        assert_eq!(headers["Authorization"], "Bearer T");
        assert_eq!(headers["Protocol-Version"], "1");
        assert_eq!(headers["Device-Id"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(headers["Client-Id"], "client-1");
        assert_eq!(request.uri().host(), Some("api.example.com"));
    }

    #[test]
    fn test_build_request_rejects_bad_input() {
        assert!(matches!(
            build_request(&info("not a url")),
            Err(TransportError::UrlParse(_))
        ));

        let mut bad = info("ws://localhost/");
        bad.identity.device_id = "bad\nid".to_string();
        assert!(matches!(
            build_request(&bad),
            Err(TransportError::InvalidHeader { name: "Device-Id", .. })
        ));
    }

    #[test]
    fn test_status_cell() {
        let cell = StatusCell::new(ConnectionStatus::Disconnected);
        assert_eq!(cell.get(), ConnectionStatus::Disconnected);
        cell.set(ConnectionStatus::Open);
        assert_eq!(cell.get(), ConnectionStatus::Open);
        assert_eq!(ConnectionStatus::Closing.to_string(), "Closing");
    }

    #[test]
    fn test_session_id_recorded() {
        let cell = RwLock::new(String::new());
        record_session_id(&cell, "abc");
        assert_eq!(*cell.read().unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut config = TransportConfig::new(hello());
        config.connect_timeout = Duration::from_secs(2);
        // Nothing listens on port 1
        let result = SessionTransport::connect(info("ws://127.0.0.1:1/xiaozhi/v1/"), config).await;
        assert!(result.is_err());
    }
}
