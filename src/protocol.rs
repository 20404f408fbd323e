//! Wire model of the session protocol.
//!
//! Control messages travel as JSON text frames of the form
//! `{"type": ..., "session_id": ..., ...}`. Audio travels as binary frames and
//! is not modelled here.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::codec::FrameSpec;

pub const PROTOCOL_VERSION: u32 = 1;
pub const ABORT_REASON_WAKE_WORD: &str = "wake_word_detected";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Missing field: {0}")]
    MissingField(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ListenMode {
    /// Server decides when the user finished speaking; local silence also stops.
    Auto,
    /// Capture runs until explicitly stopped.
    Manual,
    /// Continuous full duplex capture.
    Realtime,
}

impl ListenMode {
    /// Lenient parse: anything that is not `manual` or `realtime` is `auto`.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "manual" => ListenMode::Manual,
            "realtime" => ListenMode::Realtime,
            _ => ListenMode::Auto,
        }
    }
}

/// Audio parameters announced in the client hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: u32,
}

impl AudioParams {
    pub fn new(format: &str, spec: FrameSpec) -> Self {
        Self {
            format: format.to_string(),
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            frame_duration: spec.frame_duration_ms,
        }
    }
}

/// Outbound control messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Hello { mcp: bool, audio_params: AudioParams },
    ListenStart { mode: ListenMode },
    ListenStop,
    /// Wake word or typed chat text.
    ListenDetect { text: String },
    Abort { reason: String },
    Heartbeat,
    Mcp { payload: Value },
    Iot { commands: Value },
}

impl ControlMessage {
    pub fn abort() -> Self {
        ControlMessage::Abort {
            reason: ABORT_REASON_WAKE_WORD.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::ListenStart { .. }
            | ControlMessage::ListenStop
            | ControlMessage::ListenDetect { .. } => "listen",
            ControlMessage::Abort { .. } => "abort",
            ControlMessage::Heartbeat => "heartbeat",
            ControlMessage::Mcp { .. } => "mcp",
            ControlMessage::Iot { .. } => "iot",
        }
    }

    pub fn to_json(&self, session_id: &str) -> Value {
        match self {
            ControlMessage::Hello { mcp, audio_params } => json!({
                "session_id": session_id,
                "type": "hello",
                "version": PROTOCOL_VERSION,
                "features": { "mcp": mcp },
                "transport": "websocket",
                "audio_params": audio_params,
            }),
            ControlMessage::ListenStart { mode } => json!({
                "session_id": session_id,
                "type": "listen",
                "state": "start",
                "mode": mode,
            }),
            ControlMessage::ListenStop => json!({
                "session_id": session_id,
                "type": "listen",
                "state": "stop",
            }),
            ControlMessage::ListenDetect { text } => json!({
                "session_id": session_id,
                "type": "listen",
                "state": "detect",
                "text": text,
            }),
            ControlMessage::Abort { reason } => json!({
                "session_id": session_id,
                "type": "abort",
                "reason": reason,
            }),
            ControlMessage::Heartbeat => json!({
                "session_id": session_id,
                "type": "heartbeat",
            }),
            ControlMessage::Mcp { payload } => json!({
                "session_id": session_id,
                "type": "mcp",
                "payload": payload,
            }),
            ControlMessage::Iot { commands } => json!({
                "session_id": session_id,
                "type": "iot",
                "commands": commands,
            }),
        }
    }

    pub fn to_text(&self, session_id: &str) -> String {
        self.to_json(session_id).to_string()
    }
}

/// Audio parameters the server may announce in its hello reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerAudioParams {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u16>,
    #[serde(default)]
    pub frame_duration: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HelloReply {
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub audio_params: Option<ServerAudioParams>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SttMessage {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
    SentenceEnd,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TtsMessage {
    pub state: TtsState,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LlmMessage {
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct McpMessage {
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IotMessage {
    #[serde(default)]
    pub commands: Value,
}

/// Inbound control messages, keyed by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello(HelloReply),
    Stt(SttMessage),
    Tts(TtsMessage),
    Llm(LlmMessage),
    Mcp(McpMessage),
    Iot(IotMessage),
    #[serde(other)]
    Other,
}

/// A parsed server message plus the session id it carried, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub session_id: Option<String>,
    pub kind: String,
    pub message: ServerMessage,
}

/// Parse one inbound text frame.
pub fn parse_server_message(text: &str) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MissingField("type".to_string()))?
        .to_string();
    let session_id = value
        .get("session_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let message = serde_json::from_value(value)?;

    Ok(Envelope {
        session_id,
        kind,
        message,
    })
}
