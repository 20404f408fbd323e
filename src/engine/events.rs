use serde_json::Value;
use std::sync::Arc;
use strum::IntoStaticStr;

use super::TurnState;
use crate::ota::OtaResponse;

/// Everything the agent reports to its subscribers, in arrival order.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum AgentEvent {
    /// Recognized user speech.
    Question(String),
    /// One sentence of the assistant's reply.
    Answer(String),
    AnswerStop,
    AudioStart,
    /// No downlink audio arrived for the playback timeout.
    AudioStop,
    Emotion(String),
    EmotionText(String),
    /// Raw tool protocol payload as received.
    ToolProtocol(Value),
    Provisioned(Arc<OtaResponse>),
    ProvisioningFailed(String),
    StateChanged { from: TurnState, to: TurnState },
    Connected { endpoint: String },
    Disconnected { reason: Option<String> },
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}
