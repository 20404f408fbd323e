use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::protocol::ControlMessage;
use crate::transport::SessionSink;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Receives tool protocol payloads from the server.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Handle one payload. `Some(reply)` is sent back to the server.
    async fn handle(&self, payload: Value) -> Result<Option<Value>, HandlerError>;
}

/// Hands tool payloads to the handler off the receive path and sends replies
/// back on the same session.
#[derive(Clone)]
pub struct ControlRouter {
    handler: Option<Arc<dyn ToolHandler>>,
    sink: Arc<dyn SessionSink>,
}

impl ControlRouter {
    pub fn new(handler: Option<Arc<dyn ToolHandler>>, sink: Arc<dyn SessionSink>) -> Self {
        Self { handler, sink }
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Spawn the handler for `payload`. Returns the task so callers may wait
    /// for it; the receive loop never does.
    pub fn dispatch(&self, payload: Value) -> Option<JoinHandle<()>> {
        let Some(handler) = self.handler.clone() else {
            log::debug!("No tool handler registered, ignoring mcp payload");
            return None;
        };
        let sink = Arc::clone(&self.sink);

        Some(tokio::spawn(async move {
            match handler.handle(payload).await {
                Ok(Some(reply)) if !is_empty_reply(&reply) => {
                    // Session id is read now, not when the request arrived
                    sink.send(&ControlMessage::Mcp { payload: reply }).await;
                }
                Ok(_) => log::debug!("Tool handler produced no reply"),
                Err(e) => log::warn!("⚠️ Tool handler failed: {}", e),
            }
        }))
    }
}

fn is_empty_reply(reply: &Value) -> bool {
    match reply {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Sink that records what would have been sent.
    pub struct RecordingSink {
        pub session_id: Mutex<String>,
        pub messages: Mutex<Vec<Value>>,
        pub audio: Mutex<Vec<Vec<u8>>>,
        pub open: AtomicBool,
    }

    impl RecordingSink {
        pub fn new(session_id: &str) -> Arc<Self> {
            Arc::new(Self {
                session_id: Mutex::new(session_id.to_string()),
                messages: Mutex::new(Vec::new()),
                audio: Mutex::new(Vec::new()),
                open: AtomicBool::new(true),
            })
        }

        pub fn messages(&self) -> Vec<Value> {
            self.messages.lock().unwrap().clone()
        }

        pub fn audio_frames(&self) -> Vec<Vec<u8>> {
            self.audio.lock().unwrap().clone()
        }

        pub fn count_listen(&self, state: &str) -> usize {
            self.messages()
                .iter()
                .filter(|m| m["type"] == "listen" && m["state"] == state)
                .count()
        }
    }

    #[async_trait]
    impl SessionSink for RecordingSink {
        async fn send(&self, message: &ControlMessage) {
            if !self.is_open() {
                return;
            }
            let value = message.to_json(&self.session_id());
            self.messages.lock().unwrap().push(value);
        }

        async fn send_audio(&self, frame: Vec<u8>) {
            if self.is_open() && !frame.is_empty() {
                self.audio.lock().unwrap().push(frame);
            }
        }

        fn session_id(&self) -> String {
            self.session_id.lock().unwrap().clone()
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }
    }
}
