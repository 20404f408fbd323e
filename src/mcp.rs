//! Local tools exposed to the server over MCP.
//!
//! The tools run as an rmcp server on an in-process duplex stream and are
//! reached through an rmcp client on the other end. The server's
//! `initialize` is answered here directly, since the in-process pair has
//! already done its own handshake.

use async_trait::async_trait;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ErrorCode, Implementation, ProtocolVersion,
    ServerCapabilities, ServerInfo,
};
use rmcp::service::{RoleClient, RunningService, ServiceError};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use crate::router::{HandlerError, ToolHandler};

const DUPLEX_BUFFER: usize = 4096;

/// A switchable light, enough to try the tool path end to end.
pub struct LightTools {
    implementation: Implementation,
    lit: Arc<AtomicBool>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl LightTools {
    pub fn new(implementation: Implementation, lit: Arc<AtomicBool>) -> Self {
        Self {
            implementation,
            lit,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(name = "self.light.turn_on", description = "Turn on the light")]
    async fn turn_on(&self) -> Result<CallToolResult, McpError> {
        self.lit.store(true, Ordering::Release);
        log::info!("💡 Light on");
        Ok(CallToolResult::success(vec![Content::text("Light turned on")]))
    }

    #[tool(name = "self.light.turn_off", description = "Turn off the light")]
    async fn turn_off(&self) -> Result<CallToolResult, McpError> {
        self.lit.store(false, Ordering::Release);
        log::info!("💡 Light off");
        Ok(CallToolResult::success(vec![Content::text("Light turned off")]))
    }
}

#[tool_handler]
impl ServerHandler for LightTools {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: self.implementation.clone(),
            instructions: Some("Controls for the device running the voice client.".into()),
            ..Default::default()
        }
    }
}

/// Vision service the server advertises during `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionEndpoint {
    pub url: String,
    pub token: String,
}

pub struct McpToolHandler {
    implementation: Implementation,
    lit: Arc<AtomicBool>,
    client: OnceCell<RunningService<RoleClient, ()>>,
    vision: Mutex<Option<VisionEndpoint>>,
}

impl McpToolHandler {
    pub fn new(server_name: &str, server_version: &str) -> Self {
        Self {
            implementation: Implementation {
                name: server_name.to_string(),
                version: server_version.to_string(),
                ..Default::default()
            },
            lit: Arc::new(AtomicBool::new(false)),
            client: OnceCell::new(),
            vision: Mutex::new(None),
        }
    }

    fn tools(&self) -> LightTools {
        LightTools::new(self.implementation.clone(), Arc::clone(&self.lit))
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools()
            .tool_router
            .list_all()
            .into_iter()
            .map(|tool| tool.name.to_string())
            .collect();
        names.sort();
        names
    }

    pub fn is_lit(&self) -> bool {
        self.lit.load(Ordering::Acquire)
    }

    pub fn vision(&self) -> Option<VisionEndpoint> {
        self.vision
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Client side of the in-process link, started on first use.
    async fn client(&self) -> Result<&RunningService<RoleClient, ()>, McpError> {
        self.client
            .get_or_try_init(|| async {
                let (server_io, client_io) = tokio::io::duplex(DUPLEX_BUFFER);
                let tools = self.tools();
                tokio::spawn(async move {
                    match tools.serve(server_io).await {
                        Ok(service) => {
                            let _ = service.waiting().await;
                        }
                        Err(e) => log::error!("❌ Local tool server failed to start: {}", e),
                    }
                });
                log::debug!("Connecting to local tool server");
                ().serve(client_io)
                    .await
                    .map_err(|e| McpError::internal_error(e.to_string(), None))
            })
            .await
    }

    fn initialize(&self, params: &Value) -> Result<Value, McpError> {
        if let Some(vision) = params.pointer("/capabilities/vision") {
            let endpoint = VisionEndpoint {
                url: vision["url"].as_str().unwrap_or_default().to_string(),
                token: vision["token"].as_str().unwrap_or_default().to_string(),
            };
            log::info!("👁️ Vision endpoint: {}", endpoint.url);
            *self.vision.lock().unwrap_or_else(|p| p.into_inner()) = Some(endpoint);
        }
        to_json(&self.tools().get_info())
    }

    async fn list_tools(&self) -> Result<Value, McpError> {
        let client = self.client().await?;
        let tools = client
            .peer()
            .list_tools(Default::default())
            .await
            .map_err(service_error)?;
        to_json(&tools)
    }

    async fn call_tool(&self, params: Value) -> Result<Value, McpError> {
        let request: CallToolRequestParam = serde_json::from_value(params)
            .map_err(|e| McpError::invalid_params(format!("bad tools/call params: {}", e), None))?;
        log::info!("🔧 Calling tool {}", request.name);
        let client = self.client().await?;
        let result = client
            .peer()
            .call_tool(request)
            .await
            .map_err(service_error)?;
        to_json(&result)
    }
}

fn service_error(error: ServiceError) -> McpError {
    match error {
        ServiceError::McpError(error) => error,
        other => McpError::internal_error(other.to_string(), None),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::internal_error(e.to_string(), None))
}

#[async_trait]
impl ToolHandler for McpToolHandler {
    async fn handle(&self, payload: Value) -> Result<Option<Value>, HandlerError> {
        let method = payload["method"]
            .as_str()
            .ok_or_else(|| HandlerError::InvalidRequest("missing method".to_string()))?;
        let params = payload.get("params").cloned().unwrap_or(Value::Null);

        // Notifications carry no id and get no answer
        let Some(id) = payload.get("id").cloned() else {
            log::debug!("MCP notification: {}", method);
            return Ok(None);
        };

        let outcome = match method {
            "initialize" => self.initialize(&params),
            "tools/list" => self.list_tools().await,
            "tools/call" => self.call_tool(params).await,
            other => Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("method not found: {}", other),
                None,
            )),
        };

        let reply = match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(error) => {
                log::warn!("⚠️ MCP {} failed: {}", method, error.message);
                json!({ "jsonrpc": "2.0", "id": id, "error": error })
            }
        };
        Ok(Some(reply))
    }
}
