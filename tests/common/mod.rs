//! Local stand-ins for the provisioning endpoint and the session server.

#![allow(dead_code)]

use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub const WAIT: Duration = Duration::from_secs(5);

/// One HTTP request as seen by the fake server. Header names are lowercase.
#[derive(Debug)]
pub struct CapturedRequest {
    pub request_line: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl CapturedRequest {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

#[derive(Clone)]
struct OtaStub {
    status: StatusCode,
    body: String,
    captured: Arc<Mutex<Option<oneshot::Sender<CapturedRequest>>>>,
}

async fn ota_handler(
    State(stub): State<OtaStub>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let captured = CapturedRequest {
        request_line: format!("{} {}", method, uri),
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
        body,
    };
    if let Some(tx) = stub.captured.lock().unwrap().take() {
        let _ = tx.send(captured);
    }
    (
        stub.status,
        [(header::CONTENT_TYPE, "application/json")],
        stub.body,
    )
}

/// Answer provisioning requests with `status` and `body`. The first request
/// is handed back through the receiver.
pub async fn serve_http_once(
    status: u16,
    body: &str,
) -> (String, oneshot::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    let stub = OtaStub {
        status: StatusCode::from_u16(status).unwrap(),
        body: body.to_string(),
        captured: Arc::new(Mutex::new(Some(tx))),
    };
    let app = Router::new()
        .route("/xiaozhi/ota/", post(ota_handler))
        .with_state(stub);

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (format!("http://{}/xiaozhi/ota/", addr), rx)
}

/// A session accepted by [`WsServer`], with the handshake headers it sent.
pub struct WsConnection {
    pub headers: HashMap<String, String>,
    stream: WebSocketStream<TcpStream>,
}

impl WsConnection {
    pub async fn next_message(&mut self) -> Message {
        loop {
            let message = tokio::time::timeout(WAIT, self.stream.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection ended")
                .unwrap();
            if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
                return message;
            }
        }
    }

    /// Next control message. Binary frames in between are skipped.
    pub async fn next_json(&mut self) -> Value {
        loop {
            match self.next_message().await {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Binary(_) => continue,
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.stream
            .send(Message::Text(text.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn send_binary(&mut self, data: Vec<u8>) {
        self.stream.send(Message::Binary(data.into())).await.unwrap();
    }

    pub async fn close(&mut self) {
        self.stream.close(None).await.ok();
    }
}

pub struct WsServer {
    pub url: String,
    connections: mpsc::Receiver<WsConnection>,
}

impl WsServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::channel(4);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let captured = Arc::new(Mutex::new(HashMap::new()));
                let sink = Arc::clone(&captured);
                let callback = move |request: &Request, response: Response| {
                    let mut headers = sink.lock().unwrap();
                    for (name, value) in request.headers() {
                        headers.insert(
                            name.as_str().to_lowercase(),
                            value.to_str().unwrap_or_default().to_string(),
                        );
                    }
                    Ok::<Response, ErrorResponse>(response)
                };
                let Ok(stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };
                let headers = captured.lock().unwrap().clone();
                if tx.send(WsConnection { headers, stream }).await.is_err() {
                    break;
                }
            }
        });

        Self {
            url: format!("ws://{}/xiaozhi/v1/", addr),
            connections,
        }
    }

    pub async fn accept(&mut self) -> WsConnection {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a session")
            .expect("server stopped")
    }
}

/// A provisioning URL nothing listens on.
pub const UNREACHABLE_OTA: &str = "http://127.0.0.1:1/xiaozhi/ota/";
