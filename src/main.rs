use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretBox;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use xiaozhi_edge_rs::audio::{AudioPort, CpalAudioPort, CpalPortConfig};
use xiaozhi_edge_rs::codec::CodecAdapter;
use xiaozhi_edge_rs::identity::{DeviceIdentity, APP_NAME, APP_VERSION};
use xiaozhi_edge_rs::mcp::McpToolHandler;
use xiaozhi_edge_rs::protocol::ListenMode;
use xiaozhi_edge_rs::{Agent, AgentConfig, AgentEvent, TurnState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Provisioning (OTA) endpoint
    #[arg(long)]
    ota_url: Option<String>,

    /// Session WebSocket endpoint used when provisioning gives none
    #[arg(long)]
    ws_url: Option<String>,

    /// Bearer token used when provisioning gives none
    #[arg(long)]
    token: Option<String>,

    /// Device id, defaults to the host's hardware address
    #[arg(long)]
    device_id: Option<String>,

    /// Run without microphone and speaker
    #[arg(long)]
    no_audio: bool,

    /// Do not expose local tools to the server
    #[arg(long)]
    no_mcp: bool,

    /// Consecutive silent buffers before auto listening stops
    #[arg(long)]
    vad_threshold: Option<u32>,
}

impl Args {
    fn apply(self, config: &mut AgentConfig) {
        if let Some(url) = self.ota_url {
            config.ota_url = url;
        }
        if let Some(url) = self.ws_url {
            config.ws_url = url;
        }
        if let Some(token) = self.token {
            config.token = SecretBox::new(Box::new(token));
        }
        if let Some(device_id) = self.device_id {
            config.device_id = Some(device_id);
        }
        if self.no_audio {
            config.audio_enabled = false;
        }
        if self.no_mcp {
            config.mcp_enabled = false;
        }
        if let Some(threshold) = self.vad_threshold {
            config.vad_threshold = threshold;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    log::info!("🚀 Initializing {} {}", APP_NAME, APP_VERSION);

    let mut config = AgentConfig::from_env().context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let identity = DeviceIdentity::detect(config.device_id.as_deref());
    log::info!(
        "🆔 Device {} / client {}",
        identity.device_id,
        identity.client_id
    );

    let audio_enabled = config.audio_enabled;
    let mcp_enabled = config.mcp_enabled;
    let port_config =
        CpalPortConfig::from_settings(&config.audio, config.playback_capacity_bytes);

    let mut agent = Agent::new(config, identity).with_codec(CodecAdapter::preferred());
    if audio_enabled {
        match CpalAudioPort::new(port_config) {
            Ok(port) => agent = agent.with_audio(Arc::new(port) as Arc<dyn AudioPort>),
            Err(e) => log::warn!("⚠️ Audio unavailable, continuing without it: {}", e),
        }
    }
    if mcp_enabled {
        let tools = McpToolHandler::new(APP_NAME, APP_VERSION);
        log::info!("🔧 Local tools: {}", tools.tool_names().join(", "));
        agent = agent.with_tool_handler(Arc::new(tools));
    }
    let agent = Arc::new(agent);

    let printer = tokio::spawn(print_events(agent.subscribe()));

    if let Err(e) = agent.start().await {
        log::error!("❌ Initial connection failed, the supervisor will retry: {}", e);
    }
    agent.spawn_supervisor();

    println!("🎧 Ready.");
    println!("   Type a message and press Enter to chat");
    println!("   Empty line toggles auto listening, /rec toggles manual recording");
    println!("   /abort interrupts the assistant, restart reconnects, quit exits");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_command(&agent, line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("🛑 Ctrl+C received");
                break;
            }
        }
    }

    agent.shutdown().await;
    printer.abort();
    Ok(())
}

/// Run one console command. Returns false when the user asked to quit.
async fn handle_command(agent: &Agent, line: &str) -> bool {
    match line {
        "quit" | "exit" => return false,
        "restart" => {
            if let Err(e) = agent.restart().await {
                println!("❌ Restart failed: {}", e);
            }
        }
        "/abort" => agent.abort().await,
        "/rec" => toggle_listening(agent, ListenMode::Manual).await,
        "" => toggle_listening(agent, ListenMode::Auto).await,
        text => agent.chat_message(text).await,
    }
    true
}

async fn toggle_listening(agent: &Agent, mode: ListenMode) {
    if agent.turn_state().await.is_listening() {
        agent.stop_listening().await;
        println!("🔇 Recording stopped");
    } else if let Err(e) = agent.start_listening(mode).await {
        println!("❌ Cannot start recording: {}", e);
    } else if agent.turn_state().await.is_listening() {
        println!("🎤 Recording ({})", mode);
    }
}

async fn print_events(mut events: broadcast::Receiver<AgentEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match event {
                AgentEvent::Question(text) => println!("[question] {}", text),
                AgentEvent::Answer(text) => println!("[answer] {}", text),
                AgentEvent::Emotion(emotion) if !emotion.is_empty() => {
                    println!("[emotion] {}", emotion)
                }
                AgentEvent::EmotionText(text) if !text.is_empty() => {
                    println!("[emotion_text] {}", text)
                }
                AgentEvent::ToolProtocol(payload) => println!("[mcp] {}", payload),
                AgentEvent::Provisioned(ota) => {
                    if let Some(activation) = &ota.activation {
                        println!("[activation] {}", activation.message);
                    }
                }
                AgentEvent::Connected { endpoint } => println!("✅ Connected to {}", endpoint),
                AgentEvent::Disconnected { reason } => println!(
                    "🔌 Disconnected: {}",
                    reason.unwrap_or_else(|| "connection lost".to_string())
                ),
                AgentEvent::StateChanged {
                    to: TurnState::Idle,
                    ..
                } => log::debug!("Back to idle"),
                other => log::debug!("Event: {}", other.name()),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("⚠️ Event printer lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
