use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::codec::FrameSpec;

pub const DEFAULT_OTA_URL: &str = "https://api.tenclass.net/xiaozhi/ota/";
pub const DEFAULT_WS_URL: &str = "wss://api.tenclass.net/xiaozhi/v1/";
pub const DEFAULT_TOKEN: &str = "test-token";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
    #[error("Invalid URL for {var}: {reason}")]
    InvalidUrl { var: String, reason: String },
    #[error("Failed to load env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
}

/// What `abort` does to a capture that is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AbortPolicy {
    /// Only tell the server to stop speaking. The microphone keeps streaming.
    #[default]
    KeepCapture,
    /// Also stop local capture and return to idle.
    StopCapture,
}

/// PCM layout of both audio directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSettings {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            channels: 1,
            frame_duration_ms: 60,
        }
    }
}

impl AudioSettings {
    pub fn uplink(&self) -> FrameSpec {
        FrameSpec::new(self.input_sample_rate, self.channels, self.frame_duration_ms)
    }

    pub fn downlink(&self) -> FrameSpec {
        FrameSpec::new(self.output_sample_rate, self.channels, self.frame_duration_ms)
    }
}

/// Everything the agent needs to run one session, passed in explicitly.
#[derive(Debug)]
pub struct AgentConfig {
    pub ota_url: String,
    pub ws_url: String,
    pub token: SecretBox<String>,
    pub device_id: Option<String>,
    pub language: String,
    pub audio_enabled: bool,
    pub mcp_enabled: bool,
    pub audio: AudioSettings,
    /// Consecutive silent capture buffers before auto mode stops listening.
    pub vad_threshold: u32,
    pub vad_poll_interval: Duration,
    pub playback_timeout: Duration,
    pub playback_capacity_bytes: usize,
    pub abort_policy: AbortPolicy,
    pub connect_timeout: Duration,
    pub reconnect_poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub event_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let audio = AudioSettings::default();
        Self {
            ota_url: DEFAULT_OTA_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            token: SecretBox::new(Box::new(DEFAULT_TOKEN.to_string())),
            device_id: None,
            language: "zh-CN".to_string(),
            audio_enabled: true,
            mcp_enabled: true,
            audio,
            vad_threshold: 20,
            vad_poll_interval: Duration::from_millis(100),
            playback_timeout: Duration::from_millis(500),
            // Ten seconds of downlink audio
            playback_capacity_bytes: audio.output_sample_rate as usize * 2 * 10,
            abort_policy: AbortPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            reconnect_poll_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

impl AgentConfig {
    /// Load configuration from `XIAOZHI_*` environment variables, reading a
    /// `.env` file first if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars()
    }

    /// Load configuration from a specific env file plus the process environment.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::from_path(path.as_ref())?;
        Self::from_vars()
    }

    fn from_vars() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = read_var("XIAOZHI_OTA_URL") {
            config.ota_url = url;
        }
        if let Some(url) = read_var("XIAOZHI_WS_URL") {
            config.ws_url = url;
        }
        if let Some(token) = read_var("XIAOZHI_TOKEN") {
            config.token = SecretBox::new(Box::new(token));
        }
        config.device_id = read_var("XIAOZHI_DEVICE_ID");
        if let Some(language) = read_var("XIAOZHI_LANGUAGE") {
            config.language = language;
        }
        if let Some(value) = read_var("XIAOZHI_AUDIO") {
            config.audio_enabled = parse_flag("XIAOZHI_AUDIO", &value)?;
        }
        if let Some(value) = read_var("XIAOZHI_MCP") {
            config.mcp_enabled = parse_flag("XIAOZHI_MCP", &value)?;
        }
        if let Some(value) = read_var("XIAOZHI_VAD_THRESHOLD") {
            config.vad_threshold = parse_value("XIAOZHI_VAD_THRESHOLD", &value)?;
        }
        if let Some(value) = read_var("XIAOZHI_PLAYBACK_TIMEOUT_MS") {
            let millis: u64 = parse_value("XIAOZHI_PLAYBACK_TIMEOUT_MS", &value)?;
            config.playback_timeout = Duration::from_millis(millis);
        }
        if let Some(value) = read_var("XIAOZHI_ABORT_POLICY") {
            config.abort_policy = parse_value("XIAOZHI_ABORT_POLICY", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that both endpoints are usable URLs with the expected schemes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("ota_url", &self.ota_url, &["http", "https"])?;
        validate_url("ws_url", &self.ws_url, &["ws", "wss"])?;
        if self.vad_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                var: "vad_threshold".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Get the configured bearer token (use only when opening a session)
    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }
}

fn read_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_flag(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            var: var.to_string(),
            reason: format!("expected a boolean, got '{}'", other),
        }),
    }
}

fn parse_value<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        var: var.to_string(),
        reason: e.to_string(),
    })
}

fn validate_url(var: &str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = url::Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        var: var.to_string(),
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            var: var.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(())
}
