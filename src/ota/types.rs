use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder firmware hash reported by clients that are not flashed images.
pub const DEFAULT_ELF_SHA256: &str =
    "c8a8ecb6d6fbcda682494d9675cd1ead240ecf38bdde75282a42365a0e396033";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OtaRequest {
    pub application: ApplicationInfo,
    pub mac_address: String,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chip_model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psram_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_table: Option<Vec<PartitionInfo>>,
    pub board: BoardInfo,
    pub version: u32,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_free_heap_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationInfo {
    pub name: String,
    pub version: String,
    pub elf_sha256: String,
    pub compile_time: String,
    pub idf_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionInfo {
    pub label: String,
    #[serde(rename = "type")]
    pub partition_type: u32,
    pub subtype: u32,
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BoardInfo {
    #[serde(rename = "type")]
    pub board_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

/// Network details reported by the wifi flavoured request.
#[derive(Debug, Clone, PartialEq)]
pub struct WifiInfo {
    pub ssid: String,
    pub rssi: i32,
    pub channel: u32,
    pub ip: String,
}

impl Default for WifiInfo {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            rssi: -50,
            channel: 1,
            ip: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OtaResponse {
    #[serde(default)]
    pub activation: Option<ActivationInfo>,
    #[serde(default)]
    pub mqtt: Option<MqttInfo>,
    #[serde(default)]
    pub websocket: Option<WebSocketInfo>,
    #[serde(default)]
    pub server_time: Option<ServerTimeInfo>,
    #[serde(default)]
    pub firmware: Option<FirmwareInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ActivationInfo {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MqttInfo {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub publish_topic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WebSocketInfo {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerTimeInfo {
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub timezone: Option<String>,
    /// Minutes east of UTC.
    #[serde(default)]
    pub timezone_offset: Option<i32>,
}

impl ServerTimeInfo {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FirmwareInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtaErrorResponse {
    pub error: String,
}

impl OtaResponse {
    /// Session endpoint override, when the server provided a usable one.
    pub fn websocket_url(&self) -> Option<&str> {
        self.websocket
            .as_ref()
            .map(|ws| ws.url.trim())
            .filter(|url| !url.is_empty())
    }

    pub fn websocket_token(&self) -> Option<&str> {
        self.websocket
            .as_ref()
            .map(|ws| ws.token.trim())
            .filter(|token| !token.is_empty())
    }

    pub fn log_summary(&self) {
        if let Some(activation) = &self.activation {
            log::info!(
                "🔑 Activation code: {} ({})",
                activation.code,
                activation.message
            );
        }
        if let Some(firmware) = &self.firmware {
            log::info!("📦 Firmware {} at {}", firmware.version, firmware.url);
        }
        if let Some(time) = &self.server_time {
            match time.to_datetime() {
                Some(at) => log::info!(
                    "🕒 Server time {} ({})",
                    at.format("%Y-%m-%d %H:%M:%S UTC"),
                    time.timezone.as_deref().unwrap_or("no timezone")
                ),
                None => log::debug!("Server time out of range: {}", time.timestamp),
            }
        }
        if let Some(mqtt) = &self.mqtt {
            log::info!("📡 MQTT endpoint {}", mqtt.endpoint);
        }
        match self.websocket_url() {
            Some(url) => log::info!("🔌 WebSocket endpoint {}", url),
            None => log::info!("🔌 No WebSocket endpoint provided"),
        }
    }
}
