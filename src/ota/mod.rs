//! One-shot provisioning exchange ("OTA check") that resolves the session
//! endpoint and token before a session is opened.

mod types;

pub use types::*;

use std::time::Duration;
use thiserror::Error;

use crate::identity::DeviceIdentity;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Provisioning server unreachable: {0}")]
    Unreachable(String),
    #[error("Provisioning rejected with status {status}: {reason}")]
    ServerRejected { status: u16, reason: String },
    #[error("Malformed provisioning response: {0}")]
    MalformedResponse(String),
}

pub struct OtaClient {
    client: reqwest::Client,
    url: String,
    identity: DeviceIdentity,
    language: String,
}

impl OtaClient {
    pub fn new(
        url: impl Into<String>,
        identity: DeviceIdentity,
        language: impl Into<String>,
    ) -> Result<Self, ProvisioningError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProvisioningError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            identity,
            language: language.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request describing this client as a plain device.
    pub fn default_request(&self, version: &str) -> OtaRequest {
        OtaRequest {
            application: ApplicationInfo {
                name: "xiaozhi".to_string(),
                version: version.to_string(),
                elf_sha256: DEFAULT_ELF_SHA256.to_string(),
                compile_time: format!("{}Z", chrono::Utc::now().format("%b %d %Y %H:%M:%S")),
                idf_version: format!("rust-{}", env!("CARGO_PKG_VERSION")),
            },
            mac_address: self.identity.device_id.clone(),
            uuid: self.identity.client_id.clone(),
            chip_model_name: None,
            flash_size: None,
            psram_size: None,
            partition_table: None,
            board: BoardInfo {
                board_type: "xiaozhi-edge-rs".to_string(),
                name: "xiaozhi-edge-rs-client".to_string(),
                mac: Some(self.identity.device_id.clone()),
                ..Default::default()
            },
            version: 2,
            language: self.language.clone(),
            minimum_free_heap_size: None,
        }
    }

    /// Request that also reports the network the device is on.
    pub fn wifi_request(&self, version: &str, wifi: &WifiInfo) -> OtaRequest {
        let mut request = self.default_request(version);
        request.board.board_type = "xiaozhi-edge-rs-wifi".to_string();
        request.board.name = "xiaozhi-edge-rs-wifi-client".to_string();
        request.board.ssid = Some(wifi.ssid.clone());
        request.board.rssi = Some(wifi.rssi);
        request.board.channel = Some(wifi.channel);
        request.board.ip = Some(wifi.ip.clone());
        request
    }

    /// Build the request for `current_version` and run the check.
    pub async fn check_version(
        &self,
        current_version: &str,
        wifi: Option<&WifiInfo>,
    ) -> Result<OtaResponse, ProvisioningError> {
        let request = match wifi {
            Some(wifi) => self.wifi_request(current_version, wifi),
            None => self.default_request(current_version),
        };
        self.check(&request).await
    }

    /// POST the request and parse the answer. No retries.
    pub async fn check(&self, request: &OtaRequest) -> Result<OtaResponse, ProvisioningError> {
        log::info!("🔄 Checking provisioning at {}", self.url);
        log::debug!(
            "OTA request: {}",
            serde_json::to_string(request).unwrap_or_default()
        );

        let response = self
            .client
            .post(&self.url)
            .header("Device-Id", &self.identity.device_id)
            .header("Client-Id", &self.identity.client_id)
            .header("User-Agent", &self.identity.user_agent)
            .header("Accept-Language", &self.language)
            .json(request)
            .send()
            .await
            .map_err(|e| ProvisioningError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProvisioningError::Unreachable(e.to_string()))?;
        log::debug!("OTA response {}: {}", status, body);

        if status.is_success() {
            let parsed: OtaResponse = serde_json::from_str(&body)
                .map_err(|e| ProvisioningError::MalformedResponse(e.to_string()))?;
            log::info!("✅ Provisioning check succeeded");
            Ok(parsed)
        } else {
            let reason = match serde_json::from_str::<OtaErrorResponse>(&body) {
                Ok(error) => error.error,
                Err(_) => body,
            };
            Err(ProvisioningError::ServerRejected {
                status: status.as_u16(),
                reason,
            })
        }
    }
}
