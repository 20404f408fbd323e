use std::fs;
use std::path::Path;
use uuid::Uuid;

pub const APP_NAME: &str = "xiaozhi-edge-rs";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity headers sent with provisioning and session requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// MAC address style identifier, stable across runs on the same host.
    pub device_id: String,
    /// Random per process.
    pub client_id: String,
    pub user_agent: String,
    pub version: String,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            client_id: client_id.into(),
            user_agent: user_agent(),
            version: APP_VERSION.to_string(),
        }
    }

    /// Build an identity from the host's first hardware address, or a random
    /// locally administered one when none can be read.
    pub fn detect(device_id_override: Option<&str>) -> Self {
        let device_id = match device_id_override {
            Some(id) => id.to_string(),
            None => mac_address().unwrap_or_else(|| {
                let generated = random_mac();
                log::warn!(
                    "⚠️ No hardware address found, using generated device id {}",
                    generated
                );
                generated
            }),
        };
        Self::new(device_id, generate_client_id())
    }
}

pub fn user_agent() -> String {
    format!("{}/{}", APP_NAME, APP_VERSION)
}

pub fn generate_client_id() -> String {
    Uuid::new_v4().to_string()
}

/// First non-loopback interface address from sysfs, lowercased.
pub fn mac_address() -> Option<String> {
    mac_address_from(Path::new("/sys/class/net"))
}

fn mac_address_from(net_dir: &Path) -> Option<String> {
    let mut interfaces: Vec<_> = fs::read_dir(net_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() != "lo")
        .collect();
    interfaces.sort_by_key(|entry| entry.file_name());

    interfaces.iter().find_map(|entry| {
        let address = fs::read_to_string(entry.path().join("address")).ok()?;
        let address = address.trim().to_lowercase();
        if is_usable_mac(&address) {
            Some(address)
        } else {
            None
        }
    })
}

fn is_usable_mac(address: &str) -> bool {
    let octets: Vec<&str> = address.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
        && address != "00:00:00:00:00:00"
}

fn random_mac() -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    // Locally administered, unicast
    let first = (bytes[0] & 0xfc) | 0x02;
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        first, bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}
