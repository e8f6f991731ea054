//! Device types for tracking discovered recorders

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Default HTTP port advertised by the recorder firmware
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// How a device was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    /// Found by an mDNS service browse
    Mdns,
    /// Listed in the configuration file
    Static,
}

/// A recorder reachable over HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Instance name (mDNS instance or configured name)
    pub name: String,
    /// IP address of the device
    pub address: IpAddr,
    /// HTTP port of the control API
    pub port: u16,
    /// How the device was discovered
    pub method: DiscoveryMethod,
    /// When the device was seen by the scan that produced it
    pub seen_at: DateTime<Utc>,
}

impl Device {
    /// Create a new device found by mDNS
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            address,
            port,
            method: DiscoveryMethod::Mdns,
            seen_at: Utc::now(),
        }
    }

    /// Create a device from static configuration
    pub fn configured(name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            method: DiscoveryMethod::Static,
            ..Self::new(name, address, port)
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Base URL of the device's control API, without trailing slash
    pub fn base_url(&self) -> String {
        match self.address {
            IpAddr::V4(ip) => format!("http://{}:{}", ip, self.port),
            IpAddr::V6(ip) => format!("http://[{}]:{}", ip, self.port),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// A recording stored on the device's SD card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingFile {
    pub name: String,
    /// Size as reported by the device, e.g. "1.2 MB"
    pub size: Option<String>,
}

impl RecordingFile {
    /// Parse the `/list` body: one `name - size` record per line.
    ///
    /// Blank lines are skipped and a record without ` - ` keeps its whole
    /// line as the name with an unknown size.
    pub fn parse_listing(body: &str) -> Vec<RecordingFile> {
        body.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| match line.split_once(" - ") {
                Some((name, size)) => RecordingFile {
                    name: name.trim().to_string(),
                    size: Some(size.trim().to_string()).filter(|s| !s.is_empty()),
                },
                None => RecordingFile {
                    name: line.to_string(),
                    size: None,
                },
            })
            .collect()
    }
}

/// Device information served at `GET /`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    #[serde(rename = "Device Name")]
    pub device_name: String,
    #[serde(rename = "Firmware Version", default)]
    pub firmware_version: Option<String>,
    #[serde(rename = "Serial Number", default)]
    pub serial_number: Option<String>,
    #[serde(rename = "SSID Name", default)]
    pub ssid: Option<String>,
}

/// Metadata body, parsed when it is the expected JSON and kept raw otherwise
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum MetadataResponse {
    Parsed(DeviceMetadata),
    Fallback(String),
}

impl MetadataResponse {
    pub fn parse(body: &str) -> Self {
        match serde_json::from_str::<DeviceMetadata>(body) {
            Ok(meta) => Self::Parsed(meta),
            Err(e) => {
                tracing::debug!(error = %e, "Device metadata is not JSON, keeping raw text");
                Self::Fallback(body.to_string())
            }
        }
    }
}
