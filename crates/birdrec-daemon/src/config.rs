//! Configuration loading and validation

use anyhow::{anyhow, Context, Result};
use birdrec_core::{parse_utc_offset, Device, DEFAULT_HTTP_PORT};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default, rename = "device_static")]
    pub static_devices: Vec<StaticDeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the control API
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Where the device list comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    #[default]
    Mdns,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub mode: DiscoveryMode,
    /// mDNS service type to browse
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Time between scans
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// How long each mDNS browse listens
    #[serde(default = "default_listen_window")]
    pub listen_window_secs: u64,
    /// Only register instances whose name starts with this
    #[serde(default)]
    pub name_prefix: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::default(),
            service_type: default_service_type(),
            interval_secs: default_interval(),
            listen_window_secs: default_listen_window(),
            name_prefix: None,
        }
    }
}

fn default_service_type() -> String {
    birdrec_discovery::DEFAULT_SERVICE_TYPE.to_string()
}

fn default_interval() -> u64 {
    10
}

fn default_listen_window() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Per-request timeout for device calls
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Where downloaded recordings are written
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            download_dir: default_download_dir(),
        }
    }
}

fn default_timeout() -> u64 {
    10
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// How often the schedule compares entries with the clock
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// `+HH:MM`, `-HH:MM`, `utc` or `local`
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            utc_offset: default_utc_offset(),
        }
    }
}

fn default_poll_interval() -> u64 {
    10
}

fn default_utc_offset() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Interpreter or executable to launch
    #[serde(default = "default_program")]
    pub program: String,
    /// Script passed as the first argument; empty to pass none
    #[serde(default = "default_script")]
    pub script: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    /// -1 lets the analyzer ignore location
    #[serde(default = "default_coordinate")]
    pub latitude: f64,
    #[serde(default = "default_coordinate")]
    pub longitude: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            script: default_script(),
            output_format: default_output_format(),
            min_confidence: default_min_confidence(),
            sensitivity: default_sensitivity(),
            latitude: default_coordinate(),
            longitude: default_coordinate(),
        }
    }
}

fn default_program() -> String {
    "python".to_string()
}

fn default_script() -> String {
    "Birdnet-Analyzer/analyze.py".to_string()
}

fn default_output_format() -> String {
    "csv".to_string()
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_sensitivity() -> f64 {
    1.0
}

fn default_coordinate() -> f64 {
    -1.0
}

/// A recorder listed by hand, used with `discovery.mode = "static"`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticDeviceConfig {
    pub name: String,
    pub address: IpAddr,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.device.timeout_secs.max(1))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.interval_secs.max(1))
    }

    pub fn listen_window(&self) -> Duration {
        Duration::from_secs(self.discovery.listen_window_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.poll_interval_secs.max(1))
    }

    /// The fixed offset the schedule compares times in
    pub fn utc_offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.schedule.utc_offset)
            .ok_or_else(|| anyhow!("invalid schedule.utc_offset '{}'", self.schedule.utc_offset))
    }

    pub fn static_devices(&self) -> Vec<Device> {
        self.static_devices
            .iter()
            .map(|d| Device::configured(d.name.clone(), d.address, d.port))
            .collect()
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        config
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Config::default()
    };

    // Fail at startup rather than on the first schedule poll
    config.utc_offset()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.daemon.bind, "0.0.0.0:8080");
        assert_eq!(config.discovery.mode, DiscoveryMode::Mdns);
        assert_eq!(config.discovery.service_type, "_http._tcp.local.");
        assert_eq!(config.scan_interval(), Duration::from_secs(10));
        assert_eq!(config.listen_window(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.analyzer.min_confidence, 0.5);
        assert!(config.utc_offset().is_ok());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.discovery.interval_secs, 10);
    }

    #[test]
    fn test_load_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[daemon]
bind = "127.0.0.1:9000"

[discovery]
mode = "static"
name_prefix = "ESPREC"

[schedule]
utc_offset = "+07:00"
poll_interval_secs = 5

[analyzer]
sensitivity = 1.25

[[device_static]]
name = "field-a"
address = "192.168.4.20"

[[device_static]]
name = "field-b"
address = "192.168.4.21"
port = 8080
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.daemon.bind, "127.0.0.1:9000");
        assert_eq!(config.discovery.mode, DiscoveryMode::Static);
        assert_eq!(config.discovery.name_prefix.as_deref(), Some("ESPREC"));
        assert_eq!(config.discovery.listen_window_secs, 5);
        assert_eq!(config.utc_offset().unwrap(), FixedOffset::east_opt(7 * 3600).unwrap());
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.analyzer.sensitivity, 1.25);
        assert_eq!(config.analyzer.program, "python");

        let devices = config.static_devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].port, 80);
        assert_eq!(devices[1].base_url(), "http://192.168.4.21:8080");
    }

    #[test]
    fn test_invalid_offset_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[schedule]\nutc_offset = \"GMT+7\"\n").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
