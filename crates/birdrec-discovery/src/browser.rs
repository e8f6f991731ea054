//! Device browsing seam shared by mDNS and static configuration

use async_trait::async_trait;
use birdrec_core::Device;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),
    #[error("Browse worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("Discovery unavailable: {0}")]
    Unavailable(String),
}

/// Something that can list the recorders currently on the network
#[async_trait]
pub trait DeviceBrowser: Send + Sync {
    /// Run one bounded browse and return everything found
    async fn browse(&self) -> Result<Vec<Device>, DiscoveryError>;
}

/// Browser returning a fixed device list from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticBrowser {
    devices: Vec<Device>,
}

impl StaticBrowser {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceBrowser for StaticBrowser {
    async fn browse(&self) -> Result<Vec<Device>, DiscoveryError> {
        Ok(self.devices.clone())
    }
}
