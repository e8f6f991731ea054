//! Application state management

use anyhow::{Context, Result};
use birdrec_core::{Clock, DeviceRegistry, SystemClock};
use birdrec_device::{DeviceClient, DownloadProgress};
use birdrec_discovery::{DeviceBrowser, DiscoveryScanner, MdnsBrowser, StaticBrowser};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::analyzer::Analyzer;
use crate::config::{Config, DiscoveryMode};
use crate::orchestrator::Orchestrator;
use crate::scheduler::Scheduler;

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Latest discovery snapshot
    pub registry: Arc<DeviceRegistry>,
    /// Discovery scanner
    pub scanner: Arc<DiscoveryScanner>,
    /// Start/stop fan-out and session tracking
    pub orchestrator: Arc<Orchestrator>,
    /// Time-of-day schedule engine
    pub scheduler: Arc<Scheduler>,
    pub analyzer: Analyzer,
    /// Download progress for WebSocket clients
    pub downloads: broadcast::Sender<DownloadProgress>,
}

impl AppState {
    /// Create application state from configuration
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let browser: Arc<dyn DeviceBrowser> = match config.discovery.mode {
            DiscoveryMode::Mdns => Arc::new(
                MdnsBrowser::new(&config.discovery.service_type, config.listen_window())
                    .with_name_prefix(config.discovery.name_prefix.clone()),
            ),
            DiscoveryMode::Static => {
                let devices = config.static_devices();
                info!(count = devices.len(), "Using statically configured devices");
                Arc::new(StaticBrowser::new(devices))
            }
        };
        let clock = Arc::new(SystemClock::new(config.utc_offset()?));

        Self::with_parts(config, browser, clock)
    }

    /// Assemble state around an explicit browser and clock
    pub fn with_parts(
        config: Config,
        browser: Arc<dyn DeviceBrowser>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let client =
            DeviceClient::new(config.request_timeout()).context("creating device client")?;
        let registry = Arc::new(DeviceRegistry::new());

        let scanner = Arc::new(DiscoveryScanner::new(
            browser,
            registry.clone(),
            client.clone(),
            config.scan_interval(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(registry.clone(), client));
        let scheduler = Arc::new(Scheduler::new(
            orchestrator.clone(),
            clock,
            config.poll_interval(),
        ));
        let analyzer = Analyzer::new(config.analyzer.clone());
        let (downloads, _) = broadcast::channel(256);

        Ok(Arc::new(Self {
            config,
            registry,
            scanner,
            orchestrator,
            scheduler,
            analyzer,
            downloads,
        }))
    }

    /// Start the discovery and schedule loops; both stop when `cancel` fires
    pub fn spawn_background(&self, cancel: &CancellationToken) {
        let scanner = self.scanner.clone();
        let token = cancel.clone();
        tokio::spawn(async move { scanner.run(token).await });

        tokio::spawn(self.scheduler.clone().run(cancel.clone()));
    }

    pub fn client(&self) -> &DeviceClient {
        self.orchestrator.client()
    }

    /// Subscribe to download progress
    pub fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadProgress> {
        self.downloads.subscribe()
    }
}
