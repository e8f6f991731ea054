//! Discovery scanner: periodic browse, registry refresh and clock sync

use birdrec_core::{Device, DeviceRegistry};
use birdrec_device::DeviceClient;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::{DeviceBrowser, DiscoveryError};

/// Default time between two scans
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// Discovery event for real-time updates
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// Scan started
    ScanStarted,
    /// Scan completed
    ScanCompleted { found: usize },
    /// Device present in this scan but not the previous one
    DeviceDiscovered(Device),
    /// Device present in the previous scan but not this one
    DeviceLost(String),
    /// Clock sync sent to a newly seen address
    TimeSynced { name: String, ok: bool },
}

/// Discovery scanner service
pub struct DiscoveryScanner {
    browser: Arc<dyn DeviceBrowser>,
    registry: Arc<DeviceRegistry>,
    client: DeviceClient,
    /// Device endpoints already time-synced during this scanner's lifetime
    synced: Mutex<HashSet<SocketAddr>>,
    interval: Duration,
    event_tx: broadcast::Sender<DiscoveryEvent>,
}

impl DiscoveryScanner {
    pub fn new(
        browser: Arc<dyn DeviceBrowser>,
        registry: Arc<DeviceRegistry>,
        client: DeviceClient,
        interval: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            browser,
            registry,
            client,
            synced: Mutex::new(HashSet::new()),
            interval,
            event_tx,
        }
    }

    /// Subscribe to discovery events
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Endpoints synced so far
    pub async fn synced_addresses(&self) -> HashSet<SocketAddr> {
        self.synced.lock().await.clone()
    }

    /// Run a single discovery scan.
    ///
    /// A browse failure leaves the registry untouched. An empty result is not
    /// an error and empties the registry.
    pub async fn scan_once(&self) -> Result<Vec<Device>, DiscoveryError> {
        let _ = self.event_tx.send(DiscoveryEvent::ScanStarted);
        debug!("Starting discovery scan");

        let devices = self.browser.browse().await?;
        let change = self.registry.replace(devices.clone()).await;

        for device in change.added {
            info!(device = %device.name, address = %device.address, "Device discovered");
            let _ = self.event_tx.send(DiscoveryEvent::DeviceDiscovered(device));
        }
        for name in change.removed {
            info!(device = %name, "Device no longer advertised");
            let _ = self.event_tx.send(DiscoveryEvent::DeviceLost(name));
        }

        self.sync_new_devices(&devices).await;

        let _ = self.event_tx.send(DiscoveryEvent::ScanCompleted {
            found: devices.len(),
        });
        if devices.is_empty() {
            debug!("Scan complete: no devices found");
        } else {
            info!("Scan complete: {} devices found", devices.len());
        }

        Ok(devices)
    }

    /// Send a clock sync to every endpoint not synced before.
    ///
    /// Endpoints are claimed before the request goes out, so a failed sync is
    /// not retried on later scans.
    async fn sync_new_devices(&self, devices: &[Device]) {
        let pending: Vec<Device> = {
            let mut synced = self.synced.lock().await;
            devices
                .iter()
                .filter(|d| synced.insert(d.socket_addr()))
                .cloned()
                .collect()
        };
        if pending.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        for device in pending {
            let client = self.client.clone();
            tasks.spawn(async move {
                let result = client.sync_time(&device).await;
                (device, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (device, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "Time sync task failed");
                    continue;
                }
            };
            let ok = match result {
                Ok(()) => true,
                Err(e) => {
                    warn!(device = %device.name, error = %e, "Time sync failed");
                    false
                }
            };
            let _ = self.event_tx.send(DiscoveryEvent::TimeSynced {
                name: device.name,
                ok,
            });
        }
    }

    /// Scan every interval until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs_f64(), "Discovery scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        warn!(error = %e, "Discovery scan failed");
                    }
                }
            }
        }

        info!("Discovery scheduler stopped");
    }
}
