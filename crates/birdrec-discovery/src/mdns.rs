//! mDNS service browsing
//!
//! The recorder firmware advertises itself as `<instance>._http._tcp.local.`
//! on port 80. A browse listens for a fixed window and collects every
//! resolved instance; the blocking receive runs on a worker thread so the
//! async runtime keeps serving requests meanwhile.

use async_trait::async_trait;
use birdrec_core::Device;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::browser::{DeviceBrowser, DiscoveryError};

/// Service type advertised by the recorders
pub const DEFAULT_SERVICE_TYPE: &str = "_http._tcp.local.";

/// How long one browse listens for announcements
pub const DEFAULT_LISTEN_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MdnsBrowser {
    service_type: String,
    listen_window: Duration,
    name_prefix: Option<String>,
}

impl MdnsBrowser {
    pub fn new(service_type: impl Into<String>, listen_window: Duration) -> Self {
        Self {
            service_type: service_type.into(),
            listen_window,
            name_prefix: None,
        }
    }

    /// Only keep instances whose name starts with `prefix`
    pub fn with_name_prefix(mut self, prefix: Option<String>) -> Self {
        self.name_prefix = prefix.filter(|p| !p.is_empty());
        self
    }

    fn accepts(&self, name: &str) -> bool {
        match &self.name_prefix {
            Some(prefix) => name.starts_with(prefix.as_str()),
            None => true,
        }
    }
}

impl Default for MdnsBrowser {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_TYPE, DEFAULT_LISTEN_WINDOW)
    }
}

#[async_trait]
impl DeviceBrowser for MdnsBrowser {
    async fn browse(&self) -> Result<Vec<Device>, DiscoveryError> {
        let service_type = self.service_type.clone();
        let window = self.listen_window;
        let found =
            tokio::task::spawn_blocking(move || browse_blocking(&service_type, window)).await??;

        let (kept, skipped): (Vec<_>, Vec<_>) =
            found.into_iter().partition(|d| self.accepts(&d.name));
        if !skipped.is_empty() {
            debug!(skipped = skipped.len(), "Ignored services outside name prefix");
        }
        Ok(kept)
    }
}

fn browse_blocking(service_type: &str, window: Duration) -> Result<Vec<Device>, DiscoveryError> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(service_type)?;
    let deadline = Instant::now() + window;
    let mut found: BTreeMap<String, Device> = BTreeMap::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                if let Some(device) = resolved_device(&info, service_type) {
                    trace!(device = %device, "Resolved service");
                    found.insert(device.name.clone(), device);
                }
            }
            Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                found.remove(&instance_name(&fullname, service_type));
            }
            Ok(other) => trace!(event = ?other, "mDNS event"),
            // Window elapsed or daemon gone
            Err(_) => break,
        }
    }

    if let Err(e) = daemon.stop_browse(service_type) {
        debug!(error = %e, "Failed to stop mDNS browse");
    }
    if let Err(e) = daemon.shutdown() {
        warn!(error = %e, "Failed to shut down mDNS daemon");
    }

    Ok(found.into_values().collect())
}

fn resolved_device(info: &ServiceInfo, service_type: &str) -> Option<Device> {
    // IPv4 first, like the recorders' own announcements
    let address = info
        .get_addresses()
        .iter()
        .copied()
        .min_by_key(|a| (a.is_ipv6(), *a))?;
    Some(Device::new(
        instance_name(info.get_fullname(), service_type),
        address,
        info.get_port(),
    ))
}

/// `ESPREC-01._http._tcp.local.` -> `ESPREC-01`
fn instance_name(fullname: &str, service_type: &str) -> String {
    let suffix = format!(".{}", service_type);
    fullname
        .strip_suffix(&suffix)
        .unwrap_or(fullname)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_instance_name() {
        assert_eq!(instance_name("ESPREC-01._http._tcp.local.", DEFAULT_SERVICE_TYPE), "ESPREC-01");
        assert_eq!(instance_name("printer", DEFAULT_SERVICE_TYPE), "printer");
    }

    #[test]
    fn test_name_prefix_filter() {
        let browser = MdnsBrowser::default().with_name_prefix(Some("ESPREC".to_string()));
        assert!(browser.accepts("ESPREC-01"));
        assert!(!browser.accepts("office-printer"));

        let open = MdnsBrowser::default().with_name_prefix(Some(String::new()));
        assert!(open.accepts("office-printer"));
    }

    #[test]
    fn test_resolved_device_prefers_ipv4() {
        let info = ServiceInfo::new(
            DEFAULT_SERVICE_TYPE,
            "ESPREC-02",
            "esprec-02.local.",
            "192.168.1.12,fe80::1",
            80,
            None::<HashMap<String, String>>,
        )
        .unwrap();

        let device = resolved_device(&info, DEFAULT_SERVICE_TYPE).unwrap();
        assert_eq!(device.name, "ESPREC-02");
        assert_eq!(device.address, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 12)));
        assert_eq!(device.port, 80);
    }
}
