//! Device registry holding the latest discovery snapshot
//!
//! The registry is never merged: each scan replaces the whole map. Readers
//! take an `Arc` snapshot, so they see either the previous scan or the new
//! one and never a half-applied update.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::device::Device;

/// Snapshot of known devices keyed by name
pub type DeviceMap = BTreeMap<String, Device>;

/// Names that appeared or disappeared when a snapshot was replaced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryChange {
    pub added: Vec<Device>,
    pub removed: Vec<String>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    snapshot: RwLock<Arc<DeviceMap>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry contents with `devices`
    pub async fn replace(&self, devices: Vec<Device>) -> RegistryChange {
        let next: DeviceMap = devices
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let next = Arc::new(next);

        let previous = {
            let mut guard = self.snapshot.write().await;
            std::mem::replace(&mut *guard, next.clone())
        };

        let change = RegistryChange {
            added: next
                .values()
                .filter(|d| !previous.contains_key(&d.name))
                .cloned()
                .collect(),
            removed: previous
                .keys()
                .filter(|name| !next.contains_key(*name))
                .cloned()
                .collect(),
        };

        debug!(
            total = next.len(),
            added = change.added.len(),
            removed = change.removed.len(),
            "Registry snapshot replaced"
        );
        change
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<DeviceMap> {
        self.snapshot.read().await.clone()
    }

    /// Current devices in name order
    pub async fn devices(&self) -> Vec<Device> {
        self.snapshot().await.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<Device> {
        self.snapshot.read().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.snapshot.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshot.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn device(name: &str, last_octet: u8) -> Device {
        Device::new(name, IpAddr::V4(Ipv4Addr::new(192, 168, 1, last_octet)), 80)
    }

    #[tokio::test]
    async fn test_replace_is_not_a_merge() {
        let registry = DeviceRegistry::new();
        registry.replace(vec![device("esp-1", 10), device("esp-2", 11)]).await;

        let scan = vec![device("esp-2", 11), device("esp-3", 12)];
        let change = registry.replace(scan.clone()).await;

        assert_eq!(registry.devices().await, scan);
        assert!(registry.get("esp-1").await.is_none());
        assert_eq!(change.removed, vec!["esp-1".to_string()]);
        assert_eq!(change.added.len(), 1);
        assert_eq!(change.added[0].name, "esp-3");
    }

    #[tokio::test]
    async fn test_empty_scan_clears_registry() {
        let registry = DeviceRegistry::new();
        registry.replace(vec![device("esp-1", 10)]).await;
        registry.replace(Vec::new()).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_snapshot_outlives_replace() {
        let registry = DeviceRegistry::new();
        registry.replace(vec![device("esp-1", 10)]).await;
        let before = registry.snapshot().await;

        registry.replace(vec![device("esp-9", 19)]).await;

        assert!(before.contains_key("esp-1"));
        assert_eq!(registry.len().await, 1);
        assert!(registry.get("esp-9").await.is_some());
    }
}
