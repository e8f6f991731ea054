//! birdrec Discovery - Network discovery for recorders
//!
//! This crate provides:
//! - mDNS browsing for recorders advertising `_http._tcp`
//! - A static device list for networks without multicast
//! - A scanner that refreshes the device registry on an interval and
//!   time-syncs each newly seen address once

pub mod browser;
pub mod mdns;
pub mod scanner;

pub use browser::{DeviceBrowser, DiscoveryError, StaticBrowser};
pub use mdns::{MdnsBrowser, DEFAULT_LISTEN_WINDOW, DEFAULT_SERVICE_TYPE};
pub use scanner::{DiscoveryEvent, DiscoveryScanner, DEFAULT_SCAN_INTERVAL};
