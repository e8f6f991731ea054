//! birdrec Device - HTTP command client for ESP32 recorders
//!
//! Wraps `reqwest` to drive a recorder's control API: start/stop/reset,
//! clock sync, file listing, streaming downloads, delete/rename, firmware
//! upload and device metadata.

pub mod client;
pub mod download;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::{Command, DeviceClient, DeviceError, FirmwareUpload, DEFAULT_TIMEOUT};
pub use download::DownloadProgress;
