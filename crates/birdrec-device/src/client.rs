//! HTTP command client for a single recorder

use birdrec_core::{Device, MetadataResponse, RecordingFile};
use chrono::Utc;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default timeout for a device request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Firmware images take a while to flash, so uploads get a longer budget
const FIRMWARE_UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Request to {device} failed: {source}")]
    Request {
        device: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{device} answered {status}: {body}")]
    Status {
        device: String,
        status: StatusCode,
        body: String,
    },
    #[error("{device} stopped sending data for {}s", .timeout.as_secs())]
    Stalled { device: String, timeout: Duration },
    #[error("Request to {device} did not complete: {reason}")]
    Aborted { device: String, reason: String },
    #[error("Invalid file name '{0}'")]
    InvalidFileName(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl DeviceError {
    /// Whether the device could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        matches!(self, DeviceError::Request { .. } | DeviceError::Stalled { .. })
    }
}

/// Simple GET commands without parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Stop,
    Reset,
}

impl Command {
    pub fn path(&self) -> &'static str {
        match self {
            Command::Start => "/start",
            Command::Stop => "/stop",
            Command::Reset => "/reset",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path().trim_start_matches('/'))
    }
}

/// Result of a firmware upload
#[derive(Debug, Clone, Serialize)]
pub struct FirmwareUpload {
    pub file: String,
    pub size: usize,
    /// SHA-256 of the uploaded image, hex encoded
    pub sha256: String,
}

/// Client for the recorder HTTP API.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct DeviceClient {
    pub(crate) client: reqwest::Client,
    pub(crate) timeout: Duration,
}

impl DeviceClient {
    /// Create a client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, DeviceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(DeviceError::Client)?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a GET and fail on anything but a 2xx answer
    pub(crate) async fn get(
        &self,
        device: &Device,
        path: &str,
        query: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, DeviceError> {
        let url = format!("{}{}", device.base_url(), path);
        debug!(device = %device.name, url = %url, "Device request");

        let mut request = self.client.get(&url).query(query);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| DeviceError::Request {
            device: device.name.clone(),
            source: e,
        })?;
        check_status(device, response).await
    }

    async fn get_text(
        &self,
        device: &Device,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<String, DeviceError> {
        let response = self.get(device, path, query, Some(self.timeout)).await?;
        response.text().await.map_err(|e| DeviceError::Request {
            device: device.name.clone(),
            source: e,
        })
    }

    /// Send a parameterless command, returning the device's reply text
    pub async fn send(&self, device: &Device, command: Command) -> Result<String, DeviceError> {
        let reply = self.get_text(device, command.path(), &[]).await?;
        info!(device = %device.name, command = %command, "Command accepted");
        Ok(reply)
    }

    pub async fn start(&self, device: &Device) -> Result<String, DeviceError> {
        self.send(device, Command::Start).await
    }

    pub async fn stop(&self, device: &Device) -> Result<String, DeviceError> {
        self.send(device, Command::Stop).await
    }

    pub async fn reset(&self, device: &Device) -> Result<String, DeviceError> {
        self.send(device, Command::Reset).await
    }

    /// Set the device clock to `unix_secs`
    pub async fn set_time(&self, device: &Device, unix_secs: i64) -> Result<(), DeviceError> {
        let time = unix_secs.to_string();
        self.get_text(device, "/set_time", &[("time", &time)]).await?;
        info!(device = %device.name, time = unix_secs, "Device clock set");
        Ok(())
    }

    /// Set the device clock to now
    pub async fn sync_time(&self, device: &Device) -> Result<(), DeviceError> {
        self.set_time(device, Utc::now().timestamp()).await
    }

    pub async fn list_files(&self, device: &Device) -> Result<Vec<RecordingFile>, DeviceError> {
        let body = self.get_text(device, "/list", &[]).await?;
        let files = RecordingFile::parse_listing(&body);
        debug!(device = %device.name, count = files.len(), "Listed files");
        Ok(files)
    }

    pub async fn delete_file(&self, device: &Device, file: &str) -> Result<(), DeviceError> {
        validate_file_name(file)?;
        self.get_text(device, "/delete", &[("file", file)]).await?;
        info!(device = %device.name, file = %file, "File deleted");
        Ok(())
    }

    pub async fn rename_file(
        &self,
        device: &Device,
        file: &str,
        new_name: &str,
    ) -> Result<(), DeviceError> {
        validate_file_name(file)?;
        validate_file_name(new_name)?;
        self.get_text(device, "/rename", &[("file", file), ("new_name", new_name)])
            .await?;
        info!(device = %device.name, file = %file, new_name = %new_name, "File renamed");
        Ok(())
    }

    /// Fetch device information, keeping the raw body when it is not JSON
    pub async fn metadata(&self, device: &Device) -> Result<MetadataResponse, DeviceError> {
        let body = self.get_text(device, "/", &[]).await?;
        Ok(MetadataResponse::parse(&body))
    }

    /// Upload a firmware image as multipart field `update`
    pub async fn update_firmware(
        &self,
        device: &Device,
        image: &Path,
    ) -> Result<FirmwareUpload, DeviceError> {
        let data = tokio::fs::read(image).await?;
        let file = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "firmware.bin".to_string());
        let sha256 = hex::encode(Sha256::digest(&data));
        let size = data.len();

        info!(
            device = %device.name,
            file = %file,
            size = size,
            sha256 = %sha256,
            "Uploading firmware"
        );

        let request_err = |e| DeviceError::Request {
            device: device.name.clone(),
            source: e,
        };
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file.clone())
            .mime_str("application/octet-stream")
            .map_err(request_err)?;
        let form = reqwest::multipart::Form::new().part("update", part);

        let response = self
            .client
            .post(format!("{}/update", device.base_url()))
            .multipart(form)
            .timeout(FIRMWARE_UPLOAD_TIMEOUT)
            .send()
            .await
            .map_err(request_err)?;
        check_status(device, response).await?;

        info!(device = %device.name, file = %file, "Firmware upload accepted");
        Ok(FirmwareUpload { file, size, sha256 })
    }
}

async fn check_status(
    device: &Device,
    response: reqwest::Response,
) -> Result<reqwest::Response, DeviceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    warn!(device = %device.name, status = %status, body = %body, "Device rejected request");
    Err(DeviceError::Status {
        device: device.name.clone(),
        status,
        body: body.trim().to_string(),
    })
}

/// Names are used both as a device query parameter and as a local file name
pub(crate) fn validate_file_name(name: &str) -> Result<(), DeviceError> {
    let bad = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains('\0');
    if bad {
        return Err(DeviceError::InvalidFileName(name.to_string()));
    }
    Ok(())
}
