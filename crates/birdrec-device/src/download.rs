//! Streaming file downloads with progress reporting

use birdrec_core::Device;
use futures_util::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::client::{validate_file_name, DeviceClient, DeviceError};

/// Progress of one download, reported after every received chunk
#[derive(Debug, Clone, Serialize)]
pub struct DownloadProgress {
    pub device: String,
    pub file: String,
    pub downloaded_bytes: u64,
    /// From `content-length`, when the device sends one
    pub total_bytes: Option<u64>,
    pub bytes_per_sec: f64,
}

impl DownloadProgress {
    /// Completed fraction in `0.0..=1.0`, if the total size is known
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) | None => None,
            Some(total) => Some((self.downloaded_bytes as f64 / total as f64).min(1.0)),
        }
    }
}

impl DeviceClient {
    /// Download `file` into `dest_dir`, returning the written path.
    ///
    /// The body is streamed to `<file>.part` and renamed once complete, so an
    /// interrupted transfer never leaves a truncated file under the real name.
    pub async fn download<F>(
        &self,
        device: &Device,
        file: &str,
        dest_dir: &Path,
        mut on_progress: F,
    ) -> Result<PathBuf, DeviceError>
    where
        F: FnMut(&DownloadProgress) + Send,
    {
        validate_file_name(file)?;
        tokio::fs::create_dir_all(dest_dir).await?;

        // No whole-request timeout: recordings are large. Each chunk gets the
        // client timeout instead.
        let response = self.get(device, "/download", &[("file", file)], None).await?;
        let total_bytes = response.content_length();

        let dest = dest_dir.join(file);
        let partial = dest_dir.join(format!("{file}.part"));
        let out = tokio::fs::File::create(&partial).await?;

        let progress = DownloadProgress {
            device: device.name.clone(),
            file: file.to_string(),
            downloaded_bytes: 0,
            total_bytes,
            bytes_per_sec: 0.0,
        };

        let written = match self
            .stream_body(device, response, out, progress, &mut on_progress)
            .await
        {
            Ok(written) => written,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&partial).await {
                    warn!(path = %partial.display(), error = %rm, "Failed to remove partial download");
                }
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, &dest).await?;

        info!(
            device = %device.name,
            file = %file,
            bytes = written,
            path = %dest.display(),
            "Download complete"
        );
        Ok(dest)
    }

    /// Copy the response body into `out`, returning the byte count.
    ///
    /// `out` is flushed and closed before returning, on success or error.
    async fn stream_body<F>(
        &self,
        device: &Device,
        response: reqwest::Response,
        mut out: tokio::fs::File,
        mut progress: DownloadProgress,
        on_progress: &mut F,
    ) -> Result<u64, DeviceError>
    where
        F: FnMut(&DownloadProgress) + Send,
    {
        let started = Instant::now();
        let mut stream = response.bytes_stream();
        loop {
            let chunk = match tokio::time::timeout(self.timeout, stream.next()).await {
                Ok(Some(chunk)) => chunk.map_err(|e| DeviceError::Request {
                    device: device.name.clone(),
                    source: e,
                })?,
                Ok(None) => break,
                Err(_) => {
                    return Err(DeviceError::Stalled {
                        device: device.name.clone(),
                        timeout: self.timeout,
                    })
                }
            };

            out.write_all(&chunk).await?;
            progress.downloaded_bytes += chunk.len() as u64;
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                progress.bytes_per_sec = progress.downloaded_bytes as f64 / elapsed;
            }
            on_progress(&progress);
        }

        out.flush().await?;
        Ok(progress.downloaded_bytes)
    }

    /// Download every listed file concurrently.
    ///
    /// Each file succeeds or fails on its own; the listing itself failing is
    /// the only error for the whole batch.
    pub async fn download_all<F>(
        &self,
        device: &Device,
        dest_dir: &Path,
        on_progress: F,
    ) -> Result<Vec<(String, Result<PathBuf, DeviceError>)>, DeviceError>
    where
        F: Fn(&DownloadProgress) + Send + Sync + 'static,
    {
        let files = self.list_files(device).await?;
        let on_progress = Arc::new(on_progress);
        let mut tasks = JoinSet::new();

        let names: Vec<String> = files.into_iter().map(|f| f.name).collect();
        for (index, name) in names.iter().cloned().enumerate() {
            let client = self.clone();
            let device = device.clone();
            let dest_dir = dest_dir.to_path_buf();
            let on_progress = on_progress.clone();
            tasks.spawn(async move {
                let result = client
                    .download(&device, &name, &dest_dir, |p| (*on_progress)(p))
                    .await;
                (index, result)
            });
        }

        Ok(gather_downloads(device, names, tasks).await)
    }
}

/// Join download tasks in listing order; a task that panicked or was
/// cancelled becomes a failed entry for its file.
async fn gather_downloads(
    device: &Device,
    names: Vec<String>,
    mut tasks: JoinSet<(usize, Result<PathBuf, DeviceError>)>,
) -> Vec<(String, Result<PathBuf, DeviceError>)> {
    let mut results: Vec<Option<Result<PathBuf, DeviceError>>> =
        names.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => {
                if let Some(slot) = results.get_mut(index) {
                    *slot = Some(result);
                }
            }
            Err(e) => warn!(device = %device.name, error = %e, "Download task failed"),
        }
    }

    names
        .into_iter()
        .zip(results)
        .map(|(name, result)| {
            let result = result.unwrap_or_else(|| {
                Err(DeviceError::Aborted {
                    device: device.name.clone(),
                    reason: format!("download of {name} panicked or was cancelled"),
                })
            });
            (name, result)
        })
        .collect()
}
