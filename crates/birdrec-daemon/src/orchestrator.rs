//! Recording orchestration across all known devices
//!
//! Start and stop are fanned out to every device in the registry at once.
//! Each device answers on its own task and the outcomes are gathered into a
//! report, so one unreachable recorder never hides another's success.

use birdrec_core::{format_elapsed, Device, DeviceRegistry, RecordingSession};
use birdrec_device::{Command, DeviceClient, DeviceError};
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the session timer republishes the elapsed time
const TIMER_TICK: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("No devices found")]
    NoDevices,
    #[error("Device not found: {0}")]
    UnknownDevice(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// What happened to one device during a fan-out
#[derive(Debug)]
pub struct DeviceOutcome {
    pub device: Device,
    pub result: Result<(), DeviceError>,
}

impl DeviceOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

impl Serialize for DeviceOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("DeviceOutcome", 4)?;
        s.serialize_field("device", &self.device.name)?;
        s.serialize_field("address", &self.device.address)?;
        s.serialize_field("ok", &self.is_ok())?;
        s.serialize_field("error", &self.result.as_ref().err().map(|e| e.to_string()))?;
        s.end()
    }
}

/// Gathered result of a start-all or stop-all
#[derive(Debug, Serialize)]
pub struct FanOutReport {
    pub command: Command,
    pub outcomes: Vec<DeviceOutcome>,
    /// Set by a stop that ended the session
    pub session_secs: Option<i64>,
}

impl FanOutReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &DeviceOutcome> {
        self.outcomes.iter().filter(|o| o.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &DeviceOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    pub fn any_ok(&self) -> bool {
        self.outcomes.iter().any(DeviceOutcome::is_ok)
    }

    pub fn outcome(&self, name: &str) -> Option<&DeviceOutcome> {
        self.outcomes.iter().find(|o| o.device.name == name)
    }
}

/// Session updates for the control surface
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionEvent {
    Started { started_at: DateTime<Utc> },
    Elapsed { seconds: i64, display: String },
    Stopped { seconds: i64 },
}

/// Snapshot of the session for the API
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed: Option<String>,
    pub selected: Option<String>,
}

pub struct Orchestrator {
    registry: Arc<DeviceRegistry>,
    client: DeviceClient,
    session: Mutex<RecordingSession>,
    /// Cancels the running timer loop, if any
    timer: Mutex<Option<CancellationToken>>,
    selected: RwLock<Option<String>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl Orchestrator {
    pub fn new(registry: Arc<DeviceRegistry>, client: DeviceClient) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            registry,
            client,
            session: Mutex::new(RecordingSession::default()),
            timer: Mutex::new(None),
            selected: RwLock::new(None),
            event_tx,
        }
    }

    pub fn client(&self) -> &DeviceClient {
        &self.client
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Start recording on every known device
    pub async fn start_all(&self) -> Result<FanOutReport, OrchestratorError> {
        let outcomes = self.fan_out(Command::Start).await?;
        let report = FanOutReport {
            command: Command::Start,
            outcomes,
            session_secs: None,
        };
        if report.any_ok() {
            self.begin_session().await;
        }
        Ok(report)
    }

    /// Stop recording on every known device
    pub async fn stop_all(&self) -> Result<FanOutReport, OrchestratorError> {
        let outcomes = self.fan_out(Command::Stop).await?;
        let mut report = FanOutReport {
            command: Command::Stop,
            outcomes,
            session_secs: None,
        };
        if report.any_ok() {
            report.session_secs = self.end_session().await;
        }
        Ok(report)
    }

    async fn fan_out(&self, command: Command) -> Result<Vec<DeviceOutcome>, OrchestratorError> {
        let devices = self.registry.devices().await;
        if devices.is_empty() {
            warn!(command = %command, "No devices found, nothing sent");
            return Err(OrchestratorError::NoDevices);
        }

        info!(command = %command, devices = devices.len(), "Sending command to all devices");

        let mut tasks = JoinSet::new();
        for (index, device) in devices.iter().cloned().enumerate() {
            let client = self.client.clone();
            tasks.spawn(async move {
                let result = client.send(&device, command).await.map(|_| ());
                (index, result)
            });
        }

        let outcomes = gather_outcomes(command, devices, tasks).await;
        for outcome in &outcomes {
            match &outcome.result {
                Ok(()) => info!(device = %outcome.device.name, command = %command, "Device ok"),
                Err(e) => warn!(device = %outcome.device.name, command = %command, error = %e, "Device failed"),
            }
        }
        Ok(outcomes)
    }

    /// Look up a device, distinguishing "nothing discovered" from a bad name
    pub async fn device(&self, name: &str) -> Result<Device, OrchestratorError> {
        let snapshot = self.registry.snapshot().await;
        if snapshot.is_empty() {
            warn!(device = %name, "No devices found");
            return Err(OrchestratorError::NoDevices);
        }
        snapshot
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownDevice(name.to_string()))
    }

    /// Make `name` the selected device and sync its clock.
    ///
    /// The selection sticks even if the sync fails.
    pub async fn select(&self, name: &str) -> Result<Device, OrchestratorError> {
        let device = self.device(name).await?;
        *self.selected.write().await = Some(device.name.clone());
        info!(device = %device.name, "Device selected");
        self.client.sync_time(&device).await?;
        Ok(device)
    }

    pub async fn selected(&self) -> Option<String> {
        self.selected.read().await.clone()
    }

    async fn is_selected(&self, name: &str) -> bool {
        self.selected.read().await.as_deref() == Some(name)
    }

    /// Start one device; the session follows only the selected device
    pub async fn start_device(&self, name: &str) -> Result<String, OrchestratorError> {
        let device = self.device(name).await?;
        let reply = self.client.start(&device).await?;
        if self.is_selected(name).await {
            self.begin_session().await;
        }
        Ok(reply)
    }

    /// Stop one device, returning the session length if it ended one
    pub async fn stop_device(&self, name: &str) -> Result<Option<i64>, OrchestratorError> {
        let device = self.device(name).await?;
        self.client.stop(&device).await?;
        if self.is_selected(name).await {
            return Ok(self.end_session().await);
        }
        Ok(None)
    }

    pub async fn session(&self) -> SessionStatus {
        let session = self.session.lock().await.clone();
        SessionStatus {
            active: session.is_active(),
            started_at: session.started_at,
            elapsed: session.elapsed(Utc::now()).map(format_elapsed),
            selected: self.selected().await,
        }
    }

    async fn begin_session(&self) {
        let started_at = self.session.lock().await.start(Utc::now());

        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            debug!("Session already running, keeping its start time");
            return;
        }

        info!(started_at = %started_at, "Recording session started");
        let _ = self.event_tx.send(SessionEvent::Started { started_at });

        let cancel = CancellationToken::new();
        tokio::spawn(run_timer(started_at, self.event_tx.clone(), cancel.clone()));
        *timer = Some(cancel);
    }

    async fn end_session(&self) -> Option<i64> {
        if let Some(cancel) = self.timer.lock().await.take() {
            cancel.cancel();
        }
        let seconds = self
            .session
            .lock()
            .await
            .stop(Utc::now())
            .map(|d| d.num_seconds())?;

        info!(duration = %format_elapsed(chrono::Duration::seconds(seconds)), "Recording session stopped");
        let _ = self.event_tx.send(SessionEvent::Stopped { seconds });
        Some(seconds)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(cancel) = self.timer.get_mut().take() {
            cancel.cancel();
        }
    }
}

/// Republish the elapsed time once per tick until cancelled
async fn run_timer(
    started_at: DateTime<Utc>,
    event_tx: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(TIMER_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let elapsed = Utc::now() - started_at;
                let _ = event_tx.send(SessionEvent::Elapsed {
                    seconds: elapsed.num_seconds(),
                    display: format_elapsed(elapsed),
                });
            }
        }
    }
    debug!("Session timer stopped");
}

/// Join every device task, keeping registry order.
///
/// A task that panicked or was cancelled still yields a failed outcome for
/// its device.
async fn gather_outcomes(
    command: Command,
    devices: Vec<Device>,
    mut tasks: JoinSet<(usize, Result<(), DeviceError>)>,
) -> Vec<DeviceOutcome> {
    let mut results: Vec<Option<Result<(), DeviceError>>> =
        devices.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => {
                if let Some(slot) = results.get_mut(index) {
                    *slot = Some(result);
                }
            }
            Err(e) => warn!(command = %command, error = %e, "Device task failed"),
        }
    }

    devices
        .into_iter()
        .zip(results)
        .map(|(device, result)| {
            let result = result.unwrap_or_else(|| {
                Err(DeviceError::Aborted {
                    device: device.name.clone(),
                    reason: "task panicked or was cancelled".to_string(),
                })
            });
            DeviceOutcome { device, result }
        })
        .collect()
}
