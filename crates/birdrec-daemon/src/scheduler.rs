//! Schedule engine: time-of-day triggers for start-all and stop-all

use birdrec_core::{Clock, Schedule, ScheduleEntry, ScheduleError, TimeOfDay, Triggered};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::orchestrator::Orchestrator;

/// Schedule changes and firings for the control surface
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleEvent {
    Changed { entries: Vec<ScheduleEntry> },
    Fired { id: Uuid, start: TimeOfDay, stop: TimeOfDay },
    Finished { id: Uuid },
}

pub struct Scheduler {
    schedule: RwLock<Schedule>,
    orchestrator: Arc<Orchestrator>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    /// Halts stop triggers still waiting when the engine shuts down
    shutdown: CancellationToken,
    event_tx: broadcast::Sender<ScheduleEvent>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            schedule: RwLock::new(Schedule::new()),
            orchestrator,
            clock,
            poll_interval,
            shutdown: CancellationToken::new(),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScheduleEvent> {
        self.event_tx.subscribe()
    }

    /// Validate and append an entry from raw `HH:MM` and minute strings
    pub async fn add(&self, time: &str, duration: &str) -> Result<ScheduleEntry, ScheduleError> {
        let mut schedule = self.schedule.write().await;
        let entry = schedule.add(time, duration)?;
        self.publish_changed(&schedule);
        Ok(entry)
    }

    pub async fn remove(&self, index: usize) -> Option<ScheduleEntry> {
        let mut schedule = self.schedule.write().await;
        let removed = schedule.remove(index)?;
        self.publish_changed(&schedule);
        Some(removed)
    }

    pub async fn entries(&self) -> Vec<ScheduleEntry> {
        self.schedule.read().await.entries().to_vec()
    }

    fn publish_changed(&self, schedule: &Schedule) {
        let _ = self.event_tx.send(ScheduleEvent::Changed {
            entries: schedule.entries().to_vec(),
        });
    }

    /// Compare the clock with every entry once, firing those that match.
    ///
    /// Each fired entry gets its own task that starts all devices and then
    /// waits for the stop time.
    pub async fn poll_once(self: &Arc<Self>) -> Vec<Triggered> {
        let now = self.clock.time_of_day();
        let fired = {
            let mut schedule = self.schedule.write().await;
            let fired = schedule.trigger_due(now);
            if !fired.is_empty() {
                self.publish_changed(&schedule);
            }
            fired
        };

        for entry in &fired {
            tokio::spawn(self.clone().run_entry(*entry));
        }
        fired
    }

    async fn run_entry(self: Arc<Self>, fired: Triggered) {
        info!(start = %fired.start, stop = %fired.stop, "Scheduled recording starting");
        let _ = self.event_tx.send(ScheduleEvent::Fired {
            id: fired.id,
            start: fired.start,
            stop: fired.stop,
        });

        match self.orchestrator.start_all().await {
            Ok(report) => info!(
                started = report.succeeded().count(),
                failed = report.failed().count(),
                "Scheduled start sent"
            ),
            Err(e) => warn!(error = %e, "Scheduled start failed"),
        }

        // Wait for the stop minute even if nothing started; the entry still
        // has to return to Scheduled. The stop time is a wrapped HH:MM, so
        // only an exact minute match ends the wait.
        loop {
            if self.clock.time_of_day() == fired.stop {
                break;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(stop = %fired.stop, "Stop trigger abandoned on shutdown");
                    return;
                }
                _ = sleep(self.poll_interval) => {}
            }
        }

        info!(stop = %fired.stop, "Scheduled recording stopping");
        match self.orchestrator.stop_all().await {
            Ok(report) => info!(
                stopped = report.succeeded().count(),
                failed = report.failed().count(),
                "Scheduled stop sent"
            ),
            Err(e) => warn!(error = %e, "Scheduled stop failed"),
        }

        let mut schedule = self.schedule.write().await;
        if schedule.finish(fired.id) {
            self.publish_changed(&schedule);
        } else {
            debug!("Entry was removed while recording");
        }
        let _ = self.event_tx.send(ScheduleEvent::Finished { id: fired.id });
    }

    /// Poll every interval until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(poll_secs = self.poll_interval.as_secs_f64(), "Schedule engine started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }

        self.shutdown.cancel();
        info!("Schedule engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use birdrec_core::{DeviceRegistry, ManualClock, ScheduleStatus};
    use birdrec_device::mock::MockRecorder;
    use birdrec_device::DeviceClient;
    use birdrec_discovery::{DiscoveryScanner, StaticBrowser};
    use chrono::{DateTime, FixedOffset};

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    async fn wait_for(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    struct Fixture {
        mock: MockRecorder,
        clock: Arc<ManualClock>,
        scheduler: Arc<Scheduler>,
    }

    async fn fixture(now: &str, with_device: bool) -> Fixture {
        let mock = MockRecorder::spawn().await;
        let registry = Arc::new(DeviceRegistry::new());
        let client = DeviceClient::new(Duration::from_secs(2)).unwrap();
        let advertised = if with_device {
            vec![mock.device("esp-1")]
        } else {
            Vec::new()
        };

        // Devices reach the registry the same way the daemon finds them
        let scanner = DiscoveryScanner::new(
            Arc::new(StaticBrowser::new(advertised.clone())),
            registry.clone(),
            client.clone(),
            Duration::from_millis(20),
        );
        scanner.scan_once().await.unwrap();
        assert_eq!(registry.devices().await.len(), advertised.len());
        if with_device {
            assert!(registry.get("esp-1").await.is_some());
            wait_for("time sync", || mock.count("/set_time") == 1).await;
        }

        let orchestrator = Arc::new(Orchestrator::new(registry, client));
        let clock = Arc::new(ManualClock::new(at(now)));
        let scheduler = Arc::new(Scheduler::new(
            orchestrator,
            clock.clone(),
            Duration::from_millis(20),
        ));
        Fixture {
            mock,
            clock,
            scheduler,
        }
    }

    async fn status(scheduler: &Scheduler) -> ScheduleStatus {
        scheduler.entries().await[0].status
    }

    #[tokio::test]
    async fn test_entry_records_then_returns_to_scheduled() {
        let f = fixture("2026-06-01T05:59:30+07:00", true).await;
        f.scheduler.add("06:00", "5").await.unwrap();

        assert!(f.scheduler.poll_once().await.is_empty());

        f.clock.set(at("2026-06-01T06:00:05+07:00"));
        let fired = f.scheduler.poll_once().await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].stop.to_string(), "06:05");
        assert_eq!(status(&f.scheduler).await, ScheduleStatus::Recording);

        // Same minute again: already recording, nothing new fires
        f.clock.set(at("2026-06-01T06:00:40+07:00"));
        assert!(f.scheduler.poll_once().await.is_empty());

        wait_for("start", || f.mock.count("/start") == 1).await;
        assert_eq!(f.mock.count("/stop"), 0);

        f.clock.set(at("2026-06-01T06:04:59+07:00"));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(f.mock.count("/stop"), 0);

        f.clock.set(at("2026-06-01T06:05:00+07:00"));
        wait_for("stop", || f.mock.count("/stop") == 1).await;
        for _ in 0..100 {
            if status(&f.scheduler).await == ScheduleStatus::Scheduled {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status(&f.scheduler).await, ScheduleStatus::Scheduled);
        assert_eq!(f.mock.count("/start"), 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_exact_minute() {
        let f = fixture("2026-06-01T06:00:00+00:00", true).await;
        f.scheduler.add("06:00", "5").await.unwrap();

        assert_eq!(f.scheduler.poll_once().await.len(), 1);
        wait_for("start", || f.mock.count("/start") == 1).await;

        // A poll that lands after the stop minute does not stop the recording
        f.clock.set(at("2026-06-01T06:06:00+00:00"));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(f.mock.count("/stop"), 0);
        assert_eq!(status(&f.scheduler).await, ScheduleStatus::Recording);

        f.clock.set(at("2026-06-02T06:05:30+00:00"));
        wait_for("stop", || f.mock.count("/stop") == 1).await;
    }

    #[tokio::test]
    async fn test_stop_wraps_past_midnight() {
        let f = fixture("2026-06-01T23:50:00+00:00", true).await;
        f.scheduler.add("23:50", "20").await.unwrap();

        let fired = f.scheduler.poll_once().await;
        assert_eq!(fired[0].stop.to_string(), "00:10");
        wait_for("start", || f.mock.count("/start") == 1).await;

        f.clock.set(at("2026-06-02T00:09:00+00:00"));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(f.mock.count("/stop"), 0);

        f.clock.set(at("2026-06-02T00:10:00+00:00"));
        wait_for("stop", || f.mock.count("/stop") == 1).await;
    }

    #[tokio::test]
    async fn test_missed_minute_does_not_fire() {
        let f = fixture("2026-06-01T05:58:00+00:00", true).await;
        f.scheduler.add("05:59", "1").await.unwrap();

        f.clock.set(at("2026-06-01T06:00:00+00:00"));
        assert!(f.scheduler.poll_once().await.is_empty());
        assert_eq!(status(&f.scheduler).await, ScheduleStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_invalid_input_leaves_schedule_unchanged() {
        let f = fixture("2026-06-01T12:00:00+00:00", true).await;

        assert_eq!(
            f.scheduler.add("25:99", "abc").await.unwrap_err(),
            ScheduleError::InvalidTime("25:99".to_string())
        );
        assert!(f.scheduler.add("06:00", "abc").await.is_err());
        assert!(f.scheduler.add("06:00", "0").await.is_err());
        assert!(f.scheduler.add("06:00", "1440").await.is_err());
        assert!(f.scheduler.entries().await.is_empty());

        assert!(f.scheduler.remove(0).await.is_none());
        f.scheduler.add("06:00", "10").await.unwrap();
        assert!(f.scheduler.remove(3).await.is_none());
        assert_eq!(f.scheduler.remove(0).await.unwrap().duration_minutes, 10);
    }

    #[tokio::test]
    async fn test_fires_without_devices() {
        let f = fixture("2026-06-01T08:00:00+00:00", false).await;
        f.scheduler.add("08:00", "1").await.unwrap();
        let mut events = f.scheduler.subscribe();

        assert_eq!(f.scheduler.poll_once().await.len(), 1);
        f.clock.set(at("2026-06-01T08:01:00+00:00"));

        let finished = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(ScheduleEvent::Finished { .. }) = events.recv().await {
                    break;
                }
            }
        })
        .await;
        assert!(finished.is_ok());
        assert!(f.mock.requests().is_empty());
        assert_eq!(status(&f.scheduler).await, ScheduleStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let f = fixture("2026-06-01T06:00:00+00:00", true).await;
        f.scheduler.add("06:00", "30").await.unwrap();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(f.scheduler.clone().run(cancel.clone()));
        wait_for("start", || f.mock.count("/start") == 1).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("engine stops after cancel")
            .unwrap();

        // The pending stop trigger is abandoned with the engine
        f.clock.set(at("2026-06-01T06:30:00+00:00"));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(f.mock.count("/stop"), 0);
    }
}
