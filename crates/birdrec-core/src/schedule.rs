//! Time-of-day recording schedule
//!
//! Entries are matched against the wall clock at minute granularity. Times
//! carry no date, so a stop time that passes midnight wraps around to the
//! next day's `HH:MM` and is compared the same way as a start time.

use chrono::{Duration, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Longest accepted recording, one minute short of a full day so that a stop
/// time never lands on its own start minute.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60 - 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid time of day '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("Invalid duration '{0}', expected a whole number of minutes")]
    InvalidDuration(String),
    #[error("Duration must be between 1 and {max} minutes, got {0}", max = MAX_DURATION_MINUTES)]
    DurationOutOfRange(u32),
}

/// A wall-clock time at minute resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    /// Truncate any timestamp to its `HH:MM`
    pub fn from_time<T: Timelike>(t: &T) -> Self {
        Self(NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(NaiveTime::MIN))
    }

    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    pub fn minute(&self) -> u32 {
        self.0.minute()
    }

    /// Add minutes, wrapping past midnight
    pub fn add_minutes(&self, minutes: u32) -> Self {
        let (wrapped, _) = self
            .0
            .overflowing_add_signed(Duration::minutes(i64::from(minutes)));
        Self(wrapped)
    }
}

impl FromStr for TimeOfDay {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleError::InvalidTime(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;

        let digits = |part: &str, max_len: usize| {
            !part.is_empty() && part.len() <= max_len && part.bytes().all(|b| b.is_ascii_digit())
        };
        if !digits(h, 2) || !digits(m, 2) || m.len() != 2 {
            return Err(invalid());
        }

        let hour: u32 = h.parse().map_err(|_| invalid())?;
        let minute: u32 = m.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).ok_or_else(invalid)
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a user supplied duration in minutes
pub fn parse_duration_minutes(s: &str) -> Result<u32, ScheduleError> {
    let minutes: u32 = s
        .trim()
        .parse()
        .map_err(|_| ScheduleError::InvalidDuration(s.to_string()))?;
    validate_duration(minutes)
}

fn validate_duration(minutes: u32) -> Result<u32, ScheduleError> {
    if minutes == 0 || minutes > MAX_DURATION_MINUTES {
        return Err(ScheduleError::DurationOutOfRange(minutes));
    }
    Ok(minutes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    /// Waiting for its start minute
    Scheduled,
    /// Started, waiting for its stop minute
    Recording,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub time: TimeOfDay,
    pub duration_minutes: u32,
    pub status: ScheduleStatus,
}

impl ScheduleEntry {
    pub fn stop_time(&self) -> TimeOfDay {
        self.time.add_minutes(self.duration_minutes)
    }
}

/// An entry that matched the clock and was flipped to `Recording`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triggered {
    pub id: Uuid,
    pub start: TimeOfDay,
    /// Computed once when the entry fires
    pub stop: TimeOfDay,
}

/// Ordered list of schedule entries
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    entries: Vec<ScheduleEntry>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate raw user input and append a new entry.
    ///
    /// Nothing is mutated when either field is malformed.
    pub fn add(&mut self, time: &str, duration: &str) -> Result<ScheduleEntry, ScheduleError> {
        let time: TimeOfDay = time.parse()?;
        let minutes = parse_duration_minutes(duration)?;
        self.add_entry(time, minutes)
    }

    pub fn add_entry(
        &mut self,
        time: TimeOfDay,
        duration_minutes: u32,
    ) -> Result<ScheduleEntry, ScheduleError> {
        let duration_minutes = validate_duration(duration_minutes)?;
        let entry = ScheduleEntry {
            id: Uuid::new_v4(),
            time,
            duration_minutes,
            status: ScheduleStatus::Scheduled,
        };
        info!(time = %entry.time, duration = duration_minutes, "Schedule entry added");
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Remove the entry at `index`, warning when there is nothing there
    pub fn remove(&mut self, index: usize) -> Option<ScheduleEntry> {
        if index >= self.entries.len() {
            warn!(
                index = index,
                len = self.entries.len(),
                "No schedule entry at index"
            );
            return None;
        }
        let entry = self.entries.remove(index);
        info!(time = %entry.time, "Schedule entry removed");
        Some(entry)
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn get(&self, id: Uuid) -> Option<&ScheduleEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fire every `Scheduled` entry whose time equals `now`.
    ///
    /// Fired entries become `Recording`, so polling again within the same
    /// minute returns nothing new.
    pub fn trigger_due(&mut self, now: TimeOfDay) -> Vec<Triggered> {
        self.entries
            .iter_mut()
            .filter(|e| e.status == ScheduleStatus::Scheduled && e.time == now)
            .map(|e| {
                e.status = ScheduleStatus::Recording;
                Triggered {
                    id: e.id,
                    start: e.time,
                    stop: e.stop_time(),
                }
            })
            .collect()
    }

    /// Return a `Recording` entry to `Scheduled`; false if it is gone
    pub fn finish(&mut self, id: Uuid) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.status = ScheduleStatus::Scheduled;
                true
            }
            None => false,
        }
    }
}
