//! Recording session tracked for the elapsed-time display

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The single logical recording session.
///
/// Several devices may be recording at once; the session only records when
/// the most recent successful start happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordingSession {
    pub started_at: Option<DateTime<Utc>>,
}

impl RecordingSession {
    pub fn is_active(&self) -> bool {
        self.started_at.is_some()
    }

    /// Mark the session active; an already running session keeps its start
    pub fn start(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        *self.started_at.get_or_insert(now)
    }

    /// Mark the session inactive, returning how long it ran
    pub fn stop(&mut self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.started_at.take().map(|start| now - start)
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.started_at.map(|start| now - start)
    }
}

/// Format a duration as `HH:MM:SS`, clamping negatives to zero
pub fn format_elapsed(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
