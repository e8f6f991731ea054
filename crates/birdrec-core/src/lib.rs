//! birdrec Core - Core types, device registry and schedule model
//!
//! This crate provides the foundational types for birdrec:
//! - Device types for recorders found on the local network
//! - Device registry holding the latest discovery snapshot
//! - Time-of-day schedule entries and their trigger rules
//! - Recording session state and a wall clock abstraction

pub mod clock;
pub mod device;
pub mod registry;
pub mod schedule;
pub mod session;

pub use clock::{parse_utc_offset, Clock, ManualClock, SystemClock};
pub use device::{
    Device, DeviceMetadata, DiscoveryMethod, MetadataResponse, RecordingFile, DEFAULT_HTTP_PORT,
};
pub use registry::{DeviceMap, DeviceRegistry, RegistryChange};
pub use schedule::{
    Schedule, ScheduleEntry, ScheduleError, ScheduleStatus, TimeOfDay, Triggered,
    MAX_DURATION_MINUTES,
};
pub use session::{format_elapsed, RecordingSession};
