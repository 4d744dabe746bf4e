pub mod api;
pub mod calibration;
pub mod clock;
pub mod config;
pub mod error;
pub mod lighting;
pub mod meter;
pub mod ports;
pub mod posix_tz;
pub mod service;
pub mod store;
pub mod time_source;
pub mod types;

#[cfg(test)]
mod testing;

pub use calibration::CalibrationOverride;
pub use clock::{ClockFrame, MeterClock, UI_TICK_INTERVAL_MS};
pub use config::ClockSettings;
pub use lighting::{LightingDecision, LightingPhase, LightingScheduler, NightWindow};
pub use meter::{MeterMapper, MeterValues};
pub use ports::{HardwareRtc, LightingOutput, MeterOutput, NetworkStatus, NtpClient, SystemClock};
pub use posix_tz::PosixTz;
pub use service::{ClockService, ServiceError};
pub use store::{ConfigStore, KvBackend, MemoryBackend, StoredValue, ValueKind};
pub use time_source::{TimeSource, TimeSourceState};
pub use types::{Meter, Rgb, WallClock};
