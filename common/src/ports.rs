use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::NaiveDateTime;

use crate::{
    error::{NtpError, RtcError},
    types::{LocalTime, Meter, Rgb},
};

/// The process-wide runtime clock (`settimeofday`/`localtime` on device).
pub trait SystemClock {
    fn now_utc(&self) -> NaiveDateTime;

    /// Current time in whichever zone was last applied.
    fn local_now(&self) -> LocalTime;

    fn set_utc(&mut self, utc: NaiveDateTime);

    /// Reconfigures local-time conversion from a POSIX TZ string.
    fn apply_timezone(&mut self, posix: &str);
}

/// Background network time client. It sets the system clock on its own
/// cadence; the core only starts, stops and observes it.
pub trait NtpClient {
    /// `servers[0]` is the primary server.
    fn start(&mut self, servers: &[&str]) -> Result<(), NtpError>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// True exactly once after the client first set the clock.
    fn take_first_sync(&mut self) -> bool;
}

/// Turns a flag that a client callback raises on every sync into the
/// one-shot signal `take_first_sync` reports. Replace it on restart.
#[derive(Debug, Default)]
pub struct FirstSyncLatch {
    synced: Arc<AtomicBool>,
    reported: bool,
}

impl FirstSyncLatch {
    /// Handle for the sync callback, which may run on another thread.
    pub fn notifier(&self) -> Arc<AtomicBool> {
        self.synced.clone()
    }

    pub fn take(&mut self) -> bool {
        if self.reported || !self.synced.load(Ordering::Acquire) {
            return false;
        }
        self.reported = true;
        true
    }
}

/// Battery-backed real-time clock keeping UTC.
pub trait HardwareRtc {
    fn probe(&mut self) -> bool;

    /// The oscillator stopped at some point, so the stored time may be stale.
    fn lost_power(&mut self) -> Result<bool, RtcError>;

    fn read_utc(&mut self) -> Result<NaiveDateTime, RtcError>;

    fn write_utc(&mut self, utc: NaiveDateTime) -> Result<(), RtcError>;
}

/// PWM meter channels. Implementations clamp to the 0-1023 duty range.
pub trait MeterOutput {
    fn set_value(&mut self, meter: Meter, value: i32);
}

pub trait LightingOutput {
    fn set_all(&mut self, color: Rgb);

    /// Out-of-range indexes are ignored.
    fn set_pixel(&mut self, index: usize, color: Rgb);

    fn set_brightness(&mut self, brightness: u8);

    /// Pushes the staged frame to the strip.
    fn present(&mut self);
}

pub trait NetworkStatus {
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn first_sync_is_reported_once_across_repeated_callbacks() {
        let mut latch = FirstSyncLatch::default();
        let notifier = latch.notifier();
        assert_eq!(latch.take(), false);

        notifier.store(true, Ordering::Release);
        assert_eq!(latch.take(), true);

        notifier.store(true, Ordering::Release);
        assert_eq!(latch.take(), false);

        let mut restarted = FirstSyncLatch::default();
        restarted.notifier().store(true, Ordering::Release);
        assert_eq!(restarted.take(), true);
    }
}
