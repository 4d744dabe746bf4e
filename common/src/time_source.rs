use chrono::{DateTime, Datelike, NaiveDateTime};
use log::{info, warn};
use serde::Serialize;

use crate::{
    config::{ClockSettings, DEFAULT_TIMEZONE},
    error::ManualTimeError,
    ports::{HardwareRtc, NtpClient, SystemClock},
    posix_tz::UTC_POSIX,
    types::{is_plausible_year, WallClock},
};

/// Cadence of system-clock-to-RTC writes while the clock is valid.
pub const RTC_WRITE_INTERVAL_MS: u64 = 3_600_000;
pub const FALLBACK_NTP_SERVER: &str = "time.google.com";
pub const TIME_NOT_SET: &str = "Time Not Set";

const DISPLAY_FORMAT: &str = "%H:%M:%S %B-%d-%Y";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSourceState {
    pub ntp_enabled: bool,
    pub utc_override_active: bool,
    /// Monotonic milliseconds of the last RTC write (or of startup).
    pub last_rtc_sync_ms: u64,
    pub rtc_present: bool,
}

/// Reconciles network time, the hardware RTC and manual entry into the one
/// runtime clock everything else reads.
#[derive(Debug)]
pub struct TimeSource<C, N, R> {
    clock: C,
    ntp: N,
    rtc: R,
    state: TimeSourceState,
}

/// Servers handed to the NTP client, public fallback first.
pub fn ntp_servers(settings: &ClockSettings) -> Vec<&str> {
    let configured = settings.ntp_server.trim();
    let mut servers = vec![FALLBACK_NTP_SERVER];
    if !configured.is_empty() && configured != FALLBACK_NTP_SERVER {
        servers.push(configured);
    }
    servers
}

fn primary_timezone(settings: &ClockSettings) -> &str {
    let configured = settings.timezone.trim();
    if configured.is_empty() {
        DEFAULT_TIMEZONE
    } else {
        configured
    }
}

impl<C, N, R> TimeSource<C, N, R>
where
    C: SystemClock,
    N: NtpClient,
    R: HardwareRtc,
{
    pub fn new(clock: C, ntp: N, rtc: R) -> Self {
        Self {
            clock,
            ntp,
            rtc,
            state: TimeSourceState::default(),
        }
    }

    pub fn initialize(&mut self, settings: &ClockSettings, now_ms: u64) {
        self.clock.apply_timezone(primary_timezone(settings));

        if settings.use_ntp {
            self.start_ntp(settings);
        } else {
            info!("NTP disabled; using RTC and manual time");
        }

        self.state.rtc_present = self.rtc.probe();
        if self.state.rtc_present {
            info!("RTC found");
            self.seed_from_rtc();
        } else {
            warn!("RTC not found; time will not survive power loss");
        }
        self.state.last_rtc_sync_ms = now_ms;
    }

    /// The RTC is trusted even after a power loss as long as its date is
    /// plausible; a stale clock beats no clock until the network answers.
    fn seed_from_rtc(&mut self) {
        match self.rtc.lost_power() {
            Ok(true) => warn!("RTC lost power; stored time may be stale"),
            Ok(false) => {}
            Err(err) => warn!("RTC power-loss check failed: {err}"),
        }

        match self.rtc.read_utc() {
            Ok(utc) if is_plausible_year(utc.year()) => {
                self.clock.set_utc(utc);
                info!("system clock seeded from RTC: {utc}");
            }
            Ok(utc) => warn!("RTC time {utc} is not plausible; not seeding"),
            Err(err) => warn!("RTC read failed: {err}"),
        }
    }

    /// Never touches the network itself; the client resolves and polls on
    /// its own task.
    fn start_ntp(&mut self, settings: &ClockSettings) {
        let servers = ntp_servers(settings);
        match self.ntp.start(&servers) {
            Ok(()) => info!("NTP enabled with {servers:?}"),
            Err(err) => warn!("{err}"),
        }
        self.state.ntp_enabled = true;
    }

    /// Runs every loop iteration, independent of the UI tick.
    pub fn tick(&mut self, now_ms: u64) {
        if self.ntp.take_first_sync() {
            info!("first NTP sync: {}", self.formatted_time());
            if self.state.rtc_present {
                self.write_rtc(now_ms);
            }
            return;
        }

        if self.state.rtc_present
            && self.is_time_set()
            && now_ms.saturating_sub(self.state.last_rtc_sync_ms) > RTC_WRITE_INTERVAL_MS
        {
            self.write_rtc(now_ms);
        }
    }

    /// A failed write still restarts the interval, so a broken RTC costs one
    /// bus transaction per hour rather than one per loop.
    fn write_rtc(&mut self, now_ms: u64) {
        let utc = self.clock.now_utc();
        match self.rtc.write_utc(utc) {
            Ok(()) => info!("RTC updated to {utc}"),
            Err(err) => warn!("RTC write failed: {err}"),
        }
        self.state.last_rtc_sync_ms = now_ms;
    }

    pub fn set_use_ntp(&mut self, enabled: bool, settings: &ClockSettings) {
        if enabled {
            self.start_ntp(settings);
            if !self.state.utc_override_active {
                self.clock.apply_timezone(primary_timezone(settings));
            }
        } else {
            self.stop_ntp();
        }
    }

    fn stop_ntp(&mut self) {
        self.ntp.stop();
        self.state.ntp_enabled = false;
        info!("NTP disabled");
    }

    /// Switches between the primary zone and UTC. Returns whether the
    /// runtime clock was reconfigured.
    pub fn set_secondary_timezone_override(
        &mut self,
        enabled: bool,
        settings: &ClockSettings,
    ) -> bool {
        if enabled == self.state.utc_override_active {
            return false;
        }
        self.state.utc_override_active = enabled;
        self.reapply_timezone(settings);
        info!(
            "timezone switched to {}",
            if enabled { "UTC" } else { "primary" }
        );
        true
    }

    /// Re-applies whichever zone is selected, e.g. after the operator edited
    /// the primary timezone string.
    pub fn reapply_timezone(&mut self, settings: &ClockSettings) {
        if self.state.utc_override_active {
            self.clock.apply_timezone(UTC_POSIX);
        } else {
            self.clock.apply_timezone(primary_timezone(settings));
        }
    }

    pub fn current_wall_clock(&self) -> WallClock {
        WallClock::from_local(&self.clock.local_now().datetime)
    }

    pub fn is_time_set(&self) -> bool {
        self.current_wall_clock().is_valid
    }

    pub fn formatted_time(&self) -> String {
        let local = self.clock.local_now();
        if !is_plausible_year(local.datetime.year()) {
            return TIME_NOT_SET.to_string();
        }
        format!("{} {}", local.datetime.format(DISPLAY_FORMAT), local.zone)
    }

    /// Sets the clock from operator input and stops NTP so it cannot
    /// overwrite the entry. Persisting the choice is the caller's job.
    pub fn set_manual_time(
        &mut self,
        epoch_secs: i64,
        now_ms: u64,
    ) -> Result<NaiveDateTime, ManualTimeError> {
        let utc = DateTime::from_timestamp(epoch_secs, 0)
            .ok_or(ManualTimeError::Unrepresentable(epoch_secs))?
            .naive_utc();
        if !is_plausible_year(utc.year()) {
            return Err(ManualTimeError::Implausible(epoch_secs));
        }

        if self.state.ntp_enabled {
            self.stop_ntp();
        }
        self.clock.set_utc(utc);
        info!("manual time set: {utc} UTC");

        if self.state.rtc_present {
            self.write_rtc(now_ms);
        }
        Ok(utc)
    }

    pub fn state(&self) -> TimeSourceState {
        self.state
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn ntp(&self) -> &N {
        &self.ntp
    }

    pub fn ntp_mut(&mut self) -> &mut N {
        &mut self.ntp
    }

    pub fn rtc(&self) -> &R {
        &self.rtc
    }

    pub fn rtc_mut(&mut self) -> &mut R {
        &mut self.rtc
    }
}
