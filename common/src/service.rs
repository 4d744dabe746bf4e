use chrono::NaiveDateTime;
use log::{info, warn};
use thiserror::Error;

use crate::{
    api::{ClockStatus, SettingsChange, SettingsError, SettingsUpdate},
    calibration::CalibrationOverride,
    clock::{ClockFrame, MeterClock},
    config::ClockSettings,
    error::{CalibrationError, ManualTimeError, StoreError},
    ports::{HardwareRtc, LightingOutput, MeterOutput, NetworkStatus, NtpClient, SystemClock},
    store::{ConfigStore, KvBackend},
    time_source::ntp_servers,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    ManualTime(#[from] ManualTimeError),
    #[error("failed to persist settings: {0}")]
    Store(#[from] StoreError),
}

impl ServiceError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Calibration(CalibrationError::Inactive) => 409,
            Self::Settings(_) | Self::Calibration(_) | Self::ManualTime(_) => 400,
            Self::Store(_) => 500,
        }
    }
}

/// Everything the control loop and the web handlers share: persisted
/// settings, calibration state and the clock itself.
///
/// Callers hold it behind one lock; every operation here is short and
/// never blocks on the network.
#[derive(Debug)]
pub struct ClockService<B, C, N, R> {
    store: ConfigStore<B>,
    calibration: CalibrationOverride,
    clock: MeterClock<C, N, R>,
}

impl<B, C, N, R> ClockService<B, C, N, R>
where
    B: KvBackend,
    C: SystemClock,
    N: NtpClient,
    R: HardwareRtc,
{
    pub fn new(store: ConfigStore<B>, clock: MeterClock<C, N, R>) -> Self {
        Self {
            store,
            calibration: CalibrationOverride::new(),
            clock,
        }
    }

    pub fn start(&mut self, now_ms: u64) {
        self.clock.start(self.store.settings(), now_ms);
    }

    pub fn settings(&self) -> &ClockSettings {
        self.store.settings()
    }

    pub fn calibration(&self) -> &CalibrationOverride {
        &self.calibration
    }

    pub fn clock(&self) -> &MeterClock<C, N, R> {
        &self.clock
    }

    pub fn tick<W, M, L>(
        &mut self,
        now_ms: u64,
        utc_switch: bool,
        network: &W,
        meters: &mut M,
        lights: &mut L,
    ) -> Option<ClockFrame>
    where
        W: NetworkStatus + ?Sized,
        M: MeterOutput + ?Sized,
        L: LightingOutput + ?Sized,
    {
        let settings = self.store.settings();
        self.clock.set_utc_override(utc_switch, settings);
        self.clock
            .tick(now_ms, settings, &self.calibration, network, meters, lights)
            .copied()
    }

    /// Servers the NTP client is polling, empty while NTP is off. Callers
    /// look these up for diagnostics after releasing the lock.
    pub fn active_ntp_servers(&self) -> Vec<String> {
        if !self.clock.time_source().state().ntp_enabled {
            return Vec::new();
        }
        ntp_servers(self.store.settings())
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn status(&self, network_connected: bool) -> ClockStatus {
        ClockStatus::capture(&self.clock, &self.calibration, network_connected)
    }

    /// Validates, applies and persists a settings edit. The in-memory copy
    /// and the clock follow the edit even when flash fails.
    pub fn update_settings(
        &mut self,
        update: &SettingsUpdate,
    ) -> Result<SettingsChange, ServiceError> {
        update.validate()?;

        let mut change = SettingsChange::default();
        let persisted = self.store.update(|settings| change = update.apply(settings));

        let settings = self.store.settings();
        let time = self.clock.time_source_mut();
        if change.timezone_changed {
            time.reapply_timezone(settings);
        }
        if change.ntp_changed {
            time.set_use_ntp(settings.use_ntp, settings);
        }

        match persisted {
            Ok(written) => {
                info!("settings updated ({written} keys written)");
                Ok(change)
            }
            Err(err) => {
                warn!("settings update not persisted: {err}");
                Err(err.into())
            }
        }
    }

    pub fn set_calibration_active(&mut self, active: bool) {
        self.calibration.set_active(active);
    }

    pub fn preview_calibration(&mut self, index: usize, value: i32) -> Result<(), ServiceError> {
        self.calibration.set_override(index, value)?;
        Ok(())
    }

    pub fn set_manual_time(
        &mut self,
        epoch_secs: i64,
        now_ms: u64,
    ) -> Result<NaiveDateTime, ServiceError> {
        let utc = self
            .clock
            .time_source_mut()
            .set_manual_time(epoch_secs, now_ms)?;
        // The clock only accepts post-2020 timestamps, so this is positive.
        self.store.set_manual_time(epoch_secs.unsigned_abs())?;
        Ok(utc)
    }

    pub fn set_use_ntp(&mut self, enabled: bool) -> Result<(), ServiceError> {
        let persisted = self.store.set_use_ntp(enabled);
        self.clock
            .time_source_mut()
            .set_use_ntp(enabled, self.store.settings());
        persisted?;
        Ok(())
    }
}
