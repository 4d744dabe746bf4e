//! JSON shapes and request validation shared by the host and device web
//! servers. Handlers stay thin: parse, call into the core, render.

use std::collections::HashMap;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    calibration::{CalibrationOverride, CalibrationSnapshot},
    clock::{ClockFrame, MeterClock},
    config::{ClockSettings, MAX_PASS_LEN, MAX_SSID_LEN, MAX_STR_LEN},
    error::TimezoneError,
    lighting::LightingPhase,
    meter::{CalibrationRanges, MeterValues},
    ports::{HardwareRtc, NtpClient, SystemClock},
    posix_tz::PosixTz,
    time_source::TimeSourceState,
    types::{Rgb, WallClock},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("{field} is not a valid POSIX timezone: {source}")]
    InvalidTimezone {
        field: &'static str,
        source: TimezoneError,
    },
    #[error("{field} must be a #RRGGBB color")]
    InvalidColor { field: &'static str },
    #[error("wifiSsid cannot be empty")]
    EmptySsid,
    #[error("{field} must be at most {max} bytes")]
    TooLong { field: &'static str, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsView {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    pub wifi_pass_set: bool,
    pub timezone: String,
    pub timezone2: String,
    #[serde(rename = "ntpServer")]
    pub ntp_server: String,
    #[serde(rename = "twelveHour")]
    pub twelve_hour: bool,
    #[serde(rename = "useNtp")]
    pub use_ntp: bool,
    #[serde(rename = "manualTime")]
    pub manual_time: u64,
    #[serde(rename = "dayColor")]
    pub day_color: String,
    #[serde(rename = "nightColor")]
    pub night_color: String,
    #[serde(rename = "dayBrightness")]
    pub day_brightness: u8,
    #[serde(rename = "nightBrightness")]
    pub night_brightness: u8,
    #[serde(rename = "nightStart")]
    pub night_start: String,
    #[serde(rename = "nightEnd")]
    pub night_end: String,
    pub calibration: CalibrationRanges,
}

impl SettingsView {
    pub fn from_settings(settings: &ClockSettings) -> Self {
        Self {
            wifi_ssid: settings.wifi_ssid.clone(),
            wifi_pass_set: !settings.wifi_pass.is_empty(),
            timezone: settings.timezone.clone(),
            timezone2: settings.timezone2.clone(),
            ntp_server: settings.ntp_server.clone(),
            twelve_hour: settings.twelve_hour,
            use_ntp: settings.use_ntp,
            manual_time: settings.manual_time,
            day_color: Rgb::from_u32(settings.day_color).to_hex(),
            night_color: Rgb::from_u32(settings.night_color).to_hex(),
            day_brightness: settings.day_brightness,
            night_brightness: settings.night_brightness,
            night_start: format_time_of_day(settings.night.start_hour, settings.night.start_minute),
            night_end: format_time_of_day(settings.night.end_hour, settings.night.end_minute),
            calibration: settings.calibration,
        }
    }
}

/// Partial settings edit. Absent fields are left alone; an empty password
/// is treated as absent so the page can round-trip without re-entering it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    #[serde(rename = "wifiSsid", default)]
    pub wifi_ssid: Option<String>,
    #[serde(rename = "wifiPass", default)]
    pub wifi_pass: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub timezone2: Option<String>,
    #[serde(rename = "ntpServer", default)]
    pub ntp_server: Option<String>,
    #[serde(rename = "twelveHour", default)]
    pub twelve_hour: Option<bool>,
    #[serde(rename = "useNtp", default)]
    pub use_ntp: Option<bool>,
    #[serde(rename = "dayColor", default)]
    pub day_color: Option<String>,
    #[serde(rename = "nightColor", default)]
    pub night_color: Option<String>,
    #[serde(rename = "dayBrightness", default)]
    pub day_brightness: Option<u8>,
    #[serde(rename = "nightBrightness", default)]
    pub night_brightness: Option<u8>,
    #[serde(rename = "nightStart", default)]
    pub night_start: Option<String>,
    #[serde(rename = "nightEnd", default)]
    pub night_end: Option<String>,
    #[serde(default)]
    pub calibration: Option<CalibrationRanges>,
}

/// Which side effects a persisted edit needs beyond the next tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SettingsChange {
    #[serde(rename = "timezoneChanged")]
    pub timezone_changed: bool,
    #[serde(rename = "ntpChanged")]
    pub ntp_changed: bool,
    #[serde(rename = "restartRequired")]
    pub restart_required: bool,
}

impl SettingsUpdate {
    pub fn validate(&self) -> Result<(), SettingsError> {
        for (field, value, max) in [
            ("wifiSsid", self.wifi_ssid.as_deref().map(str::trim), MAX_SSID_LEN),
            ("wifiPass", self.wifi_pass.as_deref(), MAX_PASS_LEN),
            ("timezone", self.timezone.as_deref().map(str::trim), MAX_STR_LEN),
            ("timezone2", self.timezone2.as_deref().map(str::trim), MAX_STR_LEN),
            ("ntpServer", self.ntp_server.as_deref().map(str::trim), MAX_STR_LEN),
        ] {
            if value.is_some_and(|value| value.len() > max) {
                return Err(SettingsError::TooLong { field, max });
            }
        }
        for (field, value) in [
            ("timezone", &self.timezone),
            ("timezone2", &self.timezone2),
        ] {
            if let Some(value) = value {
                PosixTz::parse(value)
                    .map_err(|source| SettingsError::InvalidTimezone { field, source })?;
            }
        }
        for (field, value) in [("dayColor", &self.day_color), ("nightColor", &self.night_color)] {
            if value.as_deref().is_some_and(|hex| Rgb::parse_hex(hex).is_none()) {
                return Err(SettingsError::InvalidColor { field });
            }
        }
        if self
            .wifi_ssid
            .as_deref()
            .is_some_and(|ssid| ssid.trim().is_empty())
        {
            return Err(SettingsError::EmptySsid);
        }
        Ok(())
    }

    /// Applies a validated update. Unparseable night times are skipped.
    pub fn apply(&self, settings: &mut ClockSettings) -> SettingsChange {
        let before = settings.clone();

        if let Some(ssid) = &self.wifi_ssid {
            settings.wifi_ssid = ssid.trim().to_string();
        }
        if let Some(pass) = self.wifi_pass.as_ref().filter(|pass| !pass.is_empty()) {
            settings.wifi_pass = pass.clone();
        }
        if let Some(timezone) = &self.timezone {
            settings.timezone = timezone.trim().to_string();
        }
        if let Some(timezone) = &self.timezone2 {
            settings.timezone2 = timezone.trim().to_string();
        }
        if let Some(server) = &self.ntp_server {
            settings.ntp_server = server.trim().to_string();
        }
        if let Some(twelve_hour) = self.twelve_hour {
            settings.twelve_hour = twelve_hour;
        }
        if let Some(use_ntp) = self.use_ntp {
            settings.use_ntp = use_ntp;
        }
        if let Some(color) = self.day_color.as_deref().and_then(Rgb::parse_hex) {
            settings.day_color = color.to_u32();
        }
        if let Some(color) = self.night_color.as_deref().and_then(Rgb::parse_hex) {
            settings.night_color = color.to_u32();
        }
        if let Some(brightness) = self.day_brightness {
            settings.day_brightness = brightness;
        }
        if let Some(brightness) = self.night_brightness {
            settings.night_brightness = brightness;
        }
        if let Some(value) = &self.night_start {
            match parse_time_of_day(value) {
                Some((hour, minute)) => {
                    settings.night.start_hour = hour;
                    settings.night.start_minute = minute;
                }
                None => warn!("ignoring night start `{value}`"),
            }
        }
        if let Some(value) = &self.night_end {
            match parse_time_of_day(value) {
                Some((hour, minute)) => {
                    settings.night.end_hour = hour;
                    settings.night.end_minute = minute;
                }
                None => warn!("ignoring night end `{value}`"),
            }
        }
        if let Some(calibration) = self.calibration {
            settings.calibration = calibration;
        }

        SettingsChange {
            timezone_changed: before.timezone != settings.timezone,
            ntp_changed: before.use_ntp != settings.use_ntp
                || before.ntp_server != settings.ntp_server,
            restart_required: before.wifi_ssid != settings.wifi_ssid
                || before.wifi_pass != settings.wifi_pass,
        }
    }
}

/// `HH:MM` in 24-hour time.
pub fn parse_time_of_day(value: &str) -> Option<(u8, u8)> {
    let (hour, minute) = value.trim().split_once(':')?;
    let hour: u8 = hour.parse().ok()?;
    let minute: u8 = minute.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

pub fn format_time_of_day(hour: u8, minute: u8) -> String {
    format!("{hour:02}:{minute:02}")
}

/// Accepts `1/0`, `true/false` and `on/off`.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Splits the query part of a request URI into key/value pairs. Values are
/// numbers and flags, so no percent-decoding is done.
pub fn parse_query(uri: &str) -> HashMap<String, String> {
    let Some((_, query)) = uri.split_once('?') else {
        return HashMap::new();
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ClockStatus {
    pub time: String,
    #[serde(rename = "timeSet")]
    pub time_set: bool,
    #[serde(rename = "wallClock")]
    pub wall_clock: WallClock,
    #[serde(rename = "networkConnected")]
    pub network_connected: bool,
    pub lighting: Option<LightingPhase>,
    pub meters: Option<MeterValues>,
    pub calibration: CalibrationSnapshot,
    #[serde(rename = "timeSource")]
    pub time_source: TimeSourceState,
}

impl ClockStatus {
    pub fn capture<C, N, R>(
        clock: &MeterClock<C, N, R>,
        calibration: &CalibrationOverride,
        network_connected: bool,
    ) -> Self
    where
        C: SystemClock,
        N: NtpClient,
        R: HardwareRtc,
    {
        let time = clock.time_source();
        let frame: Option<&ClockFrame> = clock.last_frame();
        Self {
            time: time.formatted_time(),
            time_set: time.is_time_set(),
            wall_clock: time.current_wall_clock(),
            network_connected,
            lighting: frame.map(|frame| frame.lighting),
            meters: frame.map(|frame| frame.meters),
            calibration: calibration.snapshot(),
            time_source: time.state(),
        }
    }
}
