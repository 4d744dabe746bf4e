use serde::{Deserialize, Serialize};

use crate::{
    lighting::{LightingPalette, NightWindow},
    meter::{CalibrationRange, CalibrationRanges, DUTY_MAX},
    store::{read_or, KvBackend, Persisted, StoredValue},
    types::Rgb,
};

pub const NVS_NAMESPACE: &str = "clock-cfg";

pub const DEFAULT_TIMEZONE: &str = "CST6CDT,M3.2.0,M11.1.0";
pub const DEFAULT_SECONDARY_TIMEZONE: &str = "UTC0";
pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org";

/// 802.11 limits for station credentials.
pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASS_LEN: usize = 64;
/// Longest string value the device reads back from NVS, terminator excluded.
pub const MAX_STR_LEN: usize = 127;

/// Key names in the `clock-cfg` namespace. Existing devices carry these in
/// flash, so they must never be renamed or change type.
pub mod keys {
    pub const WIFI_SSID: &str = "ssid";
    pub const WIFI_PASS: &str = "pass";
    pub const TIMEZONE: &str = "tz";
    pub const TIMEZONE2: &str = "tz2";
    pub const NTP_SERVER: &str = "ntp";
    pub const TWELVE_HOUR: &str = "12h";
    pub const USE_NTP: &str = "useNTP";
    pub const MANUAL_TIME: &str = "manualTime";
    pub const DAY_COLOR: &str = "dayColor";
    pub const NIGHT_COLOR: &str = "nightColor";
    pub const DAY_BRIGHTNESS: &str = "dayBright";
    pub const NIGHT_BRIGHTNESS: &str = "nightBright";
    pub const NIGHT_START: &str = "nightStart";
    pub const NIGHT_START_MINUTE: &str = "nightStartMin";
    pub const NIGHT_END: &str = "nightEnd";
    pub const NIGHT_END_MINUTE: &str = "nightEndMin";
    pub const CAL_HOUR_MIN: &str = "calHMin";
    pub const CAL_HOUR_MAX: &str = "calHMax";
    pub const CAL_MINUTE_MIN: &str = "calMMin";
    pub const CAL_MINUTE_MAX: &str = "calMMax";
    pub const CAL_SECOND_MIN: &str = "calSMin";
    pub const CAL_SECOND_MAX: &str = "calSMax";
}

/// Every operator setting the clock persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSettings {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    /// Primary POSIX TZ string.
    pub timezone: String,
    pub timezone2: String,
    pub ntp_server: String,
    pub twelve_hour: bool,
    pub use_ntp: bool,
    /// Unix seconds of the last manually entered time.
    pub manual_time: u64,
    /// `0xRRGGBB`
    pub day_color: u32,
    pub night_color: u32,
    pub day_brightness: u8,
    pub night_brightness: u8,
    pub night: NightWindow,
    pub calibration: CalibrationRanges,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            timezone2: DEFAULT_SECONDARY_TIMEZONE.to_string(),
            ntp_server: DEFAULT_NTP_SERVER.to_string(),
            twelve_hour: true,
            use_ntp: true,
            manual_time: 0,
            day_color: 0xFF_FF_FF,
            night_color: 0xFF_00_FF,
            day_brightness: 200,
            night_brightness: 50,
            night: NightWindow::default(),
            calibration: CalibrationRanges::default(),
        }
    }
}

impl ClockSettings {
    pub fn load_from<B: KvBackend + ?Sized>(backend: &B) -> Self {
        let defaults = Self::default();
        let range = |min_key: &str, max_key: &str, default: CalibrationRange| CalibrationRange {
            min: read_or(backend, min_key, default.min),
            max: read_or(backend, max_key, default.max),
        };

        Self {
            wifi_ssid: read_or(backend, keys::WIFI_SSID, defaults.wifi_ssid),
            wifi_pass: read_or(backend, keys::WIFI_PASS, defaults.wifi_pass),
            timezone: read_or(backend, keys::TIMEZONE, defaults.timezone),
            timezone2: read_or(backend, keys::TIMEZONE2, defaults.timezone2),
            ntp_server: read_or(backend, keys::NTP_SERVER, defaults.ntp_server),
            twelve_hour: read_or(backend, keys::TWELVE_HOUR, defaults.twelve_hour),
            use_ntp: read_or(backend, keys::USE_NTP, defaults.use_ntp),
            manual_time: read_or(backend, keys::MANUAL_TIME, defaults.manual_time),
            day_color: read_or(backend, keys::DAY_COLOR, defaults.day_color),
            night_color: read_or(backend, keys::NIGHT_COLOR, defaults.night_color),
            day_brightness: read_or(backend, keys::DAY_BRIGHTNESS, defaults.day_brightness),
            night_brightness: read_or(
                backend,
                keys::NIGHT_BRIGHTNESS,
                defaults.night_brightness,
            ),
            night: NightWindow {
                start_hour: read_or(backend, keys::NIGHT_START, defaults.night.start_hour),
                start_minute: read_or(
                    backend,
                    keys::NIGHT_START_MINUTE,
                    defaults.night.start_minute,
                ),
                end_hour: read_or(backend, keys::NIGHT_END, defaults.night.end_hour),
                end_minute: read_or(backend, keys::NIGHT_END_MINUTE, defaults.night.end_minute),
            },
            calibration: CalibrationRanges {
                hour: range(
                    keys::CAL_HOUR_MIN,
                    keys::CAL_HOUR_MAX,
                    defaults.calibration.hour,
                ),
                minute: range(
                    keys::CAL_MINUTE_MIN,
                    keys::CAL_MINUTE_MAX,
                    defaults.calibration.minute,
                ),
                second: range(
                    keys::CAL_SECOND_MIN,
                    keys::CAL_SECOND_MAX,
                    defaults.calibration.second,
                ),
            },
        }
    }

    /// Every persisted field paired with its key, in a fixed order.
    pub fn entries(&self) -> Vec<(&'static str, StoredValue)> {
        let cal = &self.calibration;
        vec![
            (keys::WIFI_SSID, self.wifi_ssid.to_stored()),
            (keys::WIFI_PASS, self.wifi_pass.to_stored()),
            (keys::TIMEZONE, self.timezone.to_stored()),
            (keys::TIMEZONE2, self.timezone2.to_stored()),
            (keys::NTP_SERVER, self.ntp_server.to_stored()),
            (keys::TWELVE_HOUR, self.twelve_hour.to_stored()),
            (keys::USE_NTP, self.use_ntp.to_stored()),
            (keys::MANUAL_TIME, self.manual_time.to_stored()),
            (keys::DAY_COLOR, self.day_color.to_stored()),
            (keys::NIGHT_COLOR, self.night_color.to_stored()),
            (keys::DAY_BRIGHTNESS, self.day_brightness.to_stored()),
            (keys::NIGHT_BRIGHTNESS, self.night_brightness.to_stored()),
            (keys::NIGHT_START, self.night.start_hour.to_stored()),
            (keys::NIGHT_START_MINUTE, self.night.start_minute.to_stored()),
            (keys::NIGHT_END, self.night.end_hour.to_stored()),
            (keys::NIGHT_END_MINUTE, self.night.end_minute.to_stored()),
            (keys::CAL_HOUR_MIN, cal.hour.min.to_stored()),
            (keys::CAL_HOUR_MAX, cal.hour.max.to_stored()),
            (keys::CAL_MINUTE_MIN, cal.minute.min.to_stored()),
            (keys::CAL_MINUTE_MAX, cal.minute.max.to_stored()),
            (keys::CAL_SECOND_MIN, cal.second.min.to_stored()),
            (keys::CAL_SECOND_MAX, cal.second.max.to_stored()),
        ]
    }

    pub fn sanitize(&mut self) {
        self.day_color &= 0xFF_FF_FF;
        self.night_color &= 0xFF_FF_FF;
        self.night.sanitize();

        let max = DUTY_MAX as u16;
        for range in [
            &mut self.calibration.hour,
            &mut self.calibration.minute,
            &mut self.calibration.second,
        ] {
            range.min = range.min.min(max);
            range.max = range.max.min(max);
        }
    }

    pub fn palette(&self) -> LightingPalette {
        LightingPalette {
            day_color: Rgb::from_u32(self.day_color),
            day_brightness: self.day_brightness,
            night_color: Rgb::from_u32(self.night_color),
            night_brightness: self.night_brightness,
        }
    }

    pub fn has_station_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }

    /// Whether the stored credentials fit the radio's configuration fields.
    pub fn station_credentials_fit(&self) -> bool {
        credentials_fit(&self.wifi_ssid, &self.wifi_pass)
    }
}

pub fn credentials_fit(ssid: &str, pass: &str) -> bool {
    ssid.len() <= MAX_SSID_LEN && pass.len() <= MAX_PASS_LEN
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn entries_cover_every_key_once() {
        let entries = ClockSettings::default().entries();
        let mut names: Vec<&str> = entries.iter().map(|(key, _)| *key).collect();
        names.sort_unstable();
        names.dedup();

        assert_eq!(names.len(), entries.len());
        assert_eq!(entries.len(), 22);
        assert!(names.iter().all(|key| key.len() <= 15), "NVS key limit");
    }

    #[test]
    fn sanitize_clamps_out_of_range_fields() {
        let mut settings = ClockSettings::default();
        settings.night.start_hour = 30;
        settings.night.end_minute = 75;
        settings.calibration.minute.max = 4000;
        settings.day_color = 0xAB_12_34_56;

        settings.sanitize();

        assert_eq!(settings.night.start_hour, 23);
        assert_eq!(settings.night.end_minute, 59);
        assert_eq!(settings.calibration.minute.max, 1023);
        assert_eq!(settings.day_color, 0x12_34_56);
    }

    #[test]
    fn sanitize_keeps_inverted_calibration_ranges() {
        let mut settings = ClockSettings::default();
        settings.calibration.hour = CalibrationRange { min: 900, max: 100 };

        settings.sanitize();

        assert_eq!(settings.calibration.hour, CalibrationRange { min: 900, max: 100 });
    }

    #[test]
    fn oversized_credentials_do_not_fit_the_radio() {
        let mut settings = ClockSettings::default();
        settings.wifi_ssid = "S".repeat(MAX_SSID_LEN);
        settings.wifi_pass = "p".repeat(MAX_PASS_LEN);
        assert!(settings.station_credentials_fit());

        settings.wifi_ssid.push('S');
        assert!(!settings.station_credentials_fit());
        assert!(settings.has_station_credentials());

        assert!(!credentials_fit("attic", &"p".repeat(MAX_PASS_LEN + 1)));
    }
}
