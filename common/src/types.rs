use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Clock readings from years up to and including this one are treated as
/// "never set" (an RTC or system clock that still counts from its epoch).
pub const LAST_UNSET_YEAR: i32 = 2020;

pub const METER_COUNT: usize = 3;

pub fn is_plausible_year(year: i32) -> bool {
    year > LAST_UNSET_YEAR
}

/// Folds a 0-23 hour onto a 12-hour dial, with midnight and noon shown as 12.
pub fn fold_to_12(hour24: u8) -> u8 {
    match hour24 % 12 {
        0 => 12,
        hour => hour,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Meter {
    Hour,
    Minute,
    Second,
}

impl Meter {
    pub const ALL: [Meter; METER_COUNT] = [Meter::Hour, Meter::Minute, Meter::Second];

    pub fn index(self) -> usize {
        match self {
            Self::Hour => 0,
            Self::Minute => 1,
            Self::Second => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Hour),
            1 => Some(Self::Minute),
            2 => Some(Self::Second),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Minute => "minute",
            Self::Second => "second",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const RED: Rgb = Rgb::new(0xFF, 0, 0);
    pub const WHITE: Rgb = Rgb::new(0xFF, 0xFF, 0xFF);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Unpacks a `0xRRGGBB` value; the top byte is ignored.
    pub const fn from_u32(packed: u32) -> Self {
        Self {
            r: ((packed >> 16) & 0xFF) as u8,
            g: ((packed >> 8) & 0xFF) as u8,
            b: (packed & 0xFF) as u8,
        }
    }

    pub const fn to_u32(self) -> u32 {
        ((self.r as u32) << 16) | ((self.g as u32) << 8) | self.b as u32
    }

    /// Scales every channel by `brightness / 256`, keeping full brightness lossless.
    pub fn scale(self, brightness: u8) -> Self {
        let scale = |channel: u8| ((channel as u16 * (brightness as u16 + 1)) >> 8) as u8;
        Self {
            r: scale(self.r),
            g: scale(self.g),
            b: scale(self.b),
        }
    }

    pub fn to_hex(self) -> String {
        format!("#{:06X}", self.to_u32())
    }

    /// Accepts `#RRGGBB` or `RRGGBB`, case-insensitive.
    pub fn parse_hex(value: &str) -> Option<Self> {
        let digits = value.trim().trim_start_matches('#');
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        u32::from_str_radix(digits, 16).ok().map(Self::from_u32)
    }
}

/// A broken-down reading of the authoritative clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WallClock {
    pub hour24: u8,
    pub hour12: u8,
    pub minute: u8,
    pub second: u8,
    #[serde(rename = "isValid")]
    pub is_valid: bool,
}

impl WallClock {
    pub fn from_local(local: &NaiveDateTime) -> Self {
        let hour24 = local.hour() as u8;
        Self {
            hour24,
            hour12: fold_to_12(hour24),
            minute: local.minute() as u8,
            second: local.second() as u8,
            is_valid: is_plausible_year(local.year()),
        }
    }

    /// The hour as the dial shows it in the selected display mode.
    pub fn display_hour(&self, twelve_hour: bool) -> u8 {
        if twelve_hour {
            self.hour12
        } else {
            self.hour24
        }
    }
}

/// Local time as reported by the runtime clock, with the abbreviation of the
/// zone rule in effect at that instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTime {
    pub datetime: NaiveDateTime,
    pub zone: String,
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn folds_hours_onto_twelve_hour_dial() {
        assert_eq!(fold_to_12(0), 12);
        assert_eq!(fold_to_12(12), 12);
        assert_eq!(fold_to_12(13), 1);
        assert_eq!(fold_to_12(23), 11);

        for hour in 0..24 {
            assert!((1..=12).contains(&fold_to_12(hour)), "hour {hour}");
        }
    }

    #[test]
    fn wall_clock_is_invalid_until_after_2020() {
        let unset = NaiveDate::from_ymd_opt(2020, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 59)
            .unwrap();
        assert!(!WallClock::from_local(&unset).is_valid);

        let set = NaiveDate::from_ymd_opt(2021, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let clock = WallClock::from_local(&set);
        assert!(clock.is_valid);
        assert_eq!(clock.hour24, 0);
        assert_eq!(clock.hour12, 12);
    }

    #[test]
    fn parses_and_formats_hex_colors() {
        assert_eq!(Rgb::parse_hex("#FF00ff"), Some(Rgb::new(0xFF, 0, 0xFF)));
        assert_eq!(Rgb::parse_hex("102030"), Some(Rgb::new(0x10, 0x20, 0x30)));
        assert_eq!(Rgb::parse_hex("#12345"), None);
        assert_eq!(Rgb::parse_hex("#GG0000"), None);
        assert_eq!(Rgb::new(1, 2, 3).to_hex(), "#010203");
    }

    #[test]
    fn scaling_keeps_full_brightness_and_blanks_at_zero() {
        let color = Rgb::new(200, 100, 1);
        assert_eq!(color.scale(255), color);
        assert_eq!(color.scale(0), Rgb::BLACK);
        assert_eq!(Rgb::WHITE.scale(127), Rgb::new(127, 127, 127));
    }
}
