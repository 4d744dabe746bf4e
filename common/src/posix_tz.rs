//! POSIX `TZ` strings, e.g. `CST6CDT,M3.2.0,M11.1.0` or `<+0530>-5:30`.
//!
//! The device hands these straight to the C library; this module exists so the
//! web boundary can reject malformed input and so non-device clocks can apply
//! the same rules.

use std::{fmt, str::FromStr};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};

use crate::{error::TimezoneError, types::LocalTime};

pub const UTC_POSIX: &str = "UTC0";

const DEFAULT_TRANSITION_SECS: i32 = 2 * 3600;
const MAX_ZONE_OFFSET_HOURS: u32 = 24;
const MAX_RULE_TIME_HOURS: u32 = 167;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosixTz {
    source: String,
    standard: Zone,
    daylight: Option<Daylight>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Zone {
    name: String,
    /// Seconds east of UTC (the opposite sign of the POSIX notation).
    utc_offset_secs: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Daylight {
    zone: Zone,
    start: Transition,
    end: Transition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    date: RuleDate,
    /// Local wall time of the switch, seconds after midnight. May be negative
    /// or exceed a day.
    time_secs: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleDate {
    /// `Jn`: 1-365, February 29 is never counted.
    JulianNoLeap(u32),
    /// `n`: 0-365, February 29 is counted in leap years.
    ZeroBased(u32),
    /// `Mm.w.d`: day `d` (0 = Sunday) of week `w` (5 = last) of month `m`.
    MonthWeekDay { month: u32, week: u32, weekday: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneOffset {
    pub utc_offset_secs: i32,
    pub is_dst: bool,
}

impl PosixTz {
    pub fn parse(input: &str) -> Result<Self, TimezoneError> {
        let source = input.trim();
        if source.is_empty() {
            return Err(TimezoneError::Empty);
        }

        let mut cursor = Cursor::new(source);
        let standard_name = cursor.name()?;
        let standard_offset = cursor.offset(MAX_ZONE_OFFSET_HOURS)?;
        let standard = Zone {
            name: standard_name,
            utc_offset_secs: -standard_offset,
        };

        if cursor.is_done() {
            return Ok(Self {
                source: source.to_string(),
                standard,
                daylight: None,
            });
        }

        let daylight_name = cursor.name()?;
        let daylight_offset = match cursor.peek() {
            None | Some(b',') => standard_offset - 3600,
            Some(_) => cursor.offset(MAX_ZONE_OFFSET_HOURS)?,
        };

        // Without explicit rules the C library falls back to the US rules.
        let (start, end) = if cursor.is_done() {
            (
                Transition {
                    date: RuleDate::MonthWeekDay {
                        month: 3,
                        week: 2,
                        weekday: 0,
                    },
                    time_secs: DEFAULT_TRANSITION_SECS,
                },
                Transition {
                    date: RuleDate::MonthWeekDay {
                        month: 11,
                        week: 1,
                        weekday: 0,
                    },
                    time_secs: DEFAULT_TRANSITION_SECS,
                },
            )
        } else {
            cursor.expect(b',')?;
            let start = cursor.transition()?;
            cursor.expect(b',')?;
            let end = cursor.transition()?;
            (start, end)
        };

        if !cursor.is_done() {
            return Err(TimezoneError::TrailingInput(cursor.pos));
        }

        Ok(Self {
            source: source.to_string(),
            standard,
            daylight: Some(Daylight {
                zone: Zone {
                    name: daylight_name,
                    utc_offset_secs: -daylight_offset,
                },
                start,
                end,
            }),
        })
    }

    pub fn utc() -> Self {
        Self {
            source: UTC_POSIX.to_string(),
            standard: Zone {
                name: "UTC".to_string(),
                utc_offset_secs: 0,
            },
            daylight: None,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn has_daylight_saving(&self) -> bool {
        self.daylight.is_some()
    }

    pub fn abbreviation(&self, is_dst: bool) -> &str {
        match (&self.daylight, is_dst) {
            (Some(daylight), true) => &daylight.zone.name,
            _ => &self.standard.name,
        }
    }

    pub fn offset_at(&self, utc: &NaiveDateTime) -> ZoneOffset {
        let standard = ZoneOffset {
            utc_offset_secs: self.standard.utc_offset_secs,
            is_dst: false,
        };
        let Some(daylight) = &self.daylight else {
            return standard;
        };

        let year = (*utc + Duration::seconds(i64::from(self.standard.utc_offset_secs))).year();
        let (Some(start_local), Some(end_local)) = (
            daylight.start.local_instant(year),
            daylight.end.local_instant(year),
        ) else {
            return standard;
        };

        // Start is expressed in standard time, end in daylight time.
        let start = start_local - Duration::seconds(i64::from(self.standard.utc_offset_secs));
        let end = end_local - Duration::seconds(i64::from(daylight.zone.utc_offset_secs));

        let in_dst = if start < end {
            start <= *utc && *utc < end
        } else {
            !(end <= *utc && *utc < start)
        };

        if in_dst {
            ZoneOffset {
                utc_offset_secs: daylight.zone.utc_offset_secs,
                is_dst: true,
            }
        } else {
            standard
        }
    }

    pub fn to_local(&self, utc: &NaiveDateTime) -> LocalTime {
        let offset = self.offset_at(utc);
        LocalTime {
            datetime: *utc + Duration::seconds(i64::from(offset.utc_offset_secs)),
            zone: self.abbreviation(offset.is_dst).to_string(),
        }
    }
}

impl FromStr for PosixTz {
    type Err = TimezoneError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl fmt::Display for PosixTz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Transition {
    fn local_instant(&self, year: i32) -> Option<NaiveDateTime> {
        let midnight = self.date.resolve(year)?.and_hms_opt(0, 0, 0)?;
        Some(midnight + Duration::seconds(i64::from(self.time_secs)))
    }
}

impl RuleDate {
    fn resolve(self, year: i32) -> Option<NaiveDate> {
        match self {
            Self::JulianNoLeap(day) => {
                let ordinal = if is_leap_year(year) && day >= 60 {
                    day + 1
                } else {
                    day
                };
                NaiveDate::from_yo_opt(year, ordinal)
            }
            Self::ZeroBased(day) => {
                let last = if is_leap_year(year) { 366 } else { 365 };
                NaiveDate::from_yo_opt(year, (day + 1).min(last))
            }
            Self::MonthWeekDay {
                month,
                week,
                weekday,
            } => {
                let first = NaiveDate::from_ymd_opt(year, month, 1)?;
                let first_weekday = first.weekday().num_days_from_sunday();
                let mut day = 1 + (weekday + 7 - first_weekday) % 7 + (week - 1) * 7;
                let last_day = days_in_month(year, month)?;
                while day > last_day {
                    day -= 7;
                }
                NaiveDate::from_ymd_opt(year, month, day)
            }
        }
    }
}

fn is_leap_year(year: i32) -> bool {
    NaiveDate::from_ymd_opt(year, 2, 29).is_some()
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }?;
    next.pred_opt().map(|last| last.day())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn is_done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), TimezoneError> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(TimezoneError::InvalidRule(self.pos))
        }
    }

    fn take_while(&mut self, accept: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&accept) {
            self.pos += 1;
        }
        // Only ASCII bytes are accepted, so the slice is valid UTF-8.
        std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or_default()
    }

    fn name(&mut self) -> Result<String, TimezoneError> {
        let start = self.pos;
        if self.eat(b'<') {
            let quoted =
                self.take_while(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-');
            if quoted.is_empty() || !self.eat(b'>') {
                return Err(TimezoneError::InvalidName(start));
            }
            return Ok(quoted.to_string());
        }

        let name = self.take_while(|b| b.is_ascii_alphabetic());
        if name.len() < 3 {
            return Err(TimezoneError::InvalidName(start));
        }
        Ok(name.to_string())
    }

    fn number(&mut self, max_digits: usize) -> Option<u32> {
        let start = self.pos;
        while self.pos - start < max_digits && self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .filter(|digits| !digits.is_empty())
            .and_then(|digits| digits.parse().ok())
    }

    /// `[+|-]hh[:mm[:ss]]` in seconds, sign as written.
    fn offset(&mut self, max_hours: u32) -> Result<i32, TimezoneError> {
        let start = self.pos;
        let invalid = TimezoneError::InvalidOffset(start);

        let sign = if self.eat(b'-') {
            -1
        } else {
            self.eat(b'+');
            1
        };
        let hours = self.number(3).ok_or(invalid.clone())?;
        let minutes = if self.eat(b':') {
            self.number(2).ok_or(invalid.clone())?
        } else {
            0
        };
        let seconds = if self.eat(b':') {
            self.number(2).ok_or(invalid.clone())?
        } else {
            0
        };

        if hours > max_hours || minutes > 59 || seconds > 59 {
            return Err(invalid);
        }
        Ok(sign * (hours * 3600 + minutes * 60 + seconds) as i32)
    }

    fn transition(&mut self) -> Result<Transition, TimezoneError> {
        let start = self.pos;
        let invalid = TimezoneError::InvalidRule(start);

        let date = if self.eat(b'J') {
            match self.number(3) {
                Some(day @ 1..=365) => RuleDate::JulianNoLeap(day),
                _ => return Err(invalid),
            }
        } else if self.eat(b'M') {
            let month = self.number(2).ok_or(invalid.clone())?;
            self.expect(b'.').map_err(|_| invalid.clone())?;
            let week = self.number(1).ok_or(invalid.clone())?;
            self.expect(b'.').map_err(|_| invalid.clone())?;
            let weekday = self.number(1).ok_or(invalid.clone())?;
            if !(1..=12).contains(&month) || !(1..=5).contains(&week) || weekday > 6 {
                return Err(invalid);
            }
            RuleDate::MonthWeekDay {
                month,
                week,
                weekday,
            }
        } else {
            match self.number(3) {
                Some(day @ 0..=365) => RuleDate::ZeroBased(day),
                _ => return Err(invalid),
            }
        };

        let time_secs = if self.eat(b'/') {
            self.offset(MAX_RULE_TIME_HOURS)
                .map_err(|_| TimezoneError::InvalidRule(start))?
        } else {
            DEFAULT_TRANSITION_SECS
        };

        Ok(Transition { date, time_secs })
    }
}
