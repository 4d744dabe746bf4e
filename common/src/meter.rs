use serde::{Deserialize, Serialize};

use crate::{
    calibration::CalibrationOverride,
    config::ClockSettings,
    types::{Meter, WallClock},
};

pub const DUTY_MIN: i32 = 0;
/// Full scale of the 10-bit PWM channels.
pub const DUTY_MAX: i32 = 1023;

const HOURS_12: i32 = 12;
const HOURS_24: i32 = 24;
const SIXTY: i32 = 60;

/// Linear re-scale of `value` from `[in_min, in_max]` onto `[out_min, out_max]`.
///
/// Integer arithmetic, truncating toward zero. The result is not clamped, and
/// `out_min > out_max` simply runs the scale backwards. A degenerate input span
/// maps everything to `out_min`.
pub fn map_range(value: i32, in_min: i32, in_max: i32, out_min: i32, out_max: i32) -> i32 {
    let span = i64::from(in_max) - i64::from(in_min);
    if span == 0 {
        return out_min;
    }
    let scaled = (i64::from(value) - i64::from(in_min)) * (i64::from(out_max) - i64::from(out_min))
        / span;
    (scaled + i64::from(out_min)).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Output drivers accept any mapped value and pin it to the PWM range here.
pub fn clamp_duty(value: i32) -> u16 {
    value.clamp(DUTY_MIN, DUTY_MAX) as u16
}

/// Operator-tuned duty bounds for one meter. `min > max` is legal and
/// reverses the needle direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationRange {
    pub min: u16,
    pub max: u16,
}

impl Default for CalibrationRange {
    fn default() -> Self {
        Self {
            min: 0,
            max: DUTY_MAX as u16,
        }
    }
}

impl CalibrationRange {
    pub fn map(&self, value: i32, in_min: i32, in_max: i32) -> i32 {
        map_range(
            value,
            in_min,
            in_max,
            i32::from(self.min),
            i32::from(self.max),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalibrationRanges {
    pub hour: CalibrationRange,
    pub minute: CalibrationRange,
    pub second: CalibrationRange,
}

impl CalibrationRanges {
    pub fn get(&self, meter: Meter) -> CalibrationRange {
        match meter {
            Meter::Hour => self.hour,
            Meter::Minute => self.minute,
            Meter::Second => self.second,
        }
    }
}

/// Duties for the three meters, before driver clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MeterValues {
    pub hour: i32,
    pub minute: i32,
    pub second: i32,
}

impl MeterValues {
    pub fn get(&self, meter: Meter) -> i32 {
        match meter {
            Meter::Hour => self.hour,
            Meter::Minute => self.minute,
            Meter::Second => self.second,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterMapper {
    pub twelve_hour: bool,
    pub ranges: CalibrationRanges,
}

impl MeterMapper {
    pub fn new(twelve_hour: bool, ranges: CalibrationRanges) -> Self {
        Self {
            twelve_hour,
            ranges,
        }
    }

    pub fn from_settings(settings: &ClockSettings) -> Self {
        Self::new(settings.twelve_hour, settings.calibration)
    }

    /// Maps a clock reading. In 12-hour mode the dial spans 0..=12 and is fed
    /// the folded hour, so 12 o'clock lands on the calibrated maximum.
    pub fn map(&self, clock: &WallClock) -> MeterValues {
        let hour_span = if self.twelve_hour { HOURS_12 } else { HOURS_24 };
        let hour = i32::from(clock.display_hour(self.twelve_hour));

        MeterValues {
            hour: self.ranges.hour.map(hour, 0, hour_span),
            minute: self.ranges.minute.map(i32::from(clock.minute), 0, SIXTY),
            second: self.ranges.second.map(i32::from(clock.second), 0, SIXTY),
        }
    }

    /// Raw override values; an unset override drives its meter to zero.
    pub fn overrides(calibration: &CalibrationOverride) -> MeterValues {
        let value = |meter: Meter| {
            calibration
                .resolve(meter.index())
                .map(i32::from)
                .unwrap_or(DUTY_MIN)
        };
        MeterValues {
            hour: value(Meter::Hour),
            minute: value(Meter::Minute),
            second: value(Meter::Second),
        }
    }

    /// Calibration mode, when active, fully replaces the clock-derived path.
    pub fn resolve(&self, clock: &WallClock, calibration: &CalibrationOverride) -> MeterValues {
        if calibration.is_active() {
            Self::overrides(calibration)
        } else {
            self.map(clock)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn clock(hour24: u8, minute: u8, second: u8) -> WallClock {
        WallClock {
            hour24,
            hour12: crate::types::fold_to_12(hour24),
            minute,
            second,
            is_valid: true,
        }
    }

    #[test]
    fn map_hits_both_extremes_exactly() {
        for (out_min, out_max) in [(0, 1023), (120, 980), (1000, 20), (512, 512)] {
            for (in_min, in_max) in [(0, 12), (0, 24), (0, 60)] {
                assert_eq!(map_range(in_min, in_min, in_max, out_min, out_max), out_min);
                assert_eq!(map_range(in_max, in_min, in_max, out_min, out_max), out_max);
            }
        }
    }

    #[test]
    fn map_truncates_toward_zero() {
        assert_eq!(map_range(2, 0, 12, 0, 1023), 170);
        assert_eq!(map_range(30, 0, 60, 0, 1023), 511);
        // Inverted range: 1023 - 511.5 truncates toward zero to 512.
        assert_eq!(map_range(30, 0, 60, 1023, 0), 512);
    }

    #[test]
    fn degenerate_input_span_maps_to_min() {
        assert_eq!(map_range(5, 3, 3, 100, 900), 100);
    }

    #[test]
    fn twelve_hour_afternoon_example() {
        let mapper = MeterMapper::new(true, CalibrationRanges::default());
        let values = mapper.map(&clock(14, 30, 0));

        assert_eq!(
            values,
            MeterValues {
                hour: 170,
                minute: 511,
                second: 0
            }
        );
    }

    #[test]
    fn twelve_oclock_reaches_calibrated_maximum() {
        let mut ranges = CalibrationRanges::default();
        ranges.hour = CalibrationRange { min: 40, max: 990 };
        let mapper = MeterMapper::new(true, ranges);

        assert_eq!(mapper.map(&clock(0, 0, 0)).hour, 990);
        assert_eq!(mapper.map(&clock(12, 0, 0)).hour, 990);
        assert_eq!(mapper.map(&clock(13, 0, 0)).hour, 40 + 950 / 12);
    }

    #[test]
    fn twenty_four_hour_mode_uses_full_day_span() {
        let mapper = MeterMapper::new(false, CalibrationRanges::default());

        assert_eq!(mapper.map(&clock(0, 0, 0)).hour, 0);
        assert_eq!(mapper.map(&clock(12, 0, 0)).hour, 511);
        assert_eq!(mapper.map(&clock(23, 0, 0)).hour, 23 * 1023 / 24);
    }

    #[test]
    fn active_calibration_replaces_clock_values() {
        let mapper = MeterMapper::new(true, CalibrationRanges::default());
        let mut calibration = CalibrationOverride::new();
        calibration.set_active(true);
        calibration.set_override(1, 700).unwrap();

        let values = mapper.resolve(&clock(14, 30, 45), &calibration);

        assert_eq!(
            values,
            MeterValues {
                hour: 0,
                minute: 700,
                second: 0
            }
        );
    }

    #[test]
    fn driver_clamp_pins_to_pwm_range() {
        assert_eq!(clamp_duty(-5), 0);
        assert_eq!(clamp_duty(1500), 1023);
        assert_eq!(clamp_duty(321), 321);
    }
}
