use serde::{Deserialize, Serialize};

use crate::{ports::LightingOutput, types::Rgb};

pub const LED_COUNT: usize = 3;
pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Strip position that blinks while the clock has neither network nor time.
pub const FAULT_PIXEL: usize = 0;
pub const FAULT_COLOR: Rgb = Rgb::RED;
pub const FAULT_BRIGHTNESS: u8 = 128;
pub const FAULT_FLASH_PERIOD_MS: u64 = 1_000;

pub fn minute_of_day(hour: u8, minute: u8) -> u16 {
    (u16::from(hour) * 60 + u16::from(minute)) % MINUTES_PER_DAY
}

/// No network and no usable clock: the only state the operator cannot read
/// off the meters themselves.
pub fn is_faulted(network_connected: bool, time_set: bool) -> bool {
    !network_connected && !time_set
}

/// Daily night interval, `[start, end)` in local time. `start > end` wraps
/// past midnight; `start == end` is an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightWindow {
    pub start_hour: u8,
    pub start_minute: u8,
    pub end_hour: u8,
    pub end_minute: u8,
}

impl Default for NightWindow {
    fn default() -> Self {
        Self {
            start_hour: 21,
            start_minute: 0,
            end_hour: 7,
            end_minute: 0,
        }
    }
}

impl NightWindow {
    pub fn start(&self) -> u16 {
        minute_of_day(self.start_hour, self.start_minute)
    }

    pub fn end(&self) -> u16 {
        minute_of_day(self.end_hour, self.end_minute)
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start() > self.end()
    }

    pub fn contains(&self, minute_of_day: u16) -> bool {
        let (start, end) = (self.start(), self.end());
        if start > end {
            minute_of_day >= start || minute_of_day < end
        } else {
            minute_of_day >= start && minute_of_day < end
        }
    }

    pub fn sanitize(&mut self) {
        self.start_hour = self.start_hour.min(23);
        self.end_hour = self.end_hour.min(23);
        self.start_minute = self.start_minute.min(59);
        self.end_minute = self.end_minute.min(59);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightingPalette {
    pub day_color: Rgb,
    pub day_brightness: u8,
    pub night_color: Rgb,
    pub night_brightness: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LightingPhase {
    Day,
    Night,
    Fault,
}

impl LightingPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Night => "night",
            Self::Fault => "fault",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightingDecision {
    Ambient {
        is_night: bool,
        color: Rgb,
        brightness: u8,
    },
    /// `lit` alternates at 1 Hz.
    Fault { lit: bool },
}

impl LightingDecision {
    pub fn phase(&self) -> LightingPhase {
        match self {
            Self::Ambient { is_night: true, .. } => LightingPhase::Night,
            Self::Ambient { .. } => LightingPhase::Day,
            Self::Fault { .. } => LightingPhase::Fault,
        }
    }

    pub fn is_night(&self) -> bool {
        matches!(self, Self::Ambient { is_night: true, .. })
    }

    /// Stages the decision on the strip. The caller presents the frame.
    pub fn apply<O: LightingOutput + ?Sized>(&self, output: &mut O) {
        match *self {
            Self::Ambient {
                color, brightness, ..
            } => {
                output.set_all(color);
                output.set_brightness(brightness);
            }
            Self::Fault { lit } => {
                output.set_all(Rgb::BLACK);
                if lit {
                    output.set_pixel(FAULT_PIXEL, FAULT_COLOR);
                }
                output.set_brightness(FAULT_BRIGHTNESS);
            }
        }
    }
}

/// Level-triggered day/night/fault selection, recomputed from scratch every
/// tick with no hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightingScheduler {
    pub flash_period_ms: u64,
}

impl Default for LightingScheduler {
    fn default() -> Self {
        Self {
            flash_period_ms: FAULT_FLASH_PERIOD_MS,
        }
    }
}

impl LightingScheduler {
    pub fn decide(
        &self,
        hour24: u8,
        minute: u8,
        window: &NightWindow,
        palette: &LightingPalette,
        is_faulted: bool,
        now_ms: u64,
    ) -> LightingDecision {
        if is_faulted {
            let period = self.flash_period_ms.max(2);
            return LightingDecision::Fault {
                lit: now_ms % period < period / 2,
            };
        }

        let is_night = window.contains(minute_of_day(hour24, minute));
        let (color, brightness) = if is_night {
            (palette.night_color, palette.night_brightness)
        } else {
            (palette.day_color, palette.day_brightness)
        };

        LightingDecision::Ambient {
            is_night,
            color,
            brightness,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::RecordingStrip;

    fn palette() -> LightingPalette {
        LightingPalette {
            day_color: Rgb::WHITE,
            day_brightness: 200,
            night_color: Rgb::new(0xFF, 0, 0xFF),
            night_brightness: 50,
        }
    }

    fn window(start: (u8, u8), end: (u8, u8)) -> NightWindow {
        NightWindow {
            start_hour: start.0,
            start_minute: start.1,
            end_hour: end.0,
            end_minute: end.1,
        }
    }

    #[test]
    fn wrapping_window_boundaries() {
        let night = window((21, 0), (7, 0));
        assert!(night.wraps_midnight());

        assert!(night.contains(minute_of_day(23, 0)));
        assert!(night.contains(minute_of_day(6, 59)));
        assert!(night.contains(minute_of_day(21, 0)));
        assert!(night.contains(minute_of_day(0, 0)));
        assert!(!night.contains(minute_of_day(7, 0)));
        assert!(!night.contains(minute_of_day(20, 59)));
    }

    #[test]
    fn non_wrapping_window_is_half_open() {
        let nap = window((13, 0), (14, 30));
        assert!(!nap.wraps_midnight());

        for minute in 0..MINUTES_PER_DAY {
            let expected = (780..870).contains(&minute);
            assert_eq!(nap.contains(minute), expected, "minute {minute}");
        }
    }

    #[test]
    fn equal_bounds_never_select_night() {
        let empty = window((8, 15), (8, 15));
        assert!((0..MINUTES_PER_DAY).all(|minute| !empty.contains(minute)));
    }

    #[test]
    fn selects_palette_by_window() {
        let scheduler = LightingScheduler::default();
        let night = NightWindow::default();

        assert_eq!(
            scheduler.decide(23, 0, &night, &palette(), false, 0),
            LightingDecision::Ambient {
                is_night: true,
                color: Rgb::new(0xFF, 0, 0xFF),
                brightness: 50,
            }
        );
        assert_eq!(
            scheduler.decide(12, 0, &night, &palette(), false, 0),
            LightingDecision::Ambient {
                is_night: false,
                color: Rgb::WHITE,
                brightness: 200,
            }
        );
    }

    #[test]
    fn fault_overrides_day_selection_and_flashes() {
        let scheduler = LightingScheduler::default();
        let night = NightWindow::default();

        let on = scheduler.decide(12, 0, &night, &palette(), true, 200);
        let off = scheduler.decide(12, 0, &night, &palette(), true, 700);
        let on_again = scheduler.decide(12, 0, &night, &palette(), true, 1_200);

        assert_eq!(on, LightingDecision::Fault { lit: true });
        assert_eq!(off, LightingDecision::Fault { lit: false });
        assert_eq!(on_again, on);
        assert_eq!(on.phase(), LightingPhase::Fault);
        assert!(!on.is_night());
    }

    #[test]
    fn fault_requires_both_network_and_time_missing() {
        assert!(is_faulted(false, false));
        assert!(!is_faulted(true, false));
        assert!(!is_faulted(false, true));
        assert!(!is_faulted(true, true));
    }

    #[test]
    fn fault_frame_lights_single_red_pixel() {
        let mut strip = RecordingStrip::default();
        LightingDecision::Fault { lit: true }.apply(&mut strip);

        assert_eq!(strip.pixels, [Rgb::RED, Rgb::BLACK, Rgb::BLACK]);
        assert_eq!(strip.brightness, FAULT_BRIGHTNESS);

        LightingDecision::Fault { lit: false }.apply(&mut strip);
        assert_eq!(strip.pixels, [Rgb::BLACK; LED_COUNT]);
    }

    #[test]
    fn ambient_frame_fills_strip() {
        let mut strip = RecordingStrip::default();
        LightingDecision::Ambient {
            is_night: false,
            color: Rgb::WHITE,
            brightness: 200,
        }
        .apply(&mut strip);

        assert_eq!(strip.pixels, [Rgb::WHITE; LED_COUNT]);
        assert_eq!(strip.brightness, 200);
        assert_eq!(strip.presented, 0);
    }
}
