use serde::Serialize;

use crate::{
    calibration::CalibrationOverride,
    config::ClockSettings,
    lighting::{is_faulted, LightingDecision, LightingPhase, LightingScheduler},
    meter::{MeterMapper, MeterValues},
    ports::{HardwareRtc, LightingOutput, MeterOutput, NetworkStatus, NtpClient, SystemClock},
    time_source::TimeSource,
    types::{Meter, WallClock},
};

/// Meters and lighting are recomputed once more than this has elapsed
/// (about 20 Hz).
pub const UI_TICK_INTERVAL_MS: u64 = 50;

/// What the last UI tick put on the meters and the strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockFrame {
    pub wall_clock: WallClock,
    pub meters: MeterValues,
    pub lighting: LightingPhase,
    pub faulted: bool,
    pub network_connected: bool,
    pub calibrating: bool,
}

/// The control loop body: time reconciliation every call, meters and
/// lighting on the throttled UI tick.
///
/// Settings and calibration are borrowed per call, never cached, so edits
/// made between two ticks take effect on the second one.
#[derive(Debug)]
pub struct MeterClock<C, N, R> {
    time: TimeSource<C, N, R>,
    scheduler: LightingScheduler,
    last_ui_tick_ms: Option<u64>,
    last_frame: Option<ClockFrame>,
}

impl<C, N, R> MeterClock<C, N, R>
where
    C: SystemClock,
    N: NtpClient,
    R: HardwareRtc,
{
    pub fn new(time: TimeSource<C, N, R>) -> Self {
        Self {
            time,
            scheduler: LightingScheduler::default(),
            last_ui_tick_ms: None,
            last_frame: None,
        }
    }

    pub fn start(&mut self, settings: &ClockSettings, now_ms: u64) {
        self.time.initialize(settings, now_ms);
    }

    pub fn set_utc_override(&mut self, enabled: bool, settings: &ClockSettings) -> bool {
        self.time.set_secondary_timezone_override(enabled, settings)
    }

    /// Returns the new frame when the UI tick fired on this call.
    pub fn tick<W, M, L>(
        &mut self,
        now_ms: u64,
        settings: &ClockSettings,
        calibration: &CalibrationOverride,
        network: &W,
        meters: &mut M,
        lights: &mut L,
    ) -> Option<&ClockFrame>
    where
        W: NetworkStatus + ?Sized,
        M: MeterOutput + ?Sized,
        L: LightingOutput + ?Sized,
    {
        self.time.tick(now_ms);

        if let Some(last) = self.last_ui_tick_ms {
            if now_ms.saturating_sub(last) <= UI_TICK_INTERVAL_MS {
                return None;
            }
        }
        self.last_ui_tick_ms = Some(now_ms);

        let wall_clock = self.time.current_wall_clock();
        let values = MeterMapper::from_settings(settings).resolve(&wall_clock, calibration);
        for meter in Meter::ALL {
            meters.set_value(meter, values.get(meter));
        }

        let network_connected = network.is_connected();
        let faulted = is_faulted(network_connected, wall_clock.is_valid);
        let decision = self.decide(&wall_clock, settings, faulted, now_ms);
        decision.apply(lights);
        lights.present();

        self.last_frame = Some(ClockFrame {
            wall_clock,
            meters: values,
            lighting: decision.phase(),
            faulted,
            network_connected,
            calibrating: calibration.is_active(),
        });
        self.last_frame.as_ref()
    }

    fn decide(
        &self,
        wall_clock: &WallClock,
        settings: &ClockSettings,
        faulted: bool,
        now_ms: u64,
    ) -> LightingDecision {
        self.scheduler.decide(
            wall_clock.hour24,
            wall_clock.minute,
            &settings.night,
            &settings.palette(),
            faulted,
            now_ms,
        )
    }

    pub fn last_frame(&self) -> Option<&ClockFrame> {
        self.last_frame.as_ref()
    }

    pub fn time_source(&self) -> &TimeSource<C, N, R> {
        &self.time
    }

    pub fn time_source_mut(&mut self) -> &mut TimeSource<C, N, R> {
        &mut self.time
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        testing::{FakeClock, FakeNetwork, FakeNtp, FakeRtc, RecordingMeters, RecordingStrip},
        types::Rgb,
    };

    type TestClock = MeterClock<FakeClock, FakeNtp, FakeRtc>;

    fn utc(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 15)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    fn started(rtc: FakeRtc, settings: &ClockSettings) -> TestClock {
        let mut clock = MeterClock::new(TimeSource::new(
            FakeClock::unset(),
            FakeNtp::default(),
            rtc,
        ));
        clock.start(settings, 0);
        clock
    }

    #[test]
    fn afternoon_in_twelve_hour_mode_drives_meters_and_day_lighting() {
        let settings = ClockSettings::default();
        // 20:30 UTC is 14:30 CST.
        let mut clock = started(FakeRtc::with_time(utc(20, 30, 0)), &settings);
        let mut meters = RecordingMeters::default();
        let mut strip = RecordingStrip::default();

        let frame = *clock
            .tick(
                0,
                &settings,
                &CalibrationOverride::new(),
                &FakeNetwork(true),
                &mut meters,
                &mut strip,
            )
            .unwrap();

        assert_eq!(frame.wall_clock.hour12, 2);
        assert_eq!(meters.values, [170, 511, 0]);
        assert_eq!(frame.lighting, LightingPhase::Day);
        assert!(!frame.faulted);
        assert_eq!(strip.pixels, [Rgb::WHITE; 3]);
        assert_eq!(strip.brightness, 200);
        assert_eq!(strip.presented, 1);
    }

    #[test]
    fn ui_tick_is_throttled_but_time_source_is_not() {
        let settings = ClockSettings::default();
        let mut clock = started(FakeRtc::with_time(utc(20, 30, 0)), &settings);
        let mut meters = RecordingMeters::default();
        let mut strip = RecordingStrip::default();
        let calibration = CalibrationOverride::new();
        let network = FakeNetwork(true);

        assert!(clock
            .tick(0, &settings, &calibration, &network, &mut meters, &mut strip)
            .is_some());

        clock.time_source_mut().ntp_mut().first_sync_pending = true;
        assert!(clock
            .tick(10, &settings, &calibration, &network, &mut meters, &mut strip)
            .is_none());
        assert_eq!(clock.time_source().rtc().writes.len(), 1);

        assert!(clock
            .tick(50, &settings, &calibration, &network, &mut meters, &mut strip)
            .is_none());
        assert!(clock
            .tick(51, &settings, &calibration, &network, &mut meters, &mut strip)
            .is_some());
        assert_eq!(strip.presented, 2);
        assert_eq!(meters.writes, 6);
    }

    #[test]
    fn no_network_and_no_time_flashes_fault_pixel() {
        let settings = ClockSettings::default();
        let mut clock = started(FakeRtc::absent(), &settings);
        let mut meters = RecordingMeters::default();
        let mut strip = RecordingStrip::default();

        let frame = *clock
            .tick(
                100,
                &settings,
                &CalibrationOverride::new(),
                &FakeNetwork(false),
                &mut meters,
                &mut strip,
            )
            .unwrap();

        assert!(frame.faulted);
        assert_eq!(frame.lighting, LightingPhase::Fault);
        assert_eq!(strip.pixels, [Rgb::RED, Rgb::BLACK, Rgb::BLACK]);

        clock.tick(
            600,
            &settings,
            &CalibrationOverride::new(),
            &FakeNetwork(false),
            &mut meters,
            &mut strip,
        );
        assert_eq!(strip.pixels, [Rgb::BLACK; 3]);
    }

    #[test]
    fn settings_edits_apply_on_next_tick() {
        let mut settings = ClockSettings::default();
        let mut clock = started(FakeRtc::with_time(utc(20, 30, 0)), &settings);
        let mut meters = RecordingMeters::default();
        let mut strip = RecordingStrip::default();
        let calibration = CalibrationOverride::new();
        let network = FakeNetwork(true);

        clock.tick(0, &settings, &calibration, &network, &mut meters, &mut strip);
        assert_eq!(meters.values[0], 170);

        settings.twelve_hour = false;
        settings.night.start_hour = 14;
        clock.tick(100, &settings, &calibration, &network, &mut meters, &mut strip);

        assert_eq!(meters.values[0], 14 * 1023 / 24);
        assert_eq!(clock.last_frame().map(|f| f.lighting), Some(LightingPhase::Night));
        assert_eq!(strip.brightness, settings.night_brightness);
    }

    #[test]
    fn calibration_mode_replaces_meter_values() {
        let settings = ClockSettings::default();
        let mut clock = started(FakeRtc::with_time(utc(20, 30, 0)), &settings);
        let mut meters = RecordingMeters::default();
        let mut strip = RecordingStrip::default();
        let mut calibration = CalibrationOverride::new();
        calibration.set_active(true);
        calibration.set_override(2, 1023).unwrap();

        let frame = *clock
            .tick(
                0,
                &settings,
                &calibration,
                &FakeNetwork(true),
                &mut meters,
                &mut strip,
            )
            .unwrap();

        assert!(frame.calibrating);
        assert_eq!(meters.values, [0, 0, 1023]);
    }

    #[test]
    fn utc_switch_changes_displayed_hour() {
        let settings = ClockSettings::default();
        let mut clock = started(FakeRtc::with_time(utc(20, 30, 0)), &settings);

        assert!(clock.set_utc_override(true, &settings));
        assert_eq!(clock.time_source().current_wall_clock().hour24, 20);
        assert!(!clock.set_utc_override(true, &settings));
    }
}
