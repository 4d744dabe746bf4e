//! In-memory stand-ins for the hardware ports.

use chrono::{NaiveDate, NaiveDateTime};

use crate::{
    error::{NtpError, RtcError},
    lighting::LED_COUNT,
    ports::{HardwareRtc, LightingOutput, MeterOutput, NetworkStatus, NtpClient, SystemClock},
    posix_tz::PosixTz,
    types::{LocalTime, Meter, Rgb, METER_COUNT},
};

#[derive(Debug, Clone)]
pub struct FakeClock {
    pub now: NaiveDateTime,
    pub tz: PosixTz,
    /// Every TZ string passed to `apply_timezone`, in order.
    pub applied: Vec<String>,
}

impl FakeClock {
    pub fn unset() -> Self {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .unwrap_or_default();
        Self::at(epoch)
    }

    pub fn at(now: NaiveDateTime) -> Self {
        Self {
            now,
            tz: PosixTz::utc(),
            applied: Vec::new(),
        }
    }
}

impl SystemClock for FakeClock {
    fn now_utc(&self) -> NaiveDateTime {
        self.now
    }

    fn local_now(&self) -> LocalTime {
        self.tz.to_local(&self.now)
    }

    fn set_utc(&mut self, utc: NaiveDateTime) {
        self.now = utc;
    }

    fn apply_timezone(&mut self, posix: &str) {
        self.tz = PosixTz::parse(posix).unwrap_or_else(|_| PosixTz::utc());
        self.applied.push(posix.to_string());
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeNtp {
    pub servers: Vec<String>,
    pub running: bool,
    pub first_sync_pending: bool,
}

impl NtpClient for FakeNtp {
    fn start(&mut self, servers: &[&str]) -> Result<(), NtpError> {
        self.servers = servers.iter().map(|server| server.to_string()).collect();
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn take_first_sync(&mut self) -> bool {
        std::mem::take(&mut self.first_sync_pending)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeRtc {
    pub present: bool,
    pub time: Option<NaiveDateTime>,
    pub lost_power: bool,
    pub fail_writes: bool,
    pub writes: Vec<NaiveDateTime>,
}

impl FakeRtc {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn with_time(time: NaiveDateTime) -> Self {
        Self {
            present: true,
            time: Some(time),
            ..Self::default()
        }
    }
}

impl HardwareRtc for FakeRtc {
    fn probe(&mut self) -> bool {
        self.present
    }

    fn lost_power(&mut self) -> Result<bool, RtcError> {
        Ok(self.lost_power)
    }

    fn read_utc(&mut self) -> Result<NaiveDateTime, RtcError> {
        self.time.ok_or(RtcError::InvalidDateTime)
    }

    fn write_utc(&mut self, utc: NaiveDateTime) -> Result<(), RtcError> {
        if self.fail_writes {
            return Err(RtcError::Bus("nack".into()));
        }
        self.time = Some(utc);
        self.writes.push(utc);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingMeters {
    pub values: [i32; METER_COUNT],
    pub writes: usize,
}

impl MeterOutput for RecordingMeters {
    fn set_value(&mut self, meter: Meter, value: i32) {
        self.values[meter.index()] = value;
        self.writes += 1;
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingStrip {
    pub pixels: [Rgb; LED_COUNT],
    pub brightness: u8,
    pub presented: usize,
}

impl LightingOutput for RecordingStrip {
    fn set_all(&mut self, color: Rgb) {
        self.pixels = [color; LED_COUNT];
    }

    fn set_pixel(&mut self, index: usize, color: Rgb) {
        if let Some(pixel) = self.pixels.get_mut(index) {
            *pixel = color;
        }
    }

    fn set_brightness(&mut self, brightness: u8) {
        self.brightness = brightness;
    }

    fn present(&mut self) {
        self.presented += 1;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FakeNetwork(pub bool);

impl NetworkStatus for FakeNetwork {
    fn is_connected(&self) -> bool {
        self.0
    }
}
