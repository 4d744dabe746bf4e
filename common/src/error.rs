use thiserror::Error;

use crate::store::ValueKind;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failed on key `{key}`: {message}")]
    Backend { key: String, message: String },
    #[error("key `{key}` holds a value that is not a {expected:?}")]
    TypeMismatch { key: String, expected: ValueKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CalibrationError {
    #[error("calibration mode is not active")]
    Inactive,
    #[error("meter index {0} is out of range (expected 0-2)")]
    IndexOutOfRange(usize),
    #[error("override value {0} is out of range (expected 0-1023)")]
    ValueOutOfRange(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimezoneError {
    #[error("timezone string is empty")]
    Empty,
    #[error("invalid zone name at byte {0}")]
    InvalidName(usize),
    #[error("invalid UTC offset at byte {0}")]
    InvalidOffset(usize),
    #[error("invalid transition rule at byte {0}")]
    InvalidRule(usize),
    #[error("unexpected trailing input at byte {0}")]
    TrailingInput(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RtcError {
    #[error("RTC bus error: {0}")]
    Bus(String),
    #[error("RTC holds an invalid date/time")]
    InvalidDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NtpError {
    #[error("failed to resolve NTP server `{0}`")]
    Resolve(String),
    #[error("failed to start NTP client: {0}")]
    Start(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ManualTimeError {
    #[error("timestamp {0} is not representable")]
    Unrepresentable(i64),
    #[error("timestamp {0} is not after 2020")]
    Implausible(i64),
}
