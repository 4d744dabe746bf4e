use log::info;
use serde::Serialize;

use crate::{
    error::CalibrationError,
    meter::{DUTY_MAX, DUTY_MIN},
    types::METER_COUNT,
};

/// Operator-driven raw meter values used while physically calibrating the
/// dials. Indexed hour = 0, minute = 1, second = 2.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalibrationOverride {
    active: bool,
    overrides: [Option<u16>; METER_COUNT],
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationSnapshot {
    pub active: bool,
    pub overrides: [Option<u16>; METER_COUNT],
}

impl CalibrationOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Every transition clears the previews, so values from one session never
    /// reach normal operation or the next session.
    pub fn set_active(&mut self, active: bool) {
        if active != self.active {
            info!(
                "calibration mode {}",
                if active { "enabled" } else { "disabled" }
            );
        }
        self.active = active;
        self.overrides = [None; METER_COUNT];
    }

    pub fn set_override(&mut self, index: usize, value: i32) -> Result<(), CalibrationError> {
        if !self.active {
            return Err(CalibrationError::Inactive);
        }
        if !(DUTY_MIN..=DUTY_MAX).contains(&value) {
            return Err(CalibrationError::ValueOutOfRange(value));
        }
        let slot = self
            .overrides
            .get_mut(index)
            .ok_or(CalibrationError::IndexOutOfRange(index))?;
        *slot = Some(value as u16);
        Ok(())
    }

    pub fn resolve(&self, index: usize) -> Option<u16> {
        if !self.active {
            return None;
        }
        self.overrides.get(index).copied().flatten()
    }

    pub fn snapshot(&self) -> CalibrationSnapshot {
        CalibrationSnapshot {
            active: self.active,
            overrides: self.overrides,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn enabling_clears_previous_session() {
        let mut calibration = CalibrationOverride::new();
        calibration.set_active(true);
        calibration.set_override(0, 100).unwrap();
        calibration.set_override(2, 900).unwrap();
        calibration.set_active(false);

        calibration.set_active(true);

        assert_eq!(calibration.resolve(0), None);
        assert_eq!(calibration.resolve(1), None);
        assert_eq!(calibration.resolve(2), None);
    }

    #[test]
    fn re_enabling_while_active_also_clears() {
        let mut calibration = CalibrationOverride::new();
        calibration.set_active(true);
        calibration.set_override(1, 512).unwrap();

        calibration.set_active(true);

        assert_eq!(calibration.resolve(1), None);
    }

    #[test]
    fn overrides_only_apply_while_active() {
        let mut calibration = CalibrationOverride::new();
        assert_eq!(
            calibration.set_override(0, 10),
            Err(CalibrationError::Inactive)
        );
        assert_eq!(calibration.resolve(0), None);

        calibration.set_active(true);
        calibration.set_override(0, 10).unwrap();
        assert_eq!(calibration.resolve(0), Some(10));
    }

    #[test]
    fn rejects_bad_index_and_value_without_mutating() {
        let mut calibration = CalibrationOverride::new();
        calibration.set_active(true);
        let before = calibration.clone();

        assert_eq!(
            calibration.set_override(3, 10),
            Err(CalibrationError::IndexOutOfRange(3))
        );
        assert_eq!(
            calibration.set_override(0, 1024),
            Err(CalibrationError::ValueOutOfRange(1024))
        );
        assert_eq!(
            calibration.set_override(0, -1),
            Err(CalibrationError::ValueOutOfRange(-1))
        );
        assert_eq!(calibration, before);
        assert_eq!(calibration.resolve(7), None);
    }
}
