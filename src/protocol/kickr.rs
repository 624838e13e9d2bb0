//! Vendor resistance protocol.
//!
//! The trainer accepts two 3-byte frames on its vendor write characteristic:
//!
//! - `[0x40, LSB, MSB]` sets a resistance level. The level runs from 0 (full
//!   resistance) to 0x3fff (no resistance) on most units.
//! - `[0x42, LSB, MSB]` sets an erg target in watts.
//!
//! Simulated hills are sent as resistance levels interpolated between a calibrated
//! downhill and uphill level.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::ResistanceCalibration;

/// Opcode: set resistance level
pub const OP_SET_RESISTANCE_LEVEL: u8 = 0x40;

/// Opcode: set target power
pub const OP_SET_TARGET_POWER: u8 = 0x42;

/// Steepest descent that is passed on to the trainer, in percent
pub const MIN_SLOPE_PERCENT: f64 = -10.0;

/// Steepest climb that is passed on to the trainer, in percent
///
/// Pegging the trainer at its hardest level makes the pedals nearly impossible to turn.
pub const MAX_SLOPE_PERCENT: f64 = 10.0;

/// Largest change of the sent slope per update, in percentage points
pub const MAX_SLOPE_STEP: f64 = 0.5;

/// Level used at fraction 0.0 by direct resistance commands
pub const RESISTANCE_AT_DOWNHILL: u16 = 0x5f5b;

/// Level used at fraction 1.0 by direct resistance commands
pub const RESISTANCE_AT_UPHILL: u16 = 0x185b;

/// Bound the desired slope and limit how far it may move from the last sent slope
///
/// The step limit applies per call, regardless of how much time has passed.
#[must_use]
pub fn shape_slope(desired_percent: f64, last_sent_percent: f64) -> f64 {
    if desired_percent.is_nan() {
        return last_sent_percent;
    }
    desired_percent
        .clamp(MIN_SLOPE_PERCENT, MAX_SLOPE_PERCENT)
        .clamp(
            last_sent_percent - MAX_SLOPE_STEP,
            last_sent_percent + MAX_SLOPE_STEP,
        )
}

/// Position of a slope between the steepest descent (0.0) and steepest climb (1.0)
#[must_use]
pub fn uphill_fraction(slope_percent: f64) -> f64 {
    let offset = slope_percent - MIN_SLOPE_PERCENT;
    let span = MAX_SLOPE_PERCENT - MIN_SLOPE_PERCENT;
    (offset / span).clamp(0.0, 1.0)
}

/// Resistance level for an already shaped slope
#[must_use]
pub fn level_for_slope(slope_percent: f64, calibration: &ResistanceCalibration) -> u16 {
    let fraction = uphill_fraction(slope_percent);
    let lowest = f64::from(calibration.uphill.min(calibration.downhill));
    let highest = f64::from(calibration.uphill.max(calibration.downhill));
    let level = lerp(calibration.downhill, calibration.uphill, fraction)
        .max(lowest)
        .min(highest);
    truncate_level(level)
}

/// Resistance level for a direct resistance fraction (0.0 easiest, 1.0 hardest)
#[must_use]
pub fn level_for_fraction(fraction: f64) -> u16 {
    let fraction = fraction.clamp(0.0, 1.0);
    truncate_level(lerp(RESISTANCE_AT_DOWNHILL, RESISTANCE_AT_UPHILL, fraction))
}

fn lerp(at_zero: u16, at_one: u16, fraction: f64) -> f64 {
    fraction.mul_add(f64::from(at_one), (1.0 - fraction) * f64::from(at_zero))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn truncate_level(level: f64) -> u16 {
    level.trunc().clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Frame setting a resistance level
#[must_use]
pub fn encode_resistance_level(level: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(OP_SET_RESISTANCE_LEVEL);
    buf.put_u16_le(level);
    buf.freeze()
}

/// Frame setting an erg target; negative targets are sent as zero
#[must_use]
pub fn encode_target_power(watts: i32) -> Bytes {
    let watts = u16::try_from(watts.max(0)).unwrap_or(u16::MAX);
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(OP_SET_TARGET_POWER);
    buf.put_u16_le(watts);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_slope_bounds_and_step() {
        assert!((shape_slope(3.0, 0.0) - 0.5).abs() < 1e-9);
        assert!((shape_slope(-3.0, 0.0) - -0.5).abs() < 1e-9);
        assert!((shape_slope(2.2, 2.0) - 2.2).abs() < 1e-9);
        assert!((shape_slope(25.0, 9.8) - 10.0).abs() < 1e-9);
        assert!((shape_slope(-25.0, -9.9) - -10.0).abs() < 1e-9);
    }

    #[test]
    fn test_shape_slope_converges() {
        let mut sent = 0.0;
        for _ in 0..12 {
            sent = shape_slope(5.0, sent);
        }
        assert!((sent - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_uphill_fraction() {
        assert!(uphill_fraction(-10.0).abs() < 1e-9);
        assert!((uphill_fraction(0.0) - 0.5).abs() < 1e-9);
        assert!((uphill_fraction(10.0) - 1.0).abs() < 1e-9);
        assert!((uphill_fraction(40.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_level_for_slope() {
        let calibration = ResistanceCalibration::default();
        assert_eq!(level_for_slope(-10.0, &calibration), 0x3fff);
        assert_eq!(level_for_slope(10.0, &calibration), 0x2000);
        // 0.4 * 0x2000 + 0.6 * 0x3fff = 13106.6
        assert_eq!(level_for_slope(-2.0, &calibration), 13106);
    }

    #[test]
    fn test_level_for_slope_with_inverted_calibration() {
        let inverted = ResistanceCalibration {
            downhill: 0x1000,
            uphill: 0x2000,
        };
        assert_eq!(level_for_slope(-10.0, &inverted), 0x1000);
        assert_eq!(level_for_slope(0.0, &inverted), 0x1800);
        assert_eq!(level_for_slope(25.0, &inverted), 0x2000);
    }

    #[test]
    fn test_level_for_fraction() {
        assert_eq!(level_for_fraction(0.0), RESISTANCE_AT_DOWNHILL);
        assert_eq!(level_for_fraction(1.0), RESISTANCE_AT_UPHILL);
        assert_eq!(level_for_fraction(7.0), RESISTANCE_AT_UPHILL);
        assert_eq!(level_for_fraction(0.5), 0x3bdb);
    }

    #[test]
    fn test_frames() {
        assert_eq!(&encode_resistance_level(0x3fff)[..], &[0x40, 0xFF, 0x3F]);
        assert_eq!(&encode_target_power(250)[..], &[0x42, 0xFA, 0x00]);
        assert_eq!(&encode_target_power(-20)[..], &[0x42, 0x00, 0x00]);
    }
}
