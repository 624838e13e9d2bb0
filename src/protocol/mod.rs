//! Wire codecs for the supported peripheral protocols.
//!
//! Every function in here is pure: decoders take a received buffer and return what
//! they could read, encoders return the exact bytes to write. Nothing in this module
//! touches the transport. All multi-byte integers are little-endian.

/// Cycling Power Service measurement and control point
pub mod cps;
/// Fitness Machine Service indoor bike data and control point
pub mod ftms;
/// Heart Rate Service measurement
pub mod hrm;
/// Vendor resistance protocol used by Wahoo Kickr trainers
pub mod kickr;

/// Divisor applied to negative grades before they are sent to a trainer
pub const DOWNHILL_DAMPENING: f64 = 4.0;

/// Soften downhill grades so the rider does not spin out on descents
///
/// Negative grades are divided by [`DOWNHILL_DAMPENING`]; flat and uphill grades pass
/// through unchanged.
#[must_use]
pub fn dampen_downhill(grade_percent: f64) -> f64 {
    if grade_percent < 0.0 {
        grade_percent / DOWNHILL_DAMPENING
    } else {
        grade_percent
    }
}
