use bytes::{Buf, Bytes};

use crate::error::{Result, TrainerError};

/// Control point opcode: start offset compensation (zero offset)
pub const START_OFFSET_COMPENSATION: u8 = 0x0c;

/// Control point result: success
pub const RESULT_SUCCESS: u8 = 0x01;

/// Control point result: operation failed
pub const RESULT_OPERATION_FAILED: u8 = 0x04;

/// A decoded cycling power measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerMeasurement {
    /// Measurement flags, not interpreted
    pub flags: u16,
    /// Instantaneous power in watts
    pub power_watts: i16,
}

/// Decode a cycling power measurement notification
///
/// Returns `None` if the buffer is shorter than the flags and power fields.
#[must_use]
pub fn parse_power_measurement(data: &[u8]) -> Option<PowerMeasurement> {
    let mut buf = data;
    if buf.remaining() < 4 {
        return None;
    }
    let flags = buf.get_u16_le();
    let power_watts = buf.get_i16_le();
    Some(PowerMeasurement { flags, power_watts })
}

/// Frame that starts offset compensation on a crank power meter
#[must_use]
pub fn encode_start_offset_compensation() -> Bytes {
    Bytes::from_static(&[START_OFFSET_COMPENSATION])
}

/// A decoded cycling power control point response
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlPointResponse {
    /// Response opcode (0x20 for conforming meters)
    pub response_opcode: u8,
    /// Opcode of the request being answered
    pub request_opcode: u8,
    /// Result code
    pub result: u8,
    /// Residual torque in N·m, when the meter reports it
    pub residual_torque_nm: Option<f64>,
}

impl ControlPointResponse {
    /// Decode a control point indication; `None` if it is shorter than three bytes
    ///
    /// Bytes 3 and 4, when present, carry the residual torque in 1/32 N·m.
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut buf = data;
        if buf.remaining() < 3 {
            return None;
        }
        let response_opcode = buf.get_u8();
        let request_opcode = buf.get_u8();
        let result = buf.get_u8();
        let residual_torque_nm =
            (buf.remaining() >= 2).then(|| f64::from(buf.get_u16_le()) / 32.0);
        Some(Self {
            response_opcode,
            request_opcode,
            result,
            residual_torque_nm,
        })
    }

    /// Whether this frame answers a zero-offset request
    #[must_use]
    pub const fn answers_offset_compensation(&self) -> bool {
        self.request_opcode == START_OFFSET_COMPENSATION
    }

    /// Map the result code to the calibration outcome
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CalibrationFailed`] for the "operation failed" code and
    /// [`TrainerError::CalibrationUnknownResult`] for anything but success.
    pub fn calibration_outcome(&self) -> Result<()> {
        match self.result {
            RESULT_SUCCESS => Ok(()),
            RESULT_OPERATION_FAILED => Err(TrainerError::CalibrationFailed { code: self.result }),
            code => Err(TrainerError::CalibrationUnknownResult { code }),
        }
    }
}
