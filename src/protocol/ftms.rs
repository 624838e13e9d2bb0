use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Opcode prefix of every control point response frame
pub const RESPONSE_OPCODE: u8 = 0x80;

/// Rolling resistance coefficient sent with simulation parameters (0.0033)
pub const ROLLING_RESISTANCE_COEFFICIENT: u8 = 33;

/// Wind resistance coefficient sent with simulation parameters
pub const WIND_RESISTANCE_COEFFICIENT: u8 = 0;

/// Scale from a resistance fraction (0.0 - 1.0) to the resistance byte
pub const RESISTANCE_SCALE: f64 = 200.0;

/// Indoor bike data flag bits in field order
///
/// Bit 0 is inverted: the instantaneous speed field is present when it is clear.
mod flags {
    pub const MORE_DATA: u16 = 1 << 0;
    pub const AVERAGE_SPEED: u16 = 1 << 1;
    pub const INSTANT_CADENCE: u16 = 1 << 2;
    pub const AVERAGE_CADENCE: u16 = 1 << 3;
    pub const TOTAL_DISTANCE: u16 = 1 << 4;
    pub const RESISTANCE_LEVEL: u16 = 1 << 5;
    pub const INSTANT_POWER: u16 = 1 << 6;
    pub const AVERAGE_POWER: u16 = 1 << 7;
    pub const EXPENDED_ENERGY: u16 = 1 << 8;
    pub const HEART_RATE: u16 = 1 << 9;
}

/// Fields of an indoor bike data notification that the core cares about
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndoorBikeData {
    /// Instantaneous speed in km/h
    pub speed_kmh: Option<f64>,
    /// Instantaneous cadence in rpm
    pub cadence_rpm: Option<f64>,
    /// Instantaneous power in watts
    pub power_watts: Option<i16>,
}

/// Decode an indoor bike data notification
///
/// Every present field is consumed so the cursor stays aligned, but only speed,
/// cadence and power are kept. Decoding stops at the first field that does not fit
/// in the remaining bytes; whatever was read before it is returned. Buffers shorter
/// than the flags field yield an empty result.
#[must_use]
pub fn parse_indoor_bike_data(data: &[u8]) -> IndoorBikeData {
    let mut result = IndoorBikeData::default();
    let mut buf = data;
    if buf.remaining() < 2 {
        return result;
    }
    let flag_bits = buf.get_u16_le();

    if flag_bits & flags::MORE_DATA == 0 {
        if buf.remaining() < 2 {
            return result;
        }
        result.speed_kmh = Some(f64::from(buf.get_u16_le()) / 100.0);
    }

    if flag_bits & flags::AVERAGE_SPEED != 0 && !skip(&mut buf, 2) {
        return result;
    }

    if flag_bits & flags::INSTANT_CADENCE != 0 {
        if buf.remaining() < 2 {
            return result;
        }
        result.cadence_rpm = Some(f64::from(buf.get_u16_le()) / 2.0);
    }

    let skipped_fields = [
        (flags::AVERAGE_CADENCE, 2),
        (flags::TOTAL_DISTANCE, 3),
        (flags::RESISTANCE_LEVEL, 2),
    ];
    for (bit, width) in skipped_fields {
        if flag_bits & bit != 0 && !skip(&mut buf, width) {
            return result;
        }
    }

    if flag_bits & flags::INSTANT_POWER != 0 {
        if buf.remaining() < 2 {
            return result;
        }
        result.power_watts = Some(buf.get_i16_le());
    }

    let trailing_fields = [
        (flags::AVERAGE_POWER, 2),
        (flags::EXPENDED_ENERGY, 5),
        (flags::HEART_RATE, 1),
    ];
    for (bit, width) in trailing_fields {
        if flag_bits & bit != 0 && !skip(&mut buf, width) {
            return result;
        }
    }

    result
}

fn skip(buf: &mut &[u8], width: usize) -> bool {
    if buf.remaining() < width {
        return false;
    }
    buf.advance(width);
    true
}

/// Encode an indoor bike data notification carrying the fields the core owns
///
/// Used by simulated peripherals. Cadence is rounded to the nearest half rpm.
#[must_use]
pub fn encode_indoor_bike_data(data: &IndoorBikeData) -> Bytes {
    let mut flag_bits = 0u16;
    if data.speed_kmh.is_none() {
        flag_bits |= flags::MORE_DATA;
    }
    if data.cadence_rpm.is_some() {
        flag_bits |= flags::INSTANT_CADENCE;
    }
    if data.power_watts.is_some() {
        flag_bits |= flags::INSTANT_POWER;
    }

    let mut buf = BytesMut::with_capacity(8);
    buf.put_u16_le(flag_bits);
    if let Some(speed) = data.speed_kmh {
        buf.put_u16_le(to_u16(speed * 100.0));
    }
    if let Some(cadence) = data.cadence_rpm {
        buf.put_u16_le(to_u16(cadence * 2.0));
    }
    if let Some(power) = data.power_watts {
        buf.put_i16_le(power);
    }
    buf.freeze()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u16(value: f64) -> u16 {
    value.round().clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Commands written to the fitness machine control point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlPointCommand {
    /// Ask the machine for control; required before any other command
    RequestControl,
    /// Erg mode target in watts
    SetTargetPower(i16),
    /// Simulated grade in whole percent
    SetSimulationParameters {
        /// Grade in percent; encoded in hundredths
        grade_percent: f64,
    },
    /// Resistance as a fraction of the machine's range (0.0 - 1.0)
    SetTargetResistance(f64),
}

impl ControlPointCommand {
    /// Opcode of this command
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        match self {
            Self::RequestControl => 0x00,
            Self::SetTargetResistance(_) => 0x04,
            Self::SetTargetPower(_) => 0x05,
            Self::SetSimulationParameters { .. } => 0x11,
        }
    }

    /// Serialize the command frame
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(7);
        buf.put_u8(self.opcode());
        match *self {
            Self::RequestControl => {}
            Self::SetTargetPower(watts) => buf.put_i16_le(watts),
            Self::SetSimulationParameters { grade_percent } => {
                // wind speed in mm/s
                buf.put_i16_le(0);
                let hundredths = (grade_percent * 100.0)
                    .trunc()
                    .clamp(f64::from(i16::MIN), f64::from(i16::MAX));
                buf.put_i16_le(hundredths as i16);
                buf.put_u8(ROLLING_RESISTANCE_COEFFICIENT);
                buf.put_u8(WIND_RESISTANCE_COEFFICIENT);
            }
            Self::SetTargetResistance(fraction) => {
                let level = (fraction * RESISTANCE_SCALE)
                    .trunc()
                    .clamp(0.0, f64::from(u8::MAX));
                buf.put_u8(level as u8);
            }
        }
        buf.freeze()
    }
}

/// Result codes of a control point response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Command accepted
    Success,
    /// Opcode not supported by the machine
    NotSupported,
    /// Parameter out of range
    InvalidParameter,
    /// Machine could not execute the command
    OperationFailed,
    /// Another client holds control, or control was never requested
    ControlNotPermitted,
    /// Any other value
    Other(u8),
}

impl From<u8> for ResultCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::NotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Other(other),
        }
    }
}

/// A decoded control point response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPointResponse {
    /// Opcode of the command being answered
    pub request_opcode: u8,
    /// Outcome reported by the machine
    pub result: ResultCode,
}

impl ControlPointResponse {
    /// Decode a control point indication; `None` if it is not a response frame
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut buf = data;
        if buf.remaining() < 3 || buf.get_u8() != RESPONSE_OPCODE {
            return None;
        }
        let request_opcode = buf.get_u8();
        let result = ResultCode::from(buf.get_u8());
        Some(Self {
            request_opcode,
            result,
        })
    }

    /// Whether the machine refused the command because we do not hold control
    #[must_use]
    pub fn must_request_control(&self) -> bool {
        self.result == ResultCode::ControlNotPermitted
    }
}

/// A fitness machine status notification, reduced to its opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineStatus {
    /// Status opcode (e.g. 0x04 started, 0x08 target power changed)
    pub opcode: u8,
}

impl MachineStatus {
    /// Decode a status notification; `None` on an empty buffer
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        data.first().map(|&opcode| Self { opcode })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_power_and_cadence() {
        // more data set (no speed), cadence + power present
        let data = [0x45, 0x00, 0xB4, 0x00, 0xFA, 0x00];
        let parsed = parse_indoor_bike_data(&data);
        assert_eq!(parsed.speed_kmh, None);
        assert_eq!(parsed.cadence_rpm, Some(90.0));
        assert_eq!(parsed.power_watts, Some(250));
    }

    #[test]
    fn test_parse_skips_intermediate_fields() {
        // speed, avg speed, cadence, avg cadence, distance, resistance, power
        let data = [
            0x7E, 0x00, // flags
            0xC4, 0x09, // speed 25.00
            0x00, 0x00, // avg speed
            0xA0, 0x00, // cadence 80
            0x00, 0x00, // avg cadence
            0x01, 0x02, 0x03, // distance
            0x10, 0x00, // resistance
            0x2C, 0x01, // power 300
        ];
        let parsed = parse_indoor_bike_data(&data);
        assert_eq!(parsed.speed_kmh, Some(25.0));
        assert_eq!(parsed.cadence_rpm, Some(80.0));
        assert_eq!(parsed.power_watts, Some(300));
    }

    #[test]
    fn test_parse_negative_power() {
        let data = [0x41, 0x00, 0xF6, 0xFF];
        assert_eq!(parse_indoor_bike_data(&data).power_watts, Some(-10));
    }

    #[test]
    fn test_parse_truncated_buffer() {
        // cadence present, power flagged but missing
        let data = [0x45, 0x00, 0xB4, 0x00, 0xFA];
        let parsed = parse_indoor_bike_data(&data);
        assert_eq!(parsed.cadence_rpm, Some(90.0));
        assert_eq!(parsed.power_watts, None);

        assert_eq!(parse_indoor_bike_data(&[]), IndoorBikeData::default());
        assert_eq!(parse_indoor_bike_data(&[0x44]), IndoorBikeData::default());
    }

    #[test]
    fn test_encode_then_decode_owned_fields() {
        let samples = [
            IndoorBikeData {
                speed_kmh: None,
                cadence_rpm: Some(92.5),
                power_watts: Some(212),
            },
            IndoorBikeData {
                speed_kmh: Some(31.2),
                cadence_rpm: None,
                power_watts: Some(-4),
            },
            IndoorBikeData {
                speed_kmh: Some(0.0),
                cadence_rpm: Some(0.0),
                power_watts: Some(0),
            },
        ];
        for sample in samples {
            let decoded = parse_indoor_bike_data(&encode_indoor_bike_data(&sample));
            assert_eq!(decoded.power_watts, sample.power_watts);
            assert_eq!(decoded.cadence_rpm, sample.cadence_rpm);
        }
    }

    #[test]
    fn test_control_point_frames() {
        assert_eq!(&ControlPointCommand::RequestControl.to_bytes()[..], &[0x00]);
        assert_eq!(
            &ControlPointCommand::SetTargetPower(250).to_bytes()[..],
            &[0x05, 0xFA, 0x00]
        );
        assert_eq!(
            &ControlPointCommand::SetSimulationParameters { grade_percent: 5.0 }.to_bytes()[..],
            &[0x11, 0x00, 0x00, 0xF4, 0x01, 33, 0]
        );
        assert_eq!(
            &ControlPointCommand::SetSimulationParameters { grade_percent: -2.0 }.to_bytes()[..],
            &[0x11, 0x00, 0x00, 0x38, 0xFF, 33, 0]
        );
        assert_eq!(
            &ControlPointCommand::SetTargetResistance(0.5).to_bytes()[..],
            &[0x04, 100]
        );
        assert_eq!(
            &ControlPointCommand::SetTargetResistance(2.0).to_bytes()[..],
            &[0x04, 255]
        );
        assert_eq!(
            &ControlPointCommand::SetTargetResistance(-1.0).to_bytes()[..],
            &[0x04, 0]
        );
    }

    #[test]
    fn test_control_point_response() {
        let refused = ControlPointResponse::parse(&[0x80, 0x11, 0x05]).unwrap();
        assert_eq!(refused.request_opcode, 0x11);
        assert!(refused.must_request_control());

        let ok = ControlPointResponse::parse(&[0x80, 0x05, 0x01]).unwrap();
        assert_eq!(ok.result, ResultCode::Success);
        assert!(!ok.must_request_control());

        assert!(ControlPointResponse::parse(&[0x05, 0x11, 0x05]).is_none());
        assert!(ControlPointResponse::parse(&[0x80, 0x11]).is_none());
        assert_eq!(
            ControlPointResponse::parse(&[0x80, 0x00, 0x09]).unwrap().result,
            ResultCode::Other(0x09)
        );
    }

    #[test]
    fn test_machine_status() {
        assert_eq!(MachineStatus::parse(&[0x04]), Some(MachineStatus { opcode: 0x04 }));
        assert_eq!(MachineStatus::parse(&[]), None);
    }
}
