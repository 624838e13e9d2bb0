use bytes::Buf;

const FLAG_HEART_RATE_U16: u8 = 0x01;

/// Decode a heart rate measurement notification
///
/// Bit 0 of the flags byte selects an 8-bit (clear) or 16-bit little-endian (set)
/// heart rate value starting at byte 1. Returns `None` if the value is cut off.
#[must_use]
pub fn parse_heart_rate(data: &[u8]) -> Option<u16> {
    let mut buf = data;
    if !buf.has_remaining() {
        return None;
    }
    let flags = buf.get_u8();
    if flags & FLAG_HEART_RATE_U16 == 0 {
        buf.has_remaining().then(|| u16::from(buf.get_u8()))
    } else {
        (buf.remaining() >= 2).then(|| buf.get_u16_le())
    }
}
