use crate::FrameParseError;

/* Payload fields */

/// Reassembles an unsigned 16-bit field sent low byte first.
pub fn u16_lohi(data: &[u8], offset: usize) -> u16 {
    u16::from(data[offset]) | (u16::from(data[offset + 1]) << 8)
}

/// Reassembles a signed 16-bit field sent low byte first. Raw values above
/// 32767 are the two's-complement negative equivalent (`value - 65536`).
pub fn s16_lohi(data: &[u8], offset: usize) -> i16 {
    u16_lohi(data, offset) as i16
}

/// Raw signed field multiplied by its per-bit scale.
pub fn scaled_s16(data: &[u8], offset: usize, scale: f32) -> f32 {
    f32::from(s16_lohi(data, offset)) * scale
}

/* Quantization */

/// Converts an engineering value into a count of `scale`-sized steps, rounding
/// half away from zero. NaN maps to zero and out-of-range values saturate.
pub fn quantize(value: f32, scale: f32) -> i64 {
    let steps = value / scale;

    if steps >= 0.0 {
        (steps + 0.5) as i64
    } else {
        (steps - 0.5) as i64
    }
}

pub fn quantize_u8(value: f32, scale: f32) -> u8 {
    quantize(value, scale).clamp(0, i64::from(u8::MAX)) as u8
}

pub fn quantize_u16(value: f32, scale: f32) -> u16 {
    quantize(value, scale).clamp(0, i64::from(u16::MAX)) as u16
}

/// Signed fields clamp symmetrically to +/-32767.
pub fn quantize_i16(value: f32, scale: f32) -> i16 {
    quantize(value, scale).clamp(-i64::from(i16::MAX), i64::from(i16::MAX)) as i16
}

/* Text decoding */

pub fn hex_digit_to_u8(byte: u8) -> Result<u8, FrameParseError> {
    Ok(match byte {
        b'0'..=b'9' => byte - b'0',
        b'a'..=b'f' => byte - b'a' + 10,
        b'A'..=b'F' => byte - b'A' + 10,
        _ => return Err(FrameParseError::IllegalHexDigit(byte)),
    })
}

/// Parses up to eight hex digits, with or without a `0x` prefix.
pub fn u32_from_hex(text: &str) -> Result<u32, FrameParseError> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);

    if digits.is_empty() || digits.len() > 8 {
        return Err(FrameParseError::InvalidFieldWidth(digits.len()));
    }

    let mut value = 0u32;

    for nibble in digits.bytes() {
        value <<= 4;
        value |= hex_digit_to_u8(nibble)? as u32;
    }

    Ok(value)
}
