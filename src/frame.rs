use embedded_can::{ExtendedId, Id, StandardId};
use heapless::Vec;

use crate::codec::u32_from_hex;

/// Largest payload a classic CAN data frame can carry.
pub const MAX_DLC: usize = 8;

/// Number of comma-separated fields in a legacy `CAN,...` line.
const CSV_FIELD_COUNT: usize = 13;

/// A classic CAN frame as it comes out of a controller receive buffer.
///
/// The payload is always stored as eight bytes and everything past the DLC is
/// zero, so a decoder indexing into a short frame never sees bytes left over
/// from a previous message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RawFrame {
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    id: Id,
    dlc: usize,
    remote: bool,
    data: [u8; MAX_DLC],
}

impl RawFrame {
    /// Builds a data frame from a controller's DLC field and receive bytes.
    /// The DLC is clamped to 0..=8 and only that many bytes are copied.
    pub fn from_parts(id: impl Into<Id>, dlc: u8, bytes: &[u8]) -> Self {
        let dlc = (dlc as usize).min(MAX_DLC).min(bytes.len());

        let mut data = [0u8; MAX_DLC];
        data[..dlc].copy_from_slice(&bytes[..dlc]);

        Self {
            id: id.into(),
            dlc,
            remote: false,
            data,
        }
    }

    /// The raw arbitration ID, 11 or 29 bits wide depending on the frame type
    pub fn raw_id(&self) -> u32 {
        match self.id {
            Id::Standard(id) => id.as_raw() as u32,
            Id::Extended(id) => id.as_raw(),
        }
    }

    /// All eight payload bytes, zero past the DLC
    pub fn padded_data(&self) -> &[u8; MAX_DLC] {
        &self.data
    }
}

impl embedded_can::Frame for RawFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_DLC {
            return None;
        }

        Some(Self::from_parts(id, data.len() as u8, data))
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > MAX_DLC {
            return None;
        }

        Some(Self {
            id: id.into(),
            dlc,
            remote: true,
            data: [0; MAX_DLC],
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc
    }

    fn data(&self) -> &[u8] {
        &self.data[..self.dlc]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameParseError {
    /* Line structure */
    #[error("Line does not start with the CAN tag")]
    NotCanLine,
    #[error("Expected 13 comma separated fields but found ({0:?})")]
    FieldCount(usize),
    #[error("A numeric field had an unusable width ({0:?} characters)")]
    InvalidFieldWidth(usize),

    /* Digits */
    #[error("Tried to decode a hex digit but it was out of range ({0:?})")]
    IllegalHexDigit(u8),
    #[error("Decimal field is not an unsigned 32 bit number")]
    InvalidDecimal,

    /* Frame content */
    #[error("Tried to decode the extended flag but it was neither 0 nor 1 ({0:?})")]
    InvalidExtendedFlag(u32),
    #[error("Received a CAN Standard ID ({0:?}) that was out of the valid range (0..=0x7FF)")]
    StandardIdOutOfRange(u32),
    #[error("Received a CAN Extended ID ({0:?}) that was out of the valid range (0..=0x1FFFFFFF)")]
    ExtendedIdOutOfRange(u32),
    #[error("Received a CAN 2 DLC ({0:?}) that was out of the valid range (0..=8)")]
    InvalidDataLengthCode(u32),
    #[error("Received a data byte ({0:?}) that was out of the valid range (0..=255)")]
    ByteOutOfRange(u32),
}

fn decimal(field: &str) -> Result<u32, FrameParseError> {
    field.parse().map_err(|_| FrameParseError::InvalidDecimal)
}

/// Parses one line of the raw pass-through format emitted by the older
/// bridge firmware:
///
/// `CAN,<ts_ms>,<id_hex>,<ext>,<dlc>,<b0>,<b1>,<b2>,<b3>,<b4>,<b5>,<b6>,<b7>`
///
/// Bytes past the DLC are ignored. Returns the device timestamp alongside the
/// frame.
pub fn parse_csv_line(line: &str) -> Result<(u32, RawFrame), FrameParseError> {
    let mut fields: Vec<&str, CSV_FIELD_COUNT> = Vec::new();
    let mut count = 0;

    for field in line.trim().split(',') {
        count += 1;
        // Overflow is reported below with the full count
        let _ = fields.push(field.trim());
    }

    if fields.first() != Some(&"CAN") {
        return Err(FrameParseError::NotCanLine);
    }

    if count != CSV_FIELD_COUNT {
        return Err(FrameParseError::FieldCount(count));
    }

    let timestamp_ms = decimal(fields[1])?;
    let raw_id = u32_from_hex(fields[2])?;

    let id: Id = match decimal(fields[3])? {
        0 => u16::try_from(raw_id)
            .ok()
            .and_then(StandardId::new)
            .ok_or(FrameParseError::StandardIdOutOfRange(raw_id))?
            .into(),
        1 => ExtendedId::new(raw_id)
            .ok_or(FrameParseError::ExtendedIdOutOfRange(raw_id))?
            .into(),
        flag => return Err(FrameParseError::InvalidExtendedFlag(flag)),
    };

    let dlc = decimal(fields[4])?;
    if dlc as usize > MAX_DLC {
        return Err(FrameParseError::InvalidDataLengthCode(dlc));
    }

    let mut bytes = [0u8; MAX_DLC];
    for (slot, text) in bytes.iter_mut().zip(&fields[5..]) {
        let value = decimal(text)?;
        *slot = u8::try_from(value).map_err(|_| FrameParseError::ByteOutOfRange(value))?;
    }

    Ok((timestamp_ms, RawFrame::from_parts(id, dlc as u8, &bytes)))
}

#[cfg(test)]
mod tests {
    use embedded_can::{ExtendedId, Frame, StandardId};

    use super::*;

    #[test]
    fn short_frames_are_zero_filled() {
        let id = ExtendedId::new(0x0CFF_F048).unwrap();
        let frame = RawFrame::from_parts(id, 3, &[1, 2, 3, 4, 5, 6, 7, 8]);

        assert_eq!(frame.dlc(), 3);
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert_eq!(frame.padded_data(), &[1, 2, 3, 0, 0, 0, 0, 0]);
        assert!(frame.is_extended());
        assert_eq!(frame.raw_id(), 0x0CFF_F048);
    }

    #[test]
    fn dlc_is_clamped() {
        let frame = RawFrame::from_parts(StandardId::MAX, 15, &[0xAA; 8]);

        assert_eq!(frame.dlc(), 8);
        assert_eq!(frame.data(), &[0xAA; 8]);
        assert!(frame.is_standard());
    }

    #[test]
    fn embedded_can_constructors() {
        assert!(RawFrame::new(StandardId::ZERO, &[0; 9]).is_none());
        assert!(RawFrame::new_remote(StandardId::ZERO, 9).is_none());

        let remote = RawFrame::new_remote(StandardId::ZERO, 4).unwrap();
        assert!(remote.is_remote_frame());
        assert_eq!(remote.dlc(), 4);
    }

    #[test]
    fn parse_csv_frames() {
        let (ts, frame) =
            parse_csv_line("CAN,123456,CFFF048,1,8,136,19,0,0,22,0,120,0\r\n").unwrap();

        assert_eq!(ts, 123456);
        assert!(frame.is_extended());
        assert_eq!(frame.raw_id(), 0x0CFF_F048);
        assert_eq!(frame.data(), &[0x88, 0x13, 0, 0, 0x16, 0, 0x78, 0]);

        let (_, frame) = parse_csv_line("CAN,1,7FF,0,2,1,2,99,99,99,99,99,99").unwrap();
        assert!(frame.is_standard());
        assert_eq!(frame.data(), &[1, 2]);
        assert_eq!(frame.padded_data(), &[1, 2, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn csv_parse_errors() {
        assert_eq!(
            parse_csv_line("# status"),
            Err(FrameParseError::NotCanLine)
        );
        assert_eq!(
            parse_csv_line("CAN,1,7FF,0,2,1,2"),
            Err(FrameParseError::FieldCount(7))
        );
        assert_eq!(
            parse_csv_line("CAN,1,7FF,0,2,1,2,0,0,0,0,0,0,0,0"),
            Err(FrameParseError::FieldCount(15))
        );
        assert_eq!(
            parse_csv_line("CAN,1,800,0,0,0,0,0,0,0,0,0,0"),
            Err(FrameParseError::StandardIdOutOfRange(0x800))
        );
        assert_eq!(
            parse_csv_line("CAN,1,2FFFFFFF,1,0,0,0,0,0,0,0,0,0"),
            Err(FrameParseError::ExtendedIdOutOfRange(0x2FFF_FFFF))
        );
        assert_eq!(
            parse_csv_line("CAN,1,100,2,0,0,0,0,0,0,0,0,0"),
            Err(FrameParseError::InvalidExtendedFlag(2))
        );
        assert_eq!(
            parse_csv_line("CAN,1,100,0,9,0,0,0,0,0,0,0,0"),
            Err(FrameParseError::InvalidDataLengthCode(9))
        );
        assert_eq!(
            parse_csv_line("CAN,1,100,0,8,0,0,0,256,0,0,0,0"),
            Err(FrameParseError::ByteOutOfRange(256))
        );
        assert_eq!(
            parse_csv_line("CAN,1,10G,0,8,0,0,0,0,0,0,0,0"),
            Err(FrameParseError::IllegalHexDigit(b'G'))
        );
    }

    #[test]
    fn decimal_fields() {
        let (ts, _) = parse_csv_line("CAN,4294967295,100,0,0,0,0,0,0,0,0,0,0").unwrap();
        assert_eq!(ts, u32::MAX);

        for line in [
            "CAN,4294967296,100,0,0,0,0,0,0,0,0,0,0",
            "CAN,-1,100,0,0,0,0,0,0,0,0,0,0",
            "CAN,,100,0,0,0,0,0,0,0,0,0,0",
            "CAN,1,100,x,0,0,0,0,0,0,0,0,0",
            "CAN,1,100,0,8,0,0,1.5,0,0,0,0,0",
        ] {
            assert_eq!(parse_csv_line(line), Err(FrameParseError::InvalidDecimal));
        }
    }
}
