//! Fixed-layout binary messages exchanged with the maintenance host.
//!
//! Every message starts with four sync bytes and a `u32` size field carrying the
//! total encoded length (header and footer included), and ends with the
//! `0xA5E1` end-of-block marker. All multi-byte integers are little-endian.
//!
//! ```text
//! action    | sync x4 | size u32 | action u32 | eob u16 |                              14 bytes
//! ack       | sync x4 | size u32 | action u32 | ack u16 | eob u16 |                    16 bytes
//! response  | sync x4 | size u32 | action u32 | status u32 | len u32 | data | eob u16 | 22 + len
//! ```

use std::fmt;

pub const SYNC_BYTES: [u8; 4] = [0x1A, 0xBA, 0xF1, 0xD5];
pub const ACK_MARKER: u16 = 0xBA21;
pub const END_OF_BLOCK: u16 = 0xA5E1;

pub const HEADER_SIZE_BYTES: usize = 8;
pub const FOOTER_SIZE_BYTES: usize = 2;
pub const ACTION_MESSAGE_SIZE_BYTES: usize = HEADER_SIZE_BYTES + 4 + FOOTER_SIZE_BYTES;
pub const ACK_MESSAGE_SIZE_BYTES: usize = ACTION_MESSAGE_SIZE_BYTES + 2;
pub const RESPONSE_OVERHEAD_BYTES: usize = HEADER_SIZE_BYTES + 12 + FOOTER_SIZE_BYTES;
pub const MAX_RESPONSE_DATA_BYTES: usize = 16 * 1024 * 1024;
pub const MAX_FRAME_SIZE_BYTES: usize = RESPONSE_OVERHEAD_BYTES + MAX_RESPONSE_DATA_BYTES;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionCode {
    BootInterrupt,
    GetAsBuilt,
    UpdateOfs,
    UpdateConfig,
    GetLogNames,
    GetSpecificLog,
    GetLastFlightLog,
    Close,
}

impl ActionCode {
    pub const ALL: [ActionCode; 8] = [
        Self::BootInterrupt,
        Self::GetAsBuilt,
        Self::UpdateOfs,
        Self::UpdateConfig,
        Self::GetLogNames,
        Self::GetSpecificLog,
        Self::GetLastFlightLog,
        Self::Close,
    ];

    pub fn code(self) -> u32 {
        match self {
            Self::BootInterrupt => 0xB3C3_B4A1,
            Self::GetAsBuilt => 0xB4C3_B4A2,
            Self::UpdateOfs => 0xD2C3_B4A3,
            Self::UpdateConfig => 0xD3C3_B4A4,
            Self::GetLogNames => 0xC1C3_B4A5,
            Self::GetSpecificLog => 0xC2C3_B4A6,
            Self::GetLastFlightLog => 0xC3C3_B4A7,
            Self::Close => 0xA4C3_B4A8,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::BootInterrupt => "BOOT_INTERRUPT",
            Self::GetAsBuilt => "GET_AS_BUILT",
            Self::UpdateOfs => "UPDATE_OFS",
            Self::UpdateConfig => "UPDATE_CONFIG",
            Self::GetLogNames => "GET_LOG_NAMES",
            Self::GetSpecificLog => "GET_SPECIFIC_LOG",
            Self::GetLastFlightLog => "GET_LAST_FLIGHT_LOG",
            Self::Close => "CLOSE",
        }
    }
}

impl fmt::Display for ActionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionStatus {
    Success,
    Fail,
}

impl ActionStatus {
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0x0001_A5E1,
            Self::Fail => 0x0002_A5E1,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x0001_A5E1 => Some(Self::Success),
            0x0002_A5E1 => Some(Self::Fail),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub action: ActionCode,
    pub status: ActionStatus,
    pub data: Vec<u8>,
}

impl Response {
    pub fn success(action: ActionCode, data: Vec<u8>) -> Self {
        Self {
            action,
            status: ActionStatus::Success,
            data,
        }
    }

    pub fn fail(action: ActionCode) -> Self {
        Self {
            action,
            status: ActionStatus::Fail,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_response(self.action, self.status, &self.data)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedMessage {
    Action(ActionCode),
    Ack(ActionCode),
    Response(Response),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    TooShort { size: usize, minimum: usize },
    SyncMismatch { found: [u8; 4] },
    SizeMismatch { declared: usize, expected: usize },
    UnexpectedSize { declared: usize },
    Truncated { declared: usize, available: usize },
    FooterMismatch { found: u16 },
    AckMarkerMismatch { found: u16 },
    UnknownAction { code: u32 },
    UnknownStatus { code: u32 },
    DataTooLarge { size: usize, limit: usize },
    BufferOverflow { buffered: usize, limit: usize },
    FrameTooLarge { declared: usize, limit: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { size, minimum } => {
                write!(f, "frame of {size} bytes is shorter than the {minimum}-byte minimum")
            }
            Self::SyncMismatch { found } => write!(
                f,
                "sync bytes mismatch: found {:02X} {:02X} {:02X} {:02X}",
                found[0], found[1], found[2], found[3]
            ),
            Self::SizeMismatch { declared, expected } => write!(
                f,
                "size field mismatch: declared {declared} bytes, expected {expected} bytes"
            ),
            Self::UnexpectedSize { declared } => {
                write!(f, "size field {declared} matches no message family")
            }
            Self::Truncated {
                declared,
                available,
            } => write!(
                f,
                "frame declares {declared} bytes but only {available} bytes are available"
            ),
            Self::FooterMismatch { found } => {
                write!(f, "end-of-block mismatch: found {found:#06X}, expected {END_OF_BLOCK:#06X}")
            }
            Self::AckMarkerMismatch { found } => {
                write!(f, "ack marker mismatch: found {found:#06X}, expected {ACK_MARKER:#06X}")
            }
            Self::UnknownAction { code } => write!(f, "unknown action code {code:#010X}"),
            Self::UnknownStatus { code } => write!(f, "unknown status code {code:#010X}"),
            Self::DataTooLarge { size, limit } => {
                write!(f, "response data of {size} bytes exceeds limit {limit}")
            }
            Self::BufferOverflow { buffered, limit } => write!(
                f,
                "stream buffer of {buffered} bytes exceeds limit {limit} without a complete frame"
            ),
            Self::FrameTooLarge { declared, limit } => {
                write!(f, "size field {declared} exceeds stream buffer limit {limit}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

pub fn encode_action(action: ActionCode) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ACTION_MESSAGE_SIZE_BYTES);
    write_header(&mut frame, ACTION_MESSAGE_SIZE_BYTES);
    frame.extend_from_slice(&action.code().to_le_bytes());
    frame.extend_from_slice(&END_OF_BLOCK.to_le_bytes());
    frame
}

pub fn encode_ack(action: ActionCode) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ACK_MESSAGE_SIZE_BYTES);
    write_header(&mut frame, ACK_MESSAGE_SIZE_BYTES);
    frame.extend_from_slice(&action.code().to_le_bytes());
    frame.extend_from_slice(&ACK_MARKER.to_le_bytes());
    frame.extend_from_slice(&END_OF_BLOCK.to_le_bytes());
    frame
}

pub fn encode_response(
    action: ActionCode,
    status: ActionStatus,
    data: &[u8],
) -> Result<Vec<u8>, FrameError> {
    if data.len() > MAX_RESPONSE_DATA_BYTES {
        return Err(FrameError::DataTooLarge {
            size: data.len(),
            limit: MAX_RESPONSE_DATA_BYTES,
        });
    }

    let total = RESPONSE_OVERHEAD_BYTES + data.len();
    let mut frame = Vec::with_capacity(total);
    write_header(&mut frame, total);
    frame.extend_from_slice(&action.code().to_le_bytes());
    frame.extend_from_slice(&status.code().to_le_bytes());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(data);
    frame.extend_from_slice(&END_OF_BLOCK.to_le_bytes());
    Ok(frame)
}

/// Decodes the message at the start of `buffer`, inferring its family from the
/// size field. Bytes past the declared size are ignored.
pub fn decode(buffer: &[u8]) -> Result<DecodedMessage, FrameError> {
    let declared = frame_size(buffer)?;
    if declared > buffer.len() {
        return Err(FrameError::Truncated {
            declared,
            available: buffer.len(),
        });
    }

    let mut reader = FieldReader::new(&buffer[..declared]);
    reader.skip(HEADER_SIZE_BYTES)?;

    match declared {
        ACTION_MESSAGE_SIZE_BYTES => {
            let code = reader.read_u32()?;
            expect_footer(&mut reader)?;
            Ok(DecodedMessage::Action(parse_action(code)?))
        }
        ACK_MESSAGE_SIZE_BYTES => {
            let code = reader.read_u32()?;
            let marker = reader.read_u16()?;
            if marker != ACK_MARKER {
                return Err(FrameError::AckMarkerMismatch { found: marker });
            }
            expect_footer(&mut reader)?;
            Ok(DecodedMessage::Ack(parse_action(code)?))
        }
        _ => {
            let code = reader.read_u32()?;
            let status_code = reader.read_u32()?;
            let data_len = reader.read_u32()? as usize;
            let expected = RESPONSE_OVERHEAD_BYTES.saturating_add(data_len);
            if expected != declared {
                return Err(FrameError::SizeMismatch { declared, expected });
            }
            let data = reader.take(data_len)?.to_vec();
            expect_footer(&mut reader)?;

            let status = ActionStatus::from_code(status_code)
                .ok_or(FrameError::UnknownStatus { code: status_code })?;
            Ok(DecodedMessage::Response(Response {
                action: parse_action(code)?,
                status,
                data,
            }))
        }
    }
}

/// Strict Action decode over the first [`ACTION_MESSAGE_SIZE_BYTES`] of
/// `buffer`; anything after them is ignored.
pub fn decode_action(buffer: &[u8]) -> Result<ActionCode, FrameError> {
    if buffer.len() < ACTION_MESSAGE_SIZE_BYTES {
        return Err(FrameError::TooShort {
            size: buffer.len(),
            minimum: ACTION_MESSAGE_SIZE_BYTES,
        });
    }

    let mut reader = FieldReader::new(&buffer[..ACTION_MESSAGE_SIZE_BYTES]);
    expect_sync(&mut reader)?;
    let declared = reader.read_u32()? as usize;
    if declared != ACTION_MESSAGE_SIZE_BYTES {
        return Err(FrameError::SizeMismatch {
            declared,
            expected: ACTION_MESSAGE_SIZE_BYTES,
        });
    }
    let code = reader.read_u32()?;
    expect_footer(&mut reader)?;
    parse_action(code)
}

/// Validates the header at the start of `buffer` and returns the declared
/// frame size. The declared size is checked against the known message
/// families, not against `buffer.len()`.
pub fn frame_size(buffer: &[u8]) -> Result<usize, FrameError> {
    if buffer.len() < ACTION_MESSAGE_SIZE_BYTES {
        return Err(FrameError::TooShort {
            size: buffer.len(),
            minimum: ACTION_MESSAGE_SIZE_BYTES,
        });
    }

    let mut reader = FieldReader::new(buffer);
    expect_sync(&mut reader)?;
    let declared = reader.read_u32()? as usize;
    check_declared_size(declared)?;
    Ok(declared)
}

pub(crate) fn check_declared_size(declared: usize) -> Result<(), FrameError> {
    match declared {
        ACTION_MESSAGE_SIZE_BYTES | ACK_MESSAGE_SIZE_BYTES => Ok(()),
        RESPONSE_OVERHEAD_BYTES..=MAX_FRAME_SIZE_BYTES => Ok(()),
        _ => Err(FrameError::UnexpectedSize { declared }),
    }
}

fn write_header(frame: &mut Vec<u8>, total_size: usize) {
    frame.extend_from_slice(&SYNC_BYTES);
    frame.extend_from_slice(&(total_size as u32).to_le_bytes());
}

fn parse_action(code: u32) -> Result<ActionCode, FrameError> {
    ActionCode::from_code(code).ok_or(FrameError::UnknownAction { code })
}

fn expect_sync(reader: &mut FieldReader<'_>) -> Result<(), FrameError> {
    let sync = reader.take(SYNC_BYTES.len())?;
    if sync != SYNC_BYTES.as_slice() {
        return Err(FrameError::SyncMismatch {
            found: [sync[0], sync[1], sync[2], sync[3]],
        });
    }
    Ok(())
}

fn expect_footer(reader: &mut FieldReader<'_>) -> Result<(), FrameError> {
    let eob = reader.read_u16()?;
    if eob != END_OF_BLOCK {
        return Err(FrameError::FooterMismatch { found: eob });
    }
    Ok(())
}

struct FieldReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.buffer.len())
            .ok_or(FrameError::Truncated {
                declared: self.offset.saturating_add(len),
                available: self.buffer.len(),
            })?;
        let slice = &self.buffer[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), FrameError> {
        self.take(len).map(|_| ())
    }

    fn read_u16(&mut self) -> Result<u16, FrameError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, FrameError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
