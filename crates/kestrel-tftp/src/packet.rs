//! TFTP packet encoding and decoding
//!
//! RFC 1350 packet formats plus the RFC 2347 option extension:
//!
//! ```text
//!  RRQ/WRQ  | 01/02 | filename | 0 | mode | 0 | opt1 | 0 | value1 | 0 | ...
//!  DATA     | 03    | block    | payload (0..blksize bytes)
//!  ACK      | 04    | block    |
//!  ERROR    | 05    | code     | message | 0 |
//!  OACK     | 06    | opt1 | 0 | value1 | 0 | ...
//! ```
//!
//! All integers are big-endian. Decoding never panics on hostile input.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TftpError};

/// Longest option name or value accepted from the wire
const MAX_OPTION_FIELD_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,   // Read request (RFC 1350)
    Wrq = 2,   // Write request (RFC 1350)
    Data = 3,  // Data packet (RFC 1350)
    Ack = 4,   // Acknowledgment (RFC 1350)
    Error = 5, // Error packet (RFC 1350)
    Oack = 6,  // Option acknowledgment (RFC 2347)
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> std::result::Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(TftpError::MalformedPacket(format!("Invalid opcode: {}", value))),
        }
    }
}

impl Opcode {
    /// Opcode of a raw datagram, without decoding the rest
    pub fn peek(data: &[u8]) -> Option<Opcode> {
        match data {
            [high, low, ..] => Opcode::try_from(u16::from_be_bytes([*high, *low])).ok(),
            _ => None,
        }
    }
}

// RFC 1350 - TFTP Error Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotDefined,            // Not defined, see error message
    FileNotFound,          // File not found
    AccessViolation,       // Access violation
    DiskFull,              // Disk full or allocation exceeded
    IllegalTftpOp,         // Illegal TFTP operation
    UnknownTid,            // Unknown transfer ID
    FileAlreadyExists,     // File already exists
    NoSuchUser,            // No such user
    FailedNegotiation,     // RFC 2347 - Option negotiation failure
    /// Code outside the RFC table, kept as received
    Unassigned(u16),
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => ErrorCode::NotDefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalTftpOp,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::FailedNegotiation,
            other => ErrorCode::Unassigned(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalTftpOp => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::FailedNegotiation => 8,
            ErrorCode::Unassigned(code) => code,
        }
    }

    /// Canonical message text from RFC 1350
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined, see error message",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalTftpOp => "Illegal TFTP operation",
            ErrorCode::UnknownTid => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::FailedNegotiation => "Failed to negotiate options",
            ErrorCode::Unassigned(_) => "Unassigned error code",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

// RFC 1350 - Transfer modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// 8-bit ASCII with CR LF line endings on the wire
    Netascii,
    /// Raw bytes, no conversion
    #[default]
    Octet,
}

impl TransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
        }
    }
}

impl std::str::FromStr for TransferMode {
    type Err = TftpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(TransferMode::Netascii),
            "octet" => Ok(TransferMode::Octet),
            _ => Err(TftpError::MalformedPacket(format!(
                "Invalid transfer mode: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `name\0value\0` pair as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOption {
    pub name: String,
    pub value: String,
}

impl RawOption {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Read or write request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: String,
    pub mode: TransferMode,
    pub options: Vec<RawOption>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq(Request),
    Wrq(Request),
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
    Oack { options: Vec<RawOption> },
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq(_) => Opcode::Rrq,
            Packet::Wrq(_) => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack { .. } => Opcode::Oack,
        }
    }

    /// ERROR packet carrying the RFC description as its message
    pub fn error(code: ErrorCode) -> Self {
        Packet::Error {
            code,
            message: code.description().to_string(),
        }
    }

    /// Number of DATA payload bytes, zero for every other kind
    pub fn payload_len(&self) -> usize {
        match self {
            Packet::Data { payload, .. } => payload.len(),
            _ => 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16(self.opcode() as u16);

        match self {
            Packet::Rrq(request) | Packet::Wrq(request) => {
                put_string(&mut buf, &request.filename);
                put_string(&mut buf, request.mode.as_str());
                put_options(&mut buf, &request.options);
            }
            Packet::Data { block, payload } => {
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Packet::Ack { block } => buf.put_u16(*block),
            Packet::Error { code, message } => {
                buf.put_u16(code.as_u16());
                put_string(&mut buf, message);
            }
            Packet::Oack { options } => put_options(&mut buf, options),
        }

        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Packet> {
        let mut buf = data;
        if buf.remaining() < 2 {
            return Err(TftpError::MalformedPacket("Packet too small".to_string()));
        }
        let opcode = Opcode::try_from(buf.get_u16())?;

        match opcode {
            Opcode::Rrq => Ok(Packet::Rrq(get_request(&mut buf)?)),
            Opcode::Wrq => Ok(Packet::Wrq(get_request(&mut buf)?)),
            Opcode::Data => {
                let block = get_block(&mut buf)?;
                Ok(Packet::Data {
                    block,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            Opcode::Ack => {
                let block = get_block(&mut buf)?;
                Ok(Packet::Ack { block })
            }
            Opcode::Error => {
                if buf.remaining() < 2 {
                    return Err(TftpError::MalformedPacket(
                        "ERROR packet missing code".to_string(),
                    ));
                }
                let code = ErrorCode::from_u16(buf.get_u16());
                // Some stacks omit the terminator; keep whatever text arrived.
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                let message = String::from_utf8_lossy(&buf[..end]).into_owned();
                Ok(Packet::Error { code, message })
            }
            Opcode::Oack => Ok(Packet::Oack {
                options: get_options(&mut buf)?,
            }),
        }
    }

    fn encoded_len(&self) -> usize {
        let options_len = |options: &[RawOption]| -> usize {
            options
                .iter()
                .map(|o| o.name.len() + o.value.len() + 2)
                .sum()
        };
        2 + match self {
            Packet::Rrq(r) | Packet::Wrq(r) => {
                r.filename.len() + r.mode.as_str().len() + 2 + options_len(&r.options)
            }
            Packet::Data { payload, .. } => 2 + payload.len(),
            Packet::Ack { .. } => 2,
            Packet::Error { message, .. } => 3 + message.len(),
            Packet::Oack { options } => options_len(options),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Rrq(r) => write!(f, "RRQ {} ({})", r.filename, r.mode),
            Packet::Wrq(r) => write!(f, "WRQ {} ({})", r.filename, r.mode),
            Packet::Data { block, payload } => write!(f, "DATA {} ({} bytes)", block, payload.len()),
            Packet::Ack { block } => write!(f, "ACK {}", block),
            Packet::Error { code, message } => write!(f, "ERROR {}: {}", code, message),
            Packet::Oack { options } => write!(f, "OACK ({} options)", options.len()),
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_options(buf: &mut BytesMut, options: &[RawOption]) {
    for option in options {
        put_string(buf, &option.name);
        put_string(buf, &option.value);
    }
}

fn get_block(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(TftpError::MalformedPacket(
            "Block number truncated".to_string(),
        ));
    }
    Ok(buf.get_u16())
}

/// Parse a NUL-terminated string and advance past the terminator
fn get_string(buf: &mut &[u8], max_len: Option<usize>) -> Result<String> {
    let null_pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::MalformedPacket("No null terminator found".to_string()))?;

    if let Some(max) = max_len
        && null_pos > max
    {
        return Err(TftpError::MalformedPacket(format!(
            "String too long (exceeds {} bytes)",
            max
        )));
    }

    let value = std::str::from_utf8(&buf[..null_pos])
        .map_err(|e| TftpError::MalformedPacket(format!("Invalid UTF-8: {}", e)))?
        .to_string();
    buf.advance(null_pos + 1);
    Ok(value)
}

fn get_request(buf: &mut &[u8]) -> Result<Request> {
    let filename = get_string(buf, None)?;
    if filename.is_empty() {
        return Err(TftpError::MalformedPacket("Empty filename".to_string()));
    }
    let mode = get_string(buf, Some(MAX_OPTION_FIELD_LEN))?.parse()?;
    let options = get_options(buf)?;
    Ok(Request {
        filename,
        mode,
        options,
    })
}

fn get_options(buf: &mut &[u8]) -> Result<Vec<RawOption>> {
    let mut options = Vec::new();
    while buf.has_remaining() {
        let name = get_string(buf, Some(MAX_OPTION_FIELD_LEN))?;
        let value = get_string(buf, Some(MAX_OPTION_FIELD_LEN))?;
        options.push(RawOption { name, value });
    }
    Ok(options)
}
