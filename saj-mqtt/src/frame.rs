//! Binary frame codec for the `data_transmission` topics.
//!
//! # Request frame
//!
//! All fields are big-endian.
//!
//! ```text
//! ┌──────────┬──────────┬──────┬──────┬──────────┬───────┬──────────┬──────────┬──────────┬──────────┐
//! │ length   │ id       │ 0x58 │ 0xC9 │ nonce    │ slave │ function │ register │ count /  │ crc16    │
//! │ (2 bytes)│ (2 bytes)│      │      │ (2 bytes)│       │          │ (2 bytes)│ value (2)│ (2 bytes)│
//! └──────────┴──────────┴──────┴──────┴──────────┴───────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `length` counts the bytes that follow it. The CRC covers only the six
//! Modbus bytes (`slave` through `count / value`).
//!
//! # Response frame
//!
//! ```text
//! ┌──────────┬──────────┬───────────┬──────────────────┬─────────────────────┐
//! │ length   │ id       │ timestamp │ function + 0x100 │ function payload    │
//! │ (2 bytes)│ (2 bytes)│ (4 bytes) │ (2 bytes)        │                     │
//! └──────────┴──────────┴───────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! - read: `u8 byte_count | data | u16 crc16`
//! - write: `u16 value (LE) | u16 previous crc16 (LE) | u16 crc16 (BE)`
//!
//! The write payload is byte-swapped by the inverter firmware while its own
//! checksum is not. Both payload checksums start at offset 8, so they cover
//! the operation field as well.

use std::fmt;

use crate::crc::crc16;
use crate::error::FrameError;

/// Magic bytes following the request identifier.
pub const MAGIC: [u8; 2] = [0x58, 0xC9];

/// Modbus "read multiple registers".
pub const READ_FUNCTION: u8 = 0x03;

/// Modbus "write single register".
pub const WRITE_FUNCTION: u8 = 0x06;

/// Offset added to the function code in the response operation field.
pub const RESPONSE_KIND_OFFSET: u16 = 0x100;

/// Size of an encoded request frame.
pub const REQUEST_FRAME_LEN: usize = 16;

/// Size of the fixed response header.
pub const RESPONSE_HEADER_LEN: usize = 10;

/// Size of an encoded write response.
pub const WRITE_RESPONSE_LEN: usize = 16;

// Start of the checksummed range in responses.
const CONTENT_START: usize = 0x08;
const BYTE_COUNT_OFFSET: usize = 0x0a;
const READ_DATA_START: usize = 0x0b;
const WRITE_VALUE_OFFSET: usize = 0x0a;
const WRITE_CRC_OFFSET: usize = 0x0e;

/// Operation carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Read multiple registers.
    Read,
    /// Write a single register.
    Write,
}

impl RequestKind {
    /// Modbus function code for this operation.
    pub fn function_code(self) -> u8 {
        match self {
            RequestKind::Read => READ_FUNCTION,
            RequestKind::Write => WRITE_FUNCTION,
        }
    }

    /// Map a Modbus function code back to an operation.
    pub fn from_function_code(code: u8) -> Option<Self> {
        match code {
            READ_FUNCTION => Some(RequestKind::Read),
            WRITE_FUNCTION => Some(RequestKind::Write),
            _ => None,
        }
    }

    /// Return the string name for this operation.
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Read => "read",
            RequestKind::Write => "write",
        }
    }
}

/// Identifier of an in-flight request.
///
/// The random id alone is not unique: a read and a write may share it, so
/// the pair is the correlation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub id: u16,
    pub kind: RequestKind,
}

impl RequestKey {
    pub fn new(id: u16, kind: RequestKind) -> Self {
        Self { id, kind }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:04x}", self.kind.as_str(), self.id)
    }
}

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub key: RequestKey,
    /// Random value the inverter ignores.
    pub nonce: u16,
    pub slave_address: u8,
    /// Start register for reads, target register for writes.
    pub register: u16,
    /// Register count for reads, value for writes.
    pub argument: u16,
}

impl RequestFrame {
    /// A read of `count` registers starting at `start`.
    pub fn read(id: u16, nonce: u16, slave_address: u8, start: u16, count: u16) -> Self {
        Self {
            key: RequestKey::new(id, RequestKind::Read),
            nonce,
            slave_address,
            register: start,
            argument: count,
        }
    }

    /// A write of `value` into `register`.
    pub fn write(id: u16, nonce: u16, slave_address: u8, register: u16, value: u16) -> Self {
        Self {
            key: RequestKey::new(id, RequestKind::Write),
            nonce,
            slave_address,
            register,
            argument: value,
        }
    }

    /// The six Modbus bytes covered by the checksum.
    fn content(&self) -> [u8; 6] {
        let [reg_hi, reg_lo] = self.register.to_be_bytes();
        let [arg_hi, arg_lo] = self.argument.to_be_bytes();
        [
            self.slave_address,
            self.key.kind.function_code(),
            reg_hi,
            reg_lo,
            arg_hi,
            arg_lo,
        ]
    }

    /// Checksum of the Modbus content, as written into the frame.
    pub fn checksum(&self) -> u16 {
        crc16(&self.content())
    }

    /// Encode into the wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(REQUEST_FRAME_LEN);
        frame.extend_from_slice(&((REQUEST_FRAME_LEN - 2) as u16).to_be_bytes());
        frame.extend_from_slice(&self.key.id.to_be_bytes());
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(&self.nonce.to_be_bytes());
        frame.extend_from_slice(&self.content());
        frame.extend_from_slice(&self.checksum().to_be_bytes());
        frame
    }

    /// Decode a request frame, as the inverter would.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < REQUEST_FRAME_LEN {
            return Err(FrameError::format(format!(
                "request is {} bytes, expected {}",
                bytes.len(),
                REQUEST_FRAME_LEN
            )));
        }

        let length = read_u16(bytes, 0);
        if length as usize != REQUEST_FRAME_LEN - 2 {
            return Err(FrameError::format(format!(
                "request length field is {}, expected {}",
                length,
                REQUEST_FRAME_LEN - 2
            )));
        }
        if bytes[4..6] != MAGIC {
            return Err(FrameError::format(format!(
                "bad magic {:02x}{:02x}",
                bytes[4], bytes[5]
            )));
        }

        let kind = RequestKind::from_function_code(bytes[9]).ok_or_else(|| {
            FrameError::protocol(format!("unexpected function code {:#04x}", bytes[9]))
        })?;

        let expected = read_u16(bytes, 14);
        let computed = crc16(&bytes[8..14]);
        if expected != computed {
            return Err(FrameError::Integrity { expected, computed });
        }

        Ok(Self {
            key: RequestKey::new(read_u16(bytes, 2), kind),
            nonce: read_u16(bytes, 6),
            slave_address: bytes[8],
            register: read_u16(bytes, 10),
            argument: read_u16(bytes, 12),
        })
    }
}

/// Build a read request with a random identifier and nonce.
///
/// `count` is sent as-is; chunking to the per-request maximum is the
/// caller's job.
pub fn build_read_request(start: u16, count: u16, slave_address: u8) -> (RequestKey, Vec<u8>) {
    let request = RequestFrame::read(rand::random(), rand::random(), slave_address, start, count);
    log_request(&request);
    (request.key, request.encode())
}

/// Build a write request with a random identifier and nonce.
pub fn build_write_request(register: u16, value: u16, slave_address: u8) -> (RequestKey, Vec<u8>) {
    let request =
        RequestFrame::write(rand::random(), rand::random(), slave_address, register, value);
    log_request(&request);
    (request.key, request.encode())
}

fn log_request(request: &RequestFrame) {
    tracing::trace!(
        request = %request.key,
        register = format_args!("{:#06x}", request.register),
        argument = request.argument,
        nonce = format_args!("{:04x}", request.nonce),
        crc = format_args!("{:04x}", request.checksum()),
        "Built request frame"
    );
}

/// Fixed header of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub id: u16,
    /// Raw operation field (`function + 0x100`).
    pub operation: u16,
    pub length: u16,
    pub timestamp: u32,
}

impl ResponseHeader {
    /// Operation kind echoed by the inverter.
    pub fn kind(&self) -> Result<RequestKind, FrameError> {
        self.operation
            .checked_sub(RESPONSE_KIND_OFFSET)
            .and_then(|code| u8::try_from(code).ok())
            .and_then(RequestKind::from_function_code)
            .ok_or_else(|| {
                FrameError::protocol(format!(
                    "unexpected response operation {:#06x}",
                    self.operation
                ))
            })
    }

    /// Correlation key of the request this response answers.
    pub fn key(&self) -> Result<RequestKey, FrameError> {
        Ok(RequestKey::new(self.id, self.kind()?))
    }
}

/// Parse the fixed response header.
pub fn parse_header(bytes: &[u8]) -> Result<ResponseHeader, FrameError> {
    if bytes.len() < RESPONSE_HEADER_LEN {
        return Err(FrameError::format(format!(
            "response is {} bytes, header needs {}",
            bytes.len(),
            RESPONSE_HEADER_LEN
        )));
    }

    Ok(ResponseHeader {
        length: read_u16(bytes, 0),
        id: read_u16(bytes, 2),
        timestamp: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        operation: read_u16(bytes, 8),
    })
}

/// Extract the register bytes of a read response, verifying its checksum.
pub fn parse_read_payload(bytes: &[u8]) -> Result<Vec<u8>, FrameError> {
    if bytes.len() <= BYTE_COUNT_OFFSET {
        return Err(FrameError::format(format!(
            "read response is {} bytes, missing byte count",
            bytes.len()
        )));
    }

    let size = bytes[BYTE_COUNT_OFFSET] as usize;
    let data_end = READ_DATA_START + size;
    if bytes.len() < data_end + 2 {
        return Err(FrameError::format(format!(
            "read response announces {} bytes of data but is only {} bytes long",
            size,
            bytes.len()
        )));
    }

    let expected = read_u16(bytes, data_end);
    let computed = crc16(&bytes[CONTENT_START..data_end]);
    if expected != computed {
        return Err(FrameError::Integrity { expected, computed });
    }

    Ok(bytes[READ_DATA_START..data_end].to_vec())
}

/// Extract the echoed value of a write response, verifying its checksum.
pub fn parse_write_payload(bytes: &[u8]) -> Result<u16, FrameError> {
    if bytes.len() < WRITE_RESPONSE_LEN {
        return Err(FrameError::format(format!(
            "write response is {} bytes, expected {}",
            bytes.len(),
            WRITE_RESPONSE_LEN
        )));
    }

    // Firmware quirk: value and previous CRC are little-endian.
    let value = u16::from_le_bytes([bytes[WRITE_VALUE_OFFSET], bytes[WRITE_VALUE_OFFSET + 1]]);
    let previous_crc =
        u16::from_le_bytes([bytes[WRITE_VALUE_OFFSET + 2], bytes[WRITE_VALUE_OFFSET + 3]]);

    let expected = read_u16(bytes, WRITE_CRC_OFFSET);
    let computed = crc16(&bytes[CONTENT_START..WRITE_CRC_OFFSET]);
    if expected != computed {
        return Err(FrameError::Integrity { expected, computed });
    }

    tracing::trace!(
        value,
        previous_crc = format_args!("{:04x}", previous_crc),
        "Decoded write response"
    );

    Ok(value)
}

/// Encode a read response, as the inverter would send it.
pub fn encode_read_response(id: u16, timestamp: u32, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let size = u8::try_from(data.len()).map_err(|_| {
        FrameError::format(format!("{} bytes do not fit a read response", data.len()))
    })?;

    let mut frame = Vec::with_capacity(READ_DATA_START + data.len() + 2);
    frame.extend_from_slice(&((READ_DATA_START + data.len()) as u16).to_be_bytes());
    frame.extend_from_slice(&id.to_be_bytes());
    frame.extend_from_slice(&timestamp.to_be_bytes());
    frame.extend_from_slice(&(RESPONSE_KIND_OFFSET + READ_FUNCTION as u16).to_be_bytes());
    frame.push(size);
    frame.extend_from_slice(data);
    let crc = crc16(&frame[CONTENT_START..]);
    frame.extend_from_slice(&crc.to_be_bytes());
    Ok(frame)
}

/// Encode a write response, including the firmware's byte-order quirk.
pub fn encode_write_response(id: u16, timestamp: u32, value: u16, previous_crc: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(WRITE_RESPONSE_LEN);
    frame.extend_from_slice(&((WRITE_RESPONSE_LEN - 2) as u16).to_be_bytes());
    frame.extend_from_slice(&id.to_be_bytes());
    frame.extend_from_slice(&timestamp.to_be_bytes());
    frame.extend_from_slice(&(RESPONSE_KIND_OFFSET + WRITE_FUNCTION as u16).to_be_bytes());
    frame.extend_from_slice(&value.to_le_bytes());
    frame.extend_from_slice(&previous_crc.to_le_bytes());
    let crc = crc16(&frame[CONTENT_START..]);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}
