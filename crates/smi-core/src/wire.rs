//! SMI wire format: on-wire types for the shared memory interface.
//!
//! These types ARE the protocol. Every byte position documented here is read
//! by existing memory controllers; changing a layout breaks interoperability.
//!
//! A link carries flits: eight data bytes plus an end-of-frame count. Frames
//! are runs of flits terminated by the first flit with a non-zero count,
//! which also gives the number of valid bytes in that final flit.
//!
//! Header structs are #[repr(C)] with byte-aligned fields and use zerocopy
//! derives, so they serialize to exactly the documented layout with no
//! unsafe code.

use std::fmt;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Memory write request frame type.
pub const SMI_MEM_WRITE_REQ: u8 = 0x01;
/// Memory write response frame type.
pub const SMI_MEM_WRITE_RESP: u8 = 0xFE;
/// Memory read request frame type.
pub const SMI_MEM_READ_REQ: u8 = 0x02;
/// Memory read response frame type.
pub const SMI_MEM_READ_RESP: u8 = 0xFD;

/// Default buffered read or write.
pub const DEFAULT_OPTIONS: u8 = 0x00;
/// Direct unbuffered read or write.
pub const MEM_OPT_UNBUFFERED: u8 = 0x01;

/// Burst fragment size in bytes. No segment on the link crosses a multiple
/// of this value.
pub const SMI_MEM_BURST_SIZE: usize = 256;

/// Flits needed for the largest frame: a full burst of payload plus up to
/// 16 bytes of header.
pub const SMI_MEM_FRAME64_SIZE: usize = 2 + SMI_MEM_BURST_SIZE / 8;

/// In-flight transactions supported by each arbitrated port.
pub const SMI_MEM_IN_FLIGHT_LIMIT: usize = 4;

/// Data bytes carried by one flit.
pub const FLIT_BYTES: usize = 8;

/// Response status bit signalling a failed transaction.
pub const STATUS_ERROR: u8 = 0x02;

/// Request header length: opcode, options, tag, address, length.
pub const REQUEST_HEADER_LEN: usize = 14;

/// Response header length: opcode, status, tag.
pub const RESPONSE_HEADER_LEN: usize = 4;

// ── Flit ──────────────────────────────────────────────────────────────────────

/// The atomic transfer unit on an SMI link.
///
/// Wire size: 9 bytes (8 data + end-of-frame count).
#[derive(Clone, Copy, Default, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Flit {
    /// Data lanes. Lanes past the valid count of a final flit are zero.
    pub data: [u8; FLIT_BYTES],

    /// End-of-frame count. 0 = more flits follow; 1..=8 = this flit ends the
    /// frame and holds that many valid bytes.
    pub eofc: u8,
}

assert_eq_size!(Flit, [u8; 9]);

impl Flit {
    pub fn new(data: [u8; FLIT_BYTES], eofc: u8) -> Self {
        Self { data, eofc }
    }

    /// True if this flit terminates its frame.
    pub fn is_last(&self) -> bool {
        self.eofc != 0
    }

    /// Number of meaningful data bytes in this flit.
    pub fn valid_len(&self) -> usize {
        match self.eofc {
            0 => FLIT_BYTES,
            n => (n as usize).min(FLIT_BYTES),
        }
    }

    /// Tag field of a header flit (bytes 2 and 3, little-endian).
    pub fn tag(&self) -> u16 {
        u16::from_le_bytes([self.data[2], self.data[3]])
    }

    pub fn set_tag(&mut self, tag: u16) {
        let [lo, hi] = tag.to_le_bytes();
        self.data[2] = lo;
        self.data[3] = hi;
    }

    /// Port identifier written into byte 2 by an arbiter.
    pub fn port_id(&self) -> u8 {
        self.data[2]
    }

    /// Locally allocated tag written into byte 3 by an arbiter.
    pub fn local_tag(&self) -> u8 {
        self.data[3]
    }
}

impl fmt::Debug for Flit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flit")
            .field("data", &hex::encode(self.data))
            .field("eofc", &self.eofc)
            .finish()
    }
}

// ── Opcodes ───────────────────────────────────────────────────────────────────

/// Frame type carried in byte 0 of every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    WriteRequest = SMI_MEM_WRITE_REQ,
    ReadRequest = SMI_MEM_READ_REQ,
    WriteResponse = SMI_MEM_WRITE_RESP,
    ReadResponse = SMI_MEM_READ_RESP,
}

impl Opcode {
    /// The response type a memory server answers this request with.
    pub fn response(self) -> Option<Opcode> {
        match self {
            Opcode::WriteRequest => Some(Opcode::WriteResponse),
            Opcode::ReadRequest => Some(Opcode::ReadResponse),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, Opcode::WriteRequest | Opcode::ReadRequest)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            SMI_MEM_WRITE_REQ => Ok(Opcode::WriteRequest),
            SMI_MEM_READ_REQ => Ok(Opcode::ReadRequest),
            SMI_MEM_WRITE_RESP => Ok(Opcode::WriteResponse),
            SMI_MEM_READ_RESP => Ok(Opcode::ReadResponse),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

// ── Operand width ─────────────────────────────────────────────────────────────

/// Operand width of a single transfer or burst element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    U8,
    U16,
    U32,
    U64,
}

impl Width {
    /// Size of one element in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Width::U8 => 1,
            Width::U16 => 2,
            Width::U32 => 4,
            Width::U64 => 8,
        }
    }

    /// Number of low address bits ignored for this width.
    pub fn align_bits(self) -> u32 {
        self.bytes().trailing_zeros()
    }

    /// Round an address down to this width's natural alignment.
    pub fn align(self, address: u64) -> u64 {
        address & !((self.bytes() as u64) - 1)
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.bytes() * 8)
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Outcome of one bus transaction as reported by the memory side.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Ok,
    Failed,
}

impl Status {
    /// Decode byte 1 of a response header.
    pub fn from_status_byte(byte: u8) -> Self {
        if byte & STATUS_ERROR == 0 {
            Status::Ok
        } else {
            Status::Failed
        }
    }

    pub fn to_status_byte(self) -> u8 {
        match self {
            Status::Ok => 0x00,
            Status::Failed => STATUS_ERROR,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Logical AND of two outcomes.
    pub fn and(self, other: Status) -> Status {
        if self.is_ok() && other.is_ok() {
            Status::Ok
        } else {
            Status::Failed
        }
    }
}

// ── Request header ────────────────────────────────────────────────────────────

/// Header of every request frame.
///
/// Wire size: 14 bytes. Occupies all of flit 0 and lanes 0-5 of flit 1;
/// write payload starts at lane 6 of flit 1.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct RequestHeader {
    /// SMI_MEM_WRITE_REQ or SMI_MEM_READ_REQ.
    pub opcode: u8,

    /// Access options, e.g. MEM_OPT_UNBUFFERED.
    pub options: u8,

    /// Requester tag. Zero on an unarbitrated link; an arbiter rewrites it
    /// to (port id, local tag).
    pub tag: [u8; 2],

    /// Byte address, already masked to the operand alignment.
    pub address: U64<LittleEndian>,

    /// Transfer length in bytes.
    pub length: U16<LittleEndian>,
}

assert_eq_size!(RequestHeader, [u8; REQUEST_HEADER_LEN]);

impl RequestHeader {
    pub fn opcode(&self) -> Result<Opcode, WireError> {
        Opcode::try_from(self.opcode)
    }

    pub fn address(&self) -> u64 {
        self.address.get()
    }

    pub fn length(&self) -> u16 {
        self.length.get()
    }

    pub fn tag(&self) -> u16 {
        u16::from_le_bytes(self.tag)
    }
}

/// Build a request header.
pub fn encode_request(opcode: Opcode, options: u8, address: u64, length: u16, tag: u16) -> RequestHeader {
    RequestHeader {
        opcode: opcode.into(),
        options,
        tag: tag.to_le_bytes(),
        address: U64::new(address),
        length: U16::new(length),
    }
}

/// Parse a request header from the first 14 bytes of a frame.
pub fn decode_request(bytes: &[u8]) -> Result<RequestHeader, WireError> {
    let header = RequestHeader::read_from_prefix(bytes)
        .ok_or(WireError::ShortHeader { expected: REQUEST_HEADER_LEN, actual: bytes.len() })?;
    let opcode = header.opcode()?;
    if !opcode.is_request() {
        return Err(WireError::UnexpectedOpcode(opcode.into()));
    }
    Ok(header)
}

// ── Response header ───────────────────────────────────────────────────────────

/// Header of every response frame.
///
/// Wire size: 4 bytes. Read payload starts at lane 4 of flit 0.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ResponseHeader {
    /// SMI_MEM_WRITE_RESP or SMI_MEM_READ_RESP.
    pub opcode: u8,

    /// Bit 1 set = transaction failed. Other bits reserved.
    pub status: u8,

    /// Tag copied from the request.
    pub tag: [u8; 2],
}

assert_eq_size!(ResponseHeader, [u8; RESPONSE_HEADER_LEN]);

pub fn encode_response(opcode: Opcode, status: Status, tag: u16) -> ResponseHeader {
    ResponseHeader {
        opcode: opcode.into(),
        status: status.to_status_byte(),
        tag: tag.to_le_bytes(),
    }
}

/// Fields of a response header flit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedResponse {
    pub opcode: u8,
    pub tag: u16,
    pub status: Status,
    /// Lanes 4-7 of the header flit: the first payload bytes of a read
    /// response, unused for writes.
    pub first_payload: [u8; 4],
}

/// Decode the header flit of a response frame.
///
/// The opcode is reported as-is; callers that care about it check it
/// themselves so that a response never blocks on an unknown type byte.
pub fn decode_response_header(flit: &Flit) -> DecodedResponse {
    DecodedResponse {
        opcode: flit.data[0],
        tag: flit.tag(),
        status: Status::from_status_byte(flit.data[1]),
        first_payload: [flit.data[4], flit.data[5], flit.data[6], flit.data[7]],
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown opcode byte: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("opcode 0x{0:02x} not valid here")]
    UnexpectedOpcode(u8),

    #[error("header needs {expected} bytes, got {actual}")]
    ShortHeader { expected: usize, actual: usize },

    #[error("end-of-frame count {0} out of range")]
    BadEndMarker(u8),

    #[error("flit received after end of frame")]
    PastEndOfFrame,

    #[error("frame has no terminating flit")]
    Unterminated,

    #[error("frame is empty")]
    EmptyFrame,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
