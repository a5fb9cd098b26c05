//! Fixed-size command envelope exchanged between every subsystem and transport.
//!
//! Wire layout (128 bytes, no padding):
//!
//! | byte | field             |
//! |------|-------------------|
//! | 0    | `from`            |
//! | 1    | `dest`            |
//! | 2    | header: op (bits 7-6) \| command id (bits 5-0) |
//! | 3    | `transmission_id` |
//! | 4..  | body (124 bytes)  |
//!
//! Multi-byte integers inside the body are big-endian.

use thiserror::Error;

pub const ENVELOPE_SIZE: usize = 128;
pub const HEADER_SIZE: usize = 4;
pub const BODY_SIZE: usize = ENVELOPE_SIZE - HEADER_SIZE;

const OP_MASK: u8 = 0b1100_0000;
const ID_MASK: u8 = 0b0011_1111;

pub const MAX_COMMAND_ID: u8 = ID_MASK;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("body access of {width} bytes at offset {offset} exceeds {BODY_SIZE} byte body")]
    OutOfBounds { offset: usize, width: usize },
    #[error("expected {ENVELOPE_SIZE} bytes, got {0}")]
    WrongLength(usize),
    #[error("command id {0} does not fit in 6 bits")]
    InvalidCommandId(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Set,
    Get,
    Response,
    Error,
}

impl Operation {
    pub fn bits(self) -> u8 {
        match self {
            Self::Set => 0b0000_0000,
            Self::Get => 0b0100_0000,
            Self::Response => 0b1000_0000,
            Self::Error => 0b1100_0000,
        }
    }

    pub fn from_bits(header: u8) -> Self {
        match header & OP_MASK {
            0b0000_0000 => Self::Set,
            0b0100_0000 => Self::Get,
            0b1000_0000 => Self::Response,
            _ => Self::Error,
        }
    }

    /// SET and GET are requests; RESPONSE and ERROR only ever travel back.
    pub fn is_request(self) -> bool {
        matches!(self, Self::Set | Self::Get)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "SET",
            Self::Get => "GET",
            Self::Response => "RESPONSE",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header(u8);

impl Header {
    pub fn new(op: Operation, command_id: u8) -> Result<Self, EnvelopeError> {
        if command_id > MAX_COMMAND_ID {
            return Err(EnvelopeError::InvalidCommandId(command_id));
        }
        Ok(Self(op.bits() | command_id))
    }

    pub fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn op(self) -> Operation {
        Operation::from_bits(self.0)
    }

    pub fn command_id(self) -> u8 {
        self.0 & ID_MASK
    }

    /// Same command id, different operation. Used to build replies.
    pub fn with_op(self, op: Operation) -> Self {
        Self(op.bits() | self.command_id())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: u8,
    pub dest: u8,
    pub header: Header,
    pub transmission_id: u8,
    pub body: [u8; BODY_SIZE],
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            from: 0,
            dest: 0,
            header: Header::from_raw(0),
            transmission_id: 0,
            body: [0; BODY_SIZE],
        }
    }
}

impl core::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let used = self
            .body
            .iter()
            .rposition(|byte| *byte != 0)
            .map_or(0, |last| last + 1);
        f.debug_struct("Envelope")
            .field("from", &self.from)
            .field("dest", &self.dest)
            .field("op", &self.header.op())
            .field("id", &self.header.command_id())
            .field("transmission_id", &self.transmission_id)
            .field("body", &&self.body[..used])
            .finish()
    }
}

impl Envelope {
    /// Request addressed to `dest`; `from` and `transmission_id` are stamped at relay time.
    pub fn request(dest: u8, op: Operation, command_id: u8) -> Result<Self, EnvelopeError> {
        Ok(Self {
            dest,
            header: Header::new(op, command_id)?,
            ..Self::default()
        })
    }

    pub fn op(&self) -> Operation {
        self.header.op()
    }

    pub fn command_id(&self) -> u8 {
        self.header.command_id()
    }

    /// ERROR reply built locally by whoever gave up on this request, as if the
    /// destination had answered it.
    pub fn error_reply(&self, text: &str) -> Self {
        let mut reply = Self {
            from: self.dest,
            dest: self.from,
            header: self.header.with_op(Operation::Error),
            transmission_id: self.transmission_id,
            ..Self::default()
        };
        reply.write_str(text);
        reply
    }

    pub fn to_bytes(&self) -> [u8; ENVELOPE_SIZE] {
        let mut raw = [0_u8; ENVELOPE_SIZE];
        raw[0] = self.from;
        raw[1] = self.dest;
        raw[2] = self.header.raw();
        raw[3] = self.transmission_id;
        raw[HEADER_SIZE..].copy_from_slice(&self.body);
        raw
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, EnvelopeError> {
        if raw.len() != ENVELOPE_SIZE {
            return Err(EnvelopeError::WrongLength(raw.len()));
        }
        Self::from_prefix(raw)
    }

    /// Decodes up to one envelope worth of bytes, zero-filling whatever is missing.
    /// Nested trigger envelopes only carry a prefix of the full layout.
    pub fn from_prefix(raw: &[u8]) -> Result<Self, EnvelopeError> {
        if raw.len() > ENVELOPE_SIZE {
            return Err(EnvelopeError::WrongLength(raw.len()));
        }

        let mut full = [0_u8; ENVELOPE_SIZE];
        full[..raw.len()].copy_from_slice(raw);

        let mut body = [0_u8; BODY_SIZE];
        body.copy_from_slice(&full[HEADER_SIZE..]);

        Ok(Self {
            from: full[0],
            dest: full[1],
            header: Header::from_raw(full[2]),
            transmission_id: full[3],
            body,
        })
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8, EnvelopeError> {
        Ok(self.body_slice(offset, 1)?[0])
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16, EnvelopeError> {
        let bytes = self.body_slice(offset, 2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, EnvelopeError> {
        let bytes = self.body_slice(offset, 4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) -> Result<(), EnvelopeError> {
        self.write_bytes(offset, &[value])
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) -> Result<(), EnvelopeError> {
        self.write_bytes(offset, &value.to_be_bytes())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<(), EnvelopeError> {
        self.write_bytes(offset, &value.to_be_bytes())
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), EnvelopeError> {
        let end = Self::checked_end(offset, bytes.len())?;
        self.body[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, width: usize) -> Result<&[u8], EnvelopeError> {
        self.body_slice(offset, width)
    }

    /// Replaces the body with `text`, zero-padded. Text longer than the body is
    /// truncated so at least one terminating zero remains.
    pub fn write_str(&mut self, text: &str) {
        self.body = [0; BODY_SIZE];
        let len = text.len().min(BODY_SIZE - 1);
        self.body[..len].copy_from_slice(&text.as_bytes()[..len]);
    }

    /// Body interpreted as zero-terminated text; invalid UTF-8 is replaced.
    pub fn body_str(&self) -> String {
        let end = self
            .body
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(BODY_SIZE);
        String::from_utf8_lossy(&self.body[..end]).into_owned()
    }

    fn body_slice(&self, offset: usize, width: usize) -> Result<&[u8], EnvelopeError> {
        let end = Self::checked_end(offset, width)?;
        Ok(&self.body[offset..end])
    }

    fn checked_end(offset: usize, width: usize) -> Result<usize, EnvelopeError> {
        offset
            .checked_add(width)
            .filter(|end| *end <= BODY_SIZE)
            .ok_or(EnvelopeError::OutOfBounds { offset, width })
    }
}

/// Cloud direct methods carry envelopes as a JSON array of byte values.
pub fn encode_json(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&envelope.to_bytes().to_vec())
}

/// Accepts up to one envelope worth of byte values; missing trailing bytes are zero.
pub fn decode_json(payload: &[u8]) -> Result<Envelope, JsonEnvelopeError> {
    let values: Vec<u8> = serde_json::from_slice(payload)?;
    Ok(Envelope::from_prefix(&values)?)
}

#[derive(Debug, Error)]
pub enum JsonEnvelopeError {
    #[error("payload is not a JSON array of bytes: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}
