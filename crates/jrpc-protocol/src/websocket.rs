//! WebSocket codec.
//!
//! Pure functions over bytes: the accept key for the opening handshake,
//! frame header parsing and encoding, payload masking and close frames.
//! All multi-byte lengths and close codes are big-endian.

use base64::{Engine, prelude::BASE64_STANDARD};
use sha1::{Digest, Sha1};

/// Fixed GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only `Sec-WebSocket-Version` accepted.
pub const WS_VERSION: &str = "13";

const FIN: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl OpCode {
    pub fn from_u8(bits: u8) -> Self {
        match bits & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(bits) => bits & 0x0F,
        }
    }

    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }
}

/// Close status codes sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    ProtocolError,
    UnsupportedData,
    InvalidPayload,
    MessageTooBig,
    InternalError,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::ProtocolError => 1002,
            Self::UnsupportedData => 1003,
            Self::InvalidPayload => 1007,
            Self::MessageTooBig => 1009,
            Self::InternalError => 1011,
        }
    }
}

/// `base64(SHA-1(key + WS_GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame headers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    /// Bytes before the payload: 2, 4 or 10, plus 4 when masked.
    pub header_len: usize,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Parse the header at the start of `buf`, or `None` if not all of its
    /// bytes (mask key included) are buffered yet.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let (&b0, &b1) = (buf.first()?, buf.get(1)?);
        let (payload_len, mut offset) = match b1 & 0x7F {
            126 => {
                let bytes: [u8; 2] = buf.get(2..4)?.try_into().ok()?;
                (u64::from(u16::from_be_bytes(bytes)), 4)
            }
            127 => {
                let bytes: [u8; 8] = buf.get(2..10)?.try_into().ok()?;
                (u64::from_be_bytes(bytes), 10)
            }
            n => (u64::from(n), 2),
        };

        let mask = if b1 & MASK_BIT != 0 {
            let key: [u8; 4] = buf.get(offset..offset + 4)?.try_into().ok()?;
            offset += 4;
            Some(key)
        } else {
            None
        };

        Some(Self {
            fin: b0 & FIN != 0,
            opcode: OpCode::from_u8(b0),
            mask,
            header_len: offset,
            payload_len,
        })
    }

    /// Header plus payload, or `None` if that does not fit in `usize`.
    pub fn frame_len(&self) -> Option<usize> {
        usize::try_from(self.payload_len)
            .ok()?
            .checked_add(self.header_len)
    }

    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }
}

/// Header for an unmasked, final server frame carrying `payload_len` bytes.
/// The length class follows the payload size: up to 125 inline, up to
/// 65535 as a 16-bit extension, otherwise a 64-bit extension.
pub fn encode_header(opcode: OpCode, payload_len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(10);
    header.push(FIN | opcode.as_u8());
    push_length(&mut header, 0, payload_len);
    header
}

pub fn encode_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let mut frame = encode_header(opcode, payload.len());
    frame.extend_from_slice(payload);
    frame
}

/// Encode a masked frame the way a client must send it.
pub fn encode_client_frame(fin: bool, opcode: OpCode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.push((if fin { FIN } else { 0 }) | opcode.as_u8());
    push_length(&mut frame, MASK_BIT, payload.len());
    frame.extend_from_slice(&mask);
    let start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[start..], mask);
    frame
}

/// Close frame with a status code and a short reason.
pub fn close_frame(code: CloseCode, reason: &str) -> Vec<u8> {
    // control frame payloads are capped at 125 bytes
    let reason = &reason.as_bytes()[..reason.len().min(123)];
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.code().to_be_bytes());
    payload.extend_from_slice(reason);
    encode_frame(OpCode::Close, &payload)
}

/// XOR `payload` in place with the mask key, cycling by position.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

fn push_length(out: &mut Vec<u8>, mask_bit: u8, len: usize) {
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= 65535 {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}
