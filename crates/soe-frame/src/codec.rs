use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Short frame header: one byte carrying the opcode and the payload length.
pub const SHORT_HEADER_LEN: usize = 1;

/// Extended frame header: the short header plus a 32-bit big-endian length.
pub const EXT_HEADER_LEN: usize = 5;

/// Largest payload length encodable in the short header.
pub const MAX_SHORT_LEN: usize = 30;

/// Length-field value signalling that the extended 32-bit length follows.
const EXT_LEN_SENTINEL: u8 = 31;

/// Default maximum payload size: 64 KiB.
///
/// Generous bound for one serial stack entry (1 KiB by default) plus the
/// port-name and id fields of a STREAM payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// SOE control-frame operation codes (3 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Error = 0,
    Open = 1,
    Opened = 2,
    Close = 3,
    Closed = 4,
    Stream = 5,
    TxConfirm = 6,
    RxConfirm = 7,
}

impl Opcode {
    /// Decode from the low three bits of a header byte. Total: every 3-bit
    /// value is a valid opcode.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x7 {
            0 => Opcode::Error,
            1 => Opcode::Open,
            2 => Opcode::Opened,
            3 => Opcode::Close,
            4 => Opcode::Closed,
            5 => Opcode::Stream,
            6 => Opcode::TxConfirm,
            _ => Opcode::RxConfirm,
        }
    }

    /// Wire name, used in ERROR frames and logs.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Error => "ERROR",
            Opcode::Open => "OPEN",
            Opcode::Opened => "OPENED",
            Opcode::Close => "CLOSE",
            Opcode::Closed => "CLOSED",
            Opcode::Stream => "STREAM",
            Opcode::TxConfirm => "TX_CONFIRM",
            Opcode::RxConfirm => "RX_CONFIRM",
        }
    }
}

/// A decoded frame: opcode plus raw payload bytes.
///
/// Payload schemas are interpreted one level up by [`crate::Message`].
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// byte 0       : opcode[2:0] | length[7:3]      (length 0..=30)
/// bytes 1..=4  : 32-bit big-endian full length, present only when the
///                length field holds the sentinel 31
/// bytes k..    : payload
/// ```
pub fn encode_frame(opcode: Opcode, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }

    if payload.len() > MAX_SHORT_LEN {
        dst.reserve(EXT_HEADER_LEN + payload.len());
        dst.put_u8(opcode as u8 | (EXT_LEN_SENTINEL << 3));
        dst.put_u32(payload.len() as u32);
    } else {
        dst.reserve(SHORT_HEADER_LEN + payload.len());
        dst.put_u8(opcode as u8 | ((payload.len() as u8) << 3));
    }
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes exactly the frame's bytes from the buffer; trailing
/// bytes of a subsequent frame stay in place for the next call.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<RawFrame>> {
    if src.is_empty() {
        return Ok(None);
    }

    let head = src[0];
    let opcode = Opcode::from_bits(head);
    let short_len = (head >> 3) as usize;

    let (header_len, payload_len) = if short_len == EXT_LEN_SENTINEL as usize {
        if src.len() < EXT_HEADER_LEN {
            return Ok(None); // Need more data
        }
        let len = u32::from_be_bytes(src[1..5].try_into().unwrap()) as usize;
        (EXT_HEADER_LEN, len)
    } else {
        (SHORT_HEADER_LEN, short_len)
    };

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    if src.len() < header_len + payload_len {
        return Ok(None); // Need more data
    }

    src.advance(header_len);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(RawFrame { opcode, payload }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 64 KiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
