use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{encode_frame, Opcode, RawFrame};
use crate::error::{FrameError, Result};

/// A typed SOE control message.
///
/// All multi-byte fields are big-endian; names are raw bytes prefixed with a
/// 16-bit length. [`Message::decode`] failures are per-frame: the connection
/// stays up and the peer is informed with an ERROR frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Informational error report. Either field may be absent.
    Error {
        port: Option<String>,
        message: Option<String>,
    },
    /// Claim the named port on the receiving peer at the given baud rate.
    Open { baud: u32, port: String },
    /// The named port was claimed successfully.
    Opened { port: String },
    /// Release the named port on the receiving peer.
    Close { port: String },
    /// The named port was released (reply, or unsolicited on local close).
    Closed { port: String },
    /// Payload bytes for the named port. Empty data is a keep-alive.
    Stream { port: String, id: u32, data: Bytes },
    /// The payload with this id was written out the receiving peer's serial.
    TxConfirm { port: String, id: u32 },
    /// The payload with this id arrived at the receiving peer.
    RxConfirm { port: String, id: u32 },
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Error { .. } => Opcode::Error,
            Message::Open { .. } => Opcode::Open,
            Message::Opened { .. } => Opcode::Opened,
            Message::Close { .. } => Opcode::Close,
            Message::Closed { .. } => Opcode::Closed,
            Message::Stream { .. } => Opcode::Stream,
            Message::TxConfirm { .. } => Opcode::TxConfirm,
            Message::RxConfirm { .. } => Opcode::RxConfirm,
        }
    }

    /// Encode this message as a complete frame (header + payload) into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let mut payload = BytesMut::new();
        match self {
            Message::Error { port, message } => {
                if let Some(port) = port {
                    put_name(&mut payload, port)?;
                }
                if let Some(message) = message {
                    put_name(&mut payload, message)?;
                }
            }
            Message::Open { baud, port } => {
                payload.put_u32(*baud);
                put_name(&mut payload, port)?;
            }
            Message::Opened { port } | Message::Close { port } | Message::Closed { port } => {
                put_name(&mut payload, port)?;
            }
            Message::Stream { port, id, data } => {
                put_name(&mut payload, port)?;
                payload.put_u32(*id);
                payload.put_slice(data);
            }
            Message::TxConfirm { port, id } | Message::RxConfirm { port, id } => {
                put_name(&mut payload, port)?;
                payload.put_u32(*id);
            }
        }
        encode_frame(self.opcode(), &payload, dst)
    }

    /// Decode a raw frame's payload according to its opcode.
    pub fn decode(frame: RawFrame) -> Result<Message> {
        let opcode = frame.opcode;
        let mut buf = frame.payload;
        match opcode {
            Opcode::Error => {
                if buf.is_empty() {
                    return Ok(Message::Error {
                        port: None,
                        message: None,
                    });
                }
                let first = take_name(&mut buf, opcode)?;
                if buf.has_remaining() {
                    let second = take_name(&mut buf, opcode)?;
                    Ok(Message::Error {
                        port: Some(first),
                        message: Some(second),
                    })
                } else {
                    // A single block is indistinguishable from a port-only
                    // payload; decoded as the message, which is what logging
                    // wants.
                    Ok(Message::Error {
                        port: None,
                        message: Some(first),
                    })
                }
            }
            Opcode::Open => {
                if buf.remaining() < 4 {
                    return Err(malformed(opcode, "truncated baud rate"));
                }
                let baud = buf.get_u32();
                let port = take_name(&mut buf, opcode)?;
                Ok(Message::Open { baud, port })
            }
            Opcode::Opened => Ok(Message::Opened {
                port: take_name(&mut buf, opcode)?,
            }),
            Opcode::Close => Ok(Message::Close {
                port: take_name(&mut buf, opcode)?,
            }),
            Opcode::Closed => Ok(Message::Closed {
                port: take_name(&mut buf, opcode)?,
            }),
            Opcode::Stream => {
                let port = take_name(&mut buf, opcode)?;
                if buf.remaining() < 4 {
                    return Err(malformed(opcode, "truncated transmission id"));
                }
                let id = buf.get_u32();
                let data = buf.copy_to_bytes(buf.remaining());
                Ok(Message::Stream { port, id, data })
            }
            Opcode::TxConfirm | Opcode::RxConfirm => {
                let port = take_name(&mut buf, opcode)?;
                if buf.remaining() < 4 {
                    return Err(malformed(opcode, "truncated confirmation id"));
                }
                let id = buf.get_u32();
                if opcode == Opcode::TxConfirm {
                    Ok(Message::TxConfirm { port, id })
                } else {
                    Ok(Message::RxConfirm { port, id })
                }
            }
        }
    }
}

fn put_name(dst: &mut BytesMut, name: &str) -> Result<()> {
    if name.len() > u16::MAX as usize {
        return Err(FrameError::PortNameTooLong { len: name.len() });
    }
    dst.put_u16(name.len() as u16);
    dst.put_slice(name.as_bytes());
    Ok(())
}

fn take_name(buf: &mut Bytes, opcode: Opcode) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(malformed(opcode, "truncated name length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(malformed(opcode, "name length exceeds payload"));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| malformed(opcode, "name is not valid UTF-8"))
}

fn malformed(opcode: Opcode, reason: &'static str) -> FrameError {
    FrameError::Malformed {
        opcode: opcode.name(),
        reason,
    }
}
