//! SOE control-frame codec and streaming frame I/O.
//!
//! Every message on an SOE connection is framed with a compact header:
//! - 3 bits of opcode
//! - 5 bits of payload length, where the value 31 announces a 32-bit
//!   big-endian length in the following four bytes
//!
//! [`FrameReader`]/[`FrameWriter`] take care of partial reads and writes;
//! [`Message`] maps raw payloads to the typed control vocabulary (OPEN,
//! OPENED, CLOSE, CLOSED, STREAM, TX_CONFIRM, RX_CONFIRM, ERROR).

pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, FrameConfig, Opcode, RawFrame, DEFAULT_MAX_PAYLOAD,
    EXT_HEADER_LEN, MAX_SHORT_LEN, SHORT_HEADER_LEN,
};
pub use error::{FrameError, Result};
pub use message::Message;
pub use reader::FrameReader;
pub use writer::FrameWriter;
