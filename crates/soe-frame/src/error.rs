/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds the configured maximum size. On the receive path
    /// this is fatal for the connection: the stream offset is lost.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A port name does not fit the 16-bit length prefix.
    #[error("port name too long ({len} bytes, max 65535)")]
    PortNameTooLong { len: usize },

    /// A frame payload is shorter than its opcode requires, or a field is
    /// unparseable. Recoverable: the frame boundary itself was intact.
    #[error("malformed {opcode} frame: {reason}")]
    Malformed {
        opcode: &'static str,
        reason: &'static str,
    },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True when the error invalidates the whole connection rather than the
    /// single frame it occurred in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FrameError::PayloadTooLarge { .. } | FrameError::Io(_) | FrameError::ConnectionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
