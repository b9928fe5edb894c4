use std::time::Duration;

/// Errors that can occur in SOE link operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] soe_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] soe_frame::FrameError),

    /// Serial-driver error.
    #[error("serial error: {0}")]
    Serial(#[from] soe_serial::SerialError),

    /// A port claim could not be established or released.
    #[error("port claim failed: {0}")]
    ClaimFailed(String),

    /// The peer did not answer a claim sequence in time.
    #[error("claim sequence timed out after {0:?}")]
    Timeout(Duration),

    /// The connection is no longer active.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, LinkError>;
