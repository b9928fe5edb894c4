/// Errors that can occur in serial driver operations.
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    /// Failed to open the named device.
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        source: serialport::Error,
    },

    /// The port has been closed; no further I/O is possible.
    #[error("serial port is closed")]
    Closed,

    /// Failed to reconfigure the device (baud, timeouts).
    #[error("failed to configure serial port: {0}")]
    Configure(#[from] serialport::Error),

    /// An I/O error occurred while reading or writing.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
