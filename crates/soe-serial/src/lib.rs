//! Serial-port driver seam for SOE.
//!
//! The protocol engine depends only on the [`SerialPort`] trait; the two
//! worker threads of a claimed port (serial reader, serial writer) share one
//! port handle, so every method takes `&self`. Two backends are provided:
//!
//! - [`SystemPort`] over the `serialport` crate, for real devices
//! - [`MockPort`], an in-memory duplex port used by the engine's tests

pub mod error;
pub mod mock;
pub mod system;

use std::sync::Arc;
use std::time::Duration;

pub use error::{Result, SerialError};
pub use mock::MockPort;
pub use system::SystemPort;

/// Serial line parameters applied when a port is claimed.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Baud rate. 8 data bits, no parity, one stop bit, no flow control.
    pub baud: u32,
    /// Upper bound on a single blocking read slice.
    pub read_timeout: Duration,
    /// Upper bound on a single blocking write before it reports a short
    /// count; callers re-issue the remainder.
    pub write_timeout: Duration,
}

impl SerialConfig {
    pub fn new(baud: u32) -> Self {
        Self {
            baud,
            ..Self::default()
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud: 9600,
            read_timeout: Duration::from_millis(10),
            write_timeout: Duration::from_millis(1000),
        }
    }
}

/// A claimed serial device.
///
/// Implementations are shared between one reading and one writing thread;
/// reads must never serialise against writes.
pub trait SerialPort: Send + Sync {
    /// The device name this port was opened with.
    fn name(&self) -> &str;

    /// True until [`SerialPort::close`] is called (or the device dies).
    fn is_open(&self) -> bool;

    /// Mark the port closed and wake any blocked reader. Idempotent. The
    /// underlying device handle is released on drop.
    fn close(&self);

    /// Write as many of `buf`'s bytes as the device accepts within the
    /// configured write timeout. Returns the number written (possibly 0).
    fn write_bytes(&self, buf: &[u8]) -> Result<usize>;

    /// Read whatever is available within the configured read timeout.
    /// Returns 0 when nothing arrived in time.
    fn read_bytes(&self, buf: &mut [u8]) -> Result<usize>;

    /// Read a consecutive burst: wait up to `initial_wait` for the first
    /// byte, then keep reading until `buf` is full or the line goes quiet
    /// for `intra_byte_timeout`. Returns the number of bytes read.
    fn read_bytes_consecutive(
        &self,
        buf: &mut [u8],
        intra_byte_timeout: Duration,
        initial_wait: Duration,
    ) -> Result<usize>;
}

/// Factory through which the engine acquires responder-side ports.
///
/// The CLI installs [`system_opener`]; tests substitute mocks.
pub type PortOpener = Arc<dyn Fn(&str, &SerialConfig) -> Result<Arc<dyn SerialPort>> + Send + Sync>;

/// A [`PortOpener`] producing [`SystemPort`] instances.
pub fn system_opener() -> PortOpener {
    Arc::new(|name, config| {
        let port = SystemPort::open(name, config)?;
        Ok(Arc::new(port) as Arc<dyn SerialPort>)
    })
}
