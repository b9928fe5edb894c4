use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, StopBits};
use tracing::debug;

use crate::error::{Result, SerialError};
use crate::{SerialConfig, SerialPort};

type Handle = Box<dyn serialport::SerialPort>;

/// A real serial device, backed by the `serialport` crate.
///
/// The device is opened once and cloned into two handles so that a blocked
/// read never delays a write. 8N1, no flow control, matching what the
/// protocol expects from the line.
pub struct SystemPort {
    name: String,
    open: AtomicBool,
    reader: Mutex<Handle>,
    writer: Mutex<Handle>,
}

impl std::fmt::Debug for SystemPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemPort")
            .field("name", &self.name)
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}

impl SystemPort {
    /// Open and configure the named device.
    pub fn open(name: &str, config: &SerialConfig) -> Result<Self> {
        let reader = serialport::new(name, config.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(config.read_timeout)
            .open()
            .map_err(|source| SerialError::Open {
                port: name.to_string(),
                source,
            })?;

        let mut writer = reader.try_clone().map_err(|source| SerialError::Open {
            port: name.to_string(),
            source,
        })?;
        writer.set_timeout(config.write_timeout)?;

        debug!(port = name, baud = config.baud, "opened serial port");

        Ok(Self {
            name: name.to_string(),
            open: AtomicBool::new(true),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

impl SerialPort for SystemPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(port = %self.name, "closed serial port");
        }
    }

    fn write_bytes(&self, buf: &[u8]) -> Result<usize> {
        if !self.is_open() {
            return Err(SerialError::Closed);
        }
        let mut handle = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match handle.write(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::TimedOut => Ok(0),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(SerialError::Io(err)),
        }
    }

    fn read_bytes(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.is_open() {
            return Err(SerialError::Closed);
        }
        let mut handle = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        read_slice(&mut handle, buf)
    }

    fn read_bytes_consecutive(
        &self,
        buf: &mut [u8],
        intra_byte_timeout: Duration,
        initial_wait: Duration,
    ) -> Result<usize> {
        if !self.is_open() {
            return Err(SerialError::Closed);
        }
        let mut handle = self.reader.lock().unwrap_or_else(PoisonError::into_inner);

        handle.set_timeout(initial_wait)?;
        let mut total = read_slice(&mut handle, buf)?;
        if total == 0 {
            return Ok(0);
        }

        // First byte seen; keep going until the line pauses.
        handle.set_timeout(intra_byte_timeout)?;
        while total < buf.len() {
            let read = read_slice(&mut handle, &mut buf[total..])?;
            if read == 0 {
                break;
            }
            total += read;
        }
        Ok(total)
    }
}

fn read_slice(handle: &mut Handle, buf: &mut [u8]) -> Result<usize> {
    match handle.read(buf) {
        Ok(n) => Ok(n),
        Err(err) if err.kind() == ErrorKind::TimedOut => Ok(0),
        Err(err) if err.kind() == ErrorKind::Interrupted => Ok(0),
        Err(err) => Err(SerialError::Io(err)),
    }
}
