use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Result, SerialError};
use crate::SerialPort;

const READ_SLICE: Duration = Duration::from_millis(10);
const WRITE_STALL_SLICE: Duration = Duration::from_millis(10);

/// An in-memory serial port for tests.
///
/// Bytes pushed with [`MockPort::feed`] appear on the read side; bytes the
/// engine writes accumulate and are collected with [`MockPort::take_written`].
/// Reads block with real timeouts so the engine's worker loops behave as
/// they would against a device.
pub struct MockPort {
    name: String,
    open: AtomicBool,
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default)]
struct State {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    stall_writes: bool,
}

impl MockPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            open: AtomicBool::new(true),
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `bytes` available on the read side and wake a blocked reader.
    pub fn feed(&self, bytes: &[u8]) {
        let mut state = self.lock();
        state.incoming.extend(bytes);
        drop(state);
        self.cond.notify_all();
    }

    /// Take everything written to the port so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().written)
    }

    /// Bytes written to the port so far, without consuming them.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// While stalled, writes accept nothing (each attempt blocks for one
    /// write slice and reports 0), simulating a wedged device.
    pub fn set_write_stalled(&self, stalled: bool) {
        self.lock().stall_writes = stalled;
        self.cond.notify_all();
    }

    fn wait_for_input<'a>(
        &self,
        mut state: MutexGuard<'a, State>,
        timeout: Duration,
    ) -> MutexGuard<'a, State> {
        let deadline = Instant::now() + timeout;
        while state.incoming.is_empty() && self.is_open() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (next, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
        state
    }

    fn drain_into(state: &mut State, buf: &mut [u8], offset: usize) -> usize {
        let mut filled = offset;
        while filled < buf.len() {
            match state.incoming.pop_front() {
                Some(byte) => {
                    buf[filled] = byte;
                    filled += 1;
                }
                None => break,
            }
        }
        filled - offset
    }
}

impl SerialPort for MockPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        // Lock and release before notifying; a reader between its predicate
        // check and its wait must not miss the wakeup.
        drop(self.lock());
        self.cond.notify_all();
    }

    fn write_bytes(&self, buf: &[u8]) -> Result<usize> {
        if !self.is_open() {
            return Err(SerialError::Closed);
        }
        let mut state = self.lock();
        if state.stall_writes {
            let (next, _) = self
                .cond
                .wait_timeout(state, WRITE_STALL_SLICE)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
            if state.stall_writes || !self.is_open() {
                return Ok(0);
            }
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn read_bytes(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_bytes_consecutive(buf, Duration::ZERO, READ_SLICE)
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
        if buf.is_empty() {
            return Ok(0);
        }

        let state = self.lock();
        let mut state = self.wait_for_input(state, initial_wait);
        if !self.is_open() {
            return Err(SerialError::Closed);
        }

        let mut total = Self::drain_into(&mut state, buf, 0);
        if total == 0 {
            return Ok(0);
        }

        while total < buf.len() {
            if state.incoming.is_empty() {
                state = self.wait_for_input(state, intra_byte_timeout);
                if state.incoming.is_empty() {
                    break; // the line went quiet
                }
            }
            total += Self::drain_into(&mut state, buf, total);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn feed_then_read() {
        let port = MockPort::new("mock0");
        port.feed(b"HELLO");

        let mut buf = [0u8; 16];
        let n = port
            .read_bytes_consecutive(&mut buf, Duration::from_millis(5), Duration::from_millis(5))
            .unwrap();
        assert_eq!(&buf[..n], b"HELLO");
    }

    #[test]
    fn read_times_out_empty() {
        let port = MockPort::new("mock0");
        let mut buf = [0u8; 16];
        let start = Instant::now();
        let n = port
            .read_bytes_consecutive(&mut buf, Duration::from_millis(1), Duration::from_millis(20))
            .unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn read_wakes_on_feed() {
        let port = Arc::new(MockPort::new("mock0"));
        let reader = Arc::clone(&port);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader
                .read_bytes_consecutive(
                    &mut buf,
                    Duration::from_millis(5),
                    Duration::from_secs(5),
                )
                .unwrap()
        });

        thread::sleep(Duration::from_millis(30));
        port.feed(b"x");
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn writes_accumulate() {
        let port = MockPort::new("mock0");
        assert_eq!(port.write_bytes(b"ab").unwrap(), 2);
        assert_eq!(port.write_bytes(b"cd").unwrap(), 2);
        assert_eq!(port.take_written(), b"abcd");
        assert!(port.take_written().is_empty());
    }

    #[test]
    fn stalled_writes_report_zero() {
        let port = MockPort::new("mock0");
        port.set_write_stalled(true);
        assert_eq!(port.write_bytes(b"xy").unwrap(), 0);
        port.set_write_stalled(false);
        assert_eq!(port.write_bytes(b"xy").unwrap(), 2);
    }

    #[test]
    fn close_unblocks_reader() {
        let port = Arc::new(MockPort::new("mock0"));
        let reader = Arc::clone(&port);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read_bytes_consecutive(
                &mut buf,
                Duration::from_millis(5),
                Duration::from_secs(10),
            )
        });

        thread::sleep(Duration::from_millis(30));
        port.close();
        assert!(matches!(handle.join().unwrap(), Err(SerialError::Closed)));
        assert!(!port.is_open());
    }

    #[test]
    fn closed_port_rejects_io() {
        let port = MockPort::new("mock0");
        port.close();
        assert!(matches!(port.write_bytes(b"x"), Err(SerialError::Closed)));
        let mut buf = [0u8; 1];
        assert!(matches!(port.read_bytes(&mut buf), Err(SerialError::Closed)));
    }
}
