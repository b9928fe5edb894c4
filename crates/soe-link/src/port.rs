use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use soe_serial::SerialPort;

use crate::config::LinkConfig;
use crate::seq;

/// Callback invoked when the reception stack gains data; wakes the socket
/// handler's outbound scheduler.
pub type NewDataFn = Box<dyn Fn() + Send + Sync>;

/// Callback invoked after a payload has been fully written to the serial
/// device; the socket handler answers with TX_CONFIRM.
pub type TxConfirmFn = Box<dyn Fn(u32) + Send + Sync>;

struct TxEntry {
    data: Bytes,
}

/// Network-received payloads awaiting serial transmission, strictly in txid
/// order.
struct TxStack {
    next_txid: u32,
    entries: BTreeMap<u32, TxEntry>,
}

struct RxEntry {
    data: Vec<u8>,
    time_to_resend: Instant,
    rx_confirmed: bool,
}

impl RxEntry {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            time_to_resend: Instant::now(),
            rx_confirmed: false,
        }
    }
}

/// Serial-received payloads awaiting network transmission and confirmation.
///
/// Keys are contiguous in `[last_transmitted_rxid, next_free_rxid]` under
/// wrap-around ordering:
///
/// ```text
/// last_transmitted     next_transmit        next_free
///       │                    │                  │
///  ─────┼────────────────────┼──────────────────┼───▶ rxid space
///       │ awaiting TX_CONFIRM│ awaiting 1st send│ accumulating
/// ```
struct RxStack {
    next_free_rxid: u32,
    next_transmit_rxid: u32,
    last_transmitted_rxid: u32,
    entries: BTreeMap<u32, RxEntry>,
}

struct Shared {
    port: Arc<dyn SerialPort>,
    config: LinkConfig,
    tx: Mutex<TxStack>,
    tx_cond: Condvar,
    rx: Mutex<RxStack>,
    rx_cond: Condvar,
    new_data: NewDataFn,
    tx_confirm: TxConfirmFn,
}

impl Shared {
    fn lock_tx(&self) -> MutexGuard<'_, TxStack> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_rx(&self) -> MutexGuard<'_, RxStack> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handles one claimed serial port: owns the TX and RX stacks and the two
/// worker threads draining them (serial writer, serial reader).
///
/// Dropping the handler closes the port, releases both workers and joins
/// them.
pub struct PortHandler {
    shared: Arc<Shared>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl PortHandler {
    /// Take ownership of an open serial port and start the worker threads.
    pub fn spawn(
        port: Arc<dyn SerialPort>,
        config: LinkConfig,
        new_data: NewDataFn,
        tx_confirm: TxConfirmFn,
    ) -> Self {
        let shared = Arc::new(Shared {
            port,
            config,
            tx: Mutex::new(TxStack {
                next_txid: 0,
                entries: BTreeMap::new(),
            }),
            tx_cond: Condvar::new(),
            rx: Mutex::new(RxStack {
                next_free_rxid: 0,
                next_transmit_rxid: 0,
                last_transmitted_rxid: 0,
                entries: BTreeMap::new(),
            }),
            rx_cond: Condvar::new(),
            new_data,
            tx_confirm,
        });

        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || shared.run_serial_writer())
        };
        let reader = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || shared.run_serial_reader())
        };

        Self {
            shared,
            writer: Some(writer),
            reader: Some(reader),
        }
    }

    /// True as long as the underlying serial port is operational.
    pub fn is_open(&self) -> bool {
        self.shared.port.is_open()
    }

    /// The device name of the handled port.
    pub fn port_name(&self) -> &str {
        self.shared.port.name()
    }

    /// Queue a network-received payload for serial transmission.
    ///
    /// Returns `true` when the payload is queued or has already been
    /// delivered (past txid: duplicates are absorbed). Returns `false` when
    /// the port is closed, or when the stack is at its limit and `txid` is
    /// not the next id due: out-of-order arrivals never grow the stack past
    /// the limit; the peer retransmits later.
    pub fn send(&self, txid: u32, data: &[u8]) -> bool {
        if !self.shared.port.is_open() {
            return false;
        }

        // Keep-alives carry no payload and never occupy a slot.
        if data.is_empty() {
            return true;
        }

        let mut tx = self.shared.lock_tx();
        if seq::before(txid, tx.next_txid) {
            return true;
        }

        if tx.entries.len() >= self.shared.config.serial_rx_stack_limit && txid != tx.next_txid {
            drop(tx);
            self.shared.tx_cond.notify_all();
            return false;
        }

        tx.entries.insert(
            txid,
            TxEntry {
                data: Bytes::copy_from_slice(data),
            },
        );
        trace!(txid, len = data.len(), "queued payload for serial");
        drop(tx);
        self.shared.tx_cond.notify_all();
        true
    }

    /// Produce the next payload the network should carry for this port.
    ///
    /// Retransmissions take precedence over new data so that recovery never
    /// starves: the first unconfirmed entry whose resend time has elapsed is
    /// returned before the next untransmitted entry. Either way the entry's
    /// resend timer is re-armed.
    pub fn read(&self) -> Option<(u32, Bytes)> {
        if !self.shared.port.is_open() {
            return None;
        }

        let now = Instant::now();
        let rep_interval = self.shared.config.inet_tx_rep_interval;
        let mut rx = self.shared.lock_rx();

        // Sweep for payloads whose reception might have failed.
        let mut id = rx.last_transmitted_rxid;
        while id != rx.next_transmit_rxid {
            if let Some(entry) = rx.entries.get_mut(&id) {
                if !entry.rx_confirmed && entry.time_to_resend <= now {
                    entry.time_to_resend = now + rep_interval;
                    trace!(rxid = id, "retransmitting unconfirmed payload");
                    return Some((id, Bytes::copy_from_slice(&entry.data)));
                }
            }
            id = id.wrapping_add(1);
        }

        // First transmission of the next entry, if it holds data yet.
        let next = rx.next_transmit_rxid;
        if let Some(entry) = rx.entries.get_mut(&next) {
            if !entry.data.is_empty() {
                entry.time_to_resend = now + rep_interval;
                let payload = Bytes::copy_from_slice(&entry.data);
                rx.next_transmit_rxid = next.wrapping_add(1);
                // The transmitted entry is sealed; fresh serial bytes go to
                // a new slot.
                if seq::before(rx.next_free_rxid, rx.next_transmit_rxid) {
                    rx.next_free_rxid = rx.next_transmit_rxid;
                }
                return Some((next, payload));
            }
        }

        None
    }

    /// The id a keep-alive frame for this port should carry.
    pub fn keepalive_id(&self) -> u32 {
        self.shared.lock_rx().next_transmit_rxid
    }

    /// Mark `rxid` as received by the peer; it will not be retransmitted.
    pub fn confirm_reception(&self, rxid: u32) {
        let mut rx = self.shared.lock_rx();
        // A confirmation for an id never handed out makes no sense.
        if !seq::before(rxid, rx.next_free_rxid) {
            return;
        }
        if let Some(entry) = rx.entries.get_mut(&rxid) {
            entry.rx_confirmed = true;
            trace!(rxid, "reception confirmed");
        }
    }

    /// The peer wrote `rxid` out its serial port: drop every entry up to and
    /// including it. Cumulative, so lost intermediate TX_CONFIRMs are
    /// covered; idempotent and monotone for stale ids.
    pub fn confirm_transmission(&self, rxid: u32) {
        let mut rx = self.shared.lock_rx();
        if seq::before(rxid, rx.last_transmitted_rxid) {
            return;
        }
        // A confirmation for an id never transmitted is a protocol
        // violation; absorbing it keeps the erase bounded.
        if !seq::before(rxid, rx.next_transmit_rxid) {
            return;
        }

        let mut id = rx.last_transmitted_rxid;
        loop {
            rx.entries.remove(&id);
            if id == rxid {
                break;
            }
            id = id.wrapping_add(1);
        }
        rx.last_transmitted_rxid = rxid.wrapping_add(1);
        trace!(rxid, remaining = rx.entries.len(), "transmission confirmed");

        drop(rx);
        // Resume reception, in case it was holding at the stack limit.
        self.shared.rx_cond.notify_all();
    }

    /// Close the serial port and release both workers. Idempotent; the
    /// workers are joined on drop.
    pub fn close(&self) {
        self.shared.port.close();
        drop(self.shared.lock_tx());
        self.shared.tx_cond.notify_all();
        drop(self.shared.lock_rx());
        self.shared.rx_cond.notify_all();
    }
}

impl Drop for PortHandler {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Shared {
    /// Serial writer: consumes the TX stack strictly in txid order.
    fn run_serial_writer(&self) {
        while self.port.is_open() {
            let (txid, data) = {
                let mut tx = self.lock_tx();
                while !tx.entries.contains_key(&tx.next_txid) {
                    if !self.port.is_open() {
                        return;
                    }
                    tx = self.tx_cond.wait(tx).unwrap_or_else(PoisonError::into_inner);
                }
                let txid = tx.next_txid;
                match tx.entries.get(&txid) {
                    Some(entry) => (txid, entry.data.clone()),
                    None => continue,
                }
            };

            // Drain outside the lock; the driver's write timeout bounds each
            // attempt.
            let mut written = 0;
            while written < data.len() && self.port.is_open() {
                match self.port.write_bytes(&data[written..]) {
                    Ok(n) => written += n,
                    Err(err) => {
                        warn!(txid, %err, "serial write failed, closing port");
                        self.port.close();
                        break;
                    }
                }
            }
            if written < data.len() {
                continue; // port closed mid-drain; loop condition exits
            }

            (self.tx_confirm)(txid);

            let mut tx = self.lock_tx();
            tx.entries.remove(&txid);
            tx.next_txid = txid.wrapping_add(1);
        }
    }

    /// Serial reader: accumulates device bytes into reception-stack entries.
    fn run_serial_reader(&self) {
        let entry_len = self.config.serial_rx_entry_len;
        let stack_limit = self.config.serial_rx_stack_limit;
        let consec = self.config.serial_rx_timeout_consec;

        let mut scratch = vec![0u8; entry_len];
        // Bytes read from the device that have not found a stack slot yet.
        let mut pending = 0usize;

        while self.port.is_open() {
            let read_budget;
            {
                let mut rx = self.lock_rx();

                if !rx.entries.contains_key(&rx.next_free_rxid) {
                    let id = rx.next_free_rxid;
                    rx.entries.insert(id, RxEntry::new(entry_len));
                } else {
                    let len = rx.entries[&rx.next_free_rxid].data.len();
                    if len >= entry_len || pending > entry_len - len {
                        // Current entry can't take more; hold reception while
                        // the stack is at its limit, then roll a new entry.
                        if rx.entries.len() >= stack_limit {
                            debug!(
                                entries = rx.entries.len(),
                                "reception stack at limit, holding"
                            );
                            drop(self.rx_cond.wait(rx).unwrap_or_else(PoisonError::into_inner));
                            // Ids may have moved while waiting; re-derive the
                            // slot to fill from scratch.
                            continue;
                        }
                        let id = rx.next_free_rxid.wrapping_add(1);
                        rx.next_free_rxid = id;
                        rx.entries.insert(id, RxEntry::new(entry_len));
                    }
                }

                let id = rx.next_free_rxid;
                if let Some(entry) = rx.entries.get_mut(&id) {
                    if pending > 0 {
                        if entry.data.len() + pending > entry_len {
                            continue; // redo loop to roll a fresh entry
                        }
                        entry.data.extend_from_slice(&scratch[..pending]);
                        pending = 0;
                    }
                    if entry.data.len() >= entry_len {
                        continue; // full; a new entry is rolled next round
                    }
                    read_budget = entry_len - entry.data.len();
                } else {
                    continue;
                }
            } // release the stack so reception can't block confirmations

            let received = match self
                .port
                .read_bytes_consecutive(&mut scratch[..read_budget], consec, consec)
            {
                Ok(n) => n,
                Err(_) => continue, // port closed; loop condition exits
            };
            if received == 0 {
                continue;
            }

            {
                let mut rx = self.lock_rx();
                let id = rx.next_free_rxid;
                match rx.entries.get_mut(&id) {
                    Some(entry) if entry.data.len() + received <= entry_len => {
                        entry.data.extend_from_slice(&scratch[..received]);
                        trace!(rxid = id, len = entry.data.len(), "serial bytes buffered");
                    }
                    // The slot was sealed or erased while we waited for the
                    // device; park the bytes for the next entry.
                    _ => pending = received,
                }
            }

            (self.new_data)();
        }

        self.lock_rx().entries.clear();
    }
}
