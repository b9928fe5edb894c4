use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use soe_frame::{FrameError, FrameReader, FrameWriter, Message};
use soe_serial::{PortOpener, SerialPort};
use soe_transport::TcpLink;

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::port::{NewDataFn, PortHandler, TxConfirmFn};

/// One established port link, as reported by [`SocketHandler::list_ports`].
#[derive(Debug, Clone, Serialize)]
pub struct PortLink {
    /// Device name on this peer.
    pub local: String,
    /// Name the link carries on the wire (the responder-side port name).
    pub remote: String,
}

struct PortClaim {
    handler: Arc<PortHandler>,
    wire_name: String,
}

#[derive(Default)]
struct ClaimTable {
    by_local: HashMap<String, PortClaim>,
    /// wire name -> local name. Frames carry the wire name; inbound routing
    /// translates through this index.
    by_wire: HashMap<String, String>,
}

/// Rendezvous for the one OPEN or CLOSE sequence in flight. The outcome is
/// written before the condition variable is notified.
#[derive(Default)]
struct Rendezvous {
    wire_name: Option<String>,
    outcome: Option<bool>,
}

struct SocketShared {
    peer: String,
    link: TcpLink,
    open: AtomicBool,
    writer: Mutex<FrameWriter<TcpLink>>,
    config: LinkConfig,
    opener: PortOpener,
    claims: RwLock<ClaimTable>,
    tx_signal: Mutex<bool>,
    tx_cond: Condvar,
    rendezvous: Mutex<Rendezvous>,
    rendezvous_cond: Condvar,
    /// Serialises claim sequences: one OPEN/CLOSE in flight at a time.
    sequence: Mutex<()>,
    last_recv: Mutex<Instant>,
}

/// Handles one peer-to-peer connection: parses inbound frames, dispatches by
/// opcode, schedules outbound STREAM traffic across all claimed ports, and
/// hosts the claim-handshake rendezvous.
///
/// Dropping the handler closes the connection, force-releases every claim
/// and joins both worker threads.
pub struct SocketHandler {
    shared: Arc<SocketShared>,
    receiver: Option<JoinHandle<()>>,
    scheduler: Option<JoinHandle<()>>,
}

impl SocketHandler {
    /// Take ownership of a connected link and start the worker threads.
    pub fn spawn(link: TcpLink, config: LinkConfig, opener: PortOpener) -> Result<Self> {
        let peer = link
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let reader_link = link.try_clone()?;
        let writer_link = link.try_clone()?;

        let shared = Arc::new(SocketShared {
            peer,
            link,
            open: AtomicBool::new(true),
            writer: Mutex::new(FrameWriter::new(writer_link)),
            config,
            opener,
            claims: RwLock::new(ClaimTable::default()),
            tx_signal: Mutex::new(false),
            tx_cond: Condvar::new(),
            rendezvous: Mutex::new(Rendezvous::default()),
            rendezvous_cond: Condvar::new(),
            sequence: Mutex::new(()),
            last_recv: Mutex::new(Instant::now()),
        });

        let receiver = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || shared.run_receiver(FrameReader::new(reader_link)))
        };
        let scheduler = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || shared.run_scheduler())
        };

        Ok(Self {
            shared,
            receiver: Some(receiver),
            scheduler: Some(scheduler),
        })
    }

    /// True as long as the network connection is operational.
    pub fn is_active(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// The remote peer's address, for display.
    pub fn peer_addr(&self) -> &str {
        &self.shared.peer
    }

    /// Claim `remote_name` on the peer and `local_name` here, connecting the
    /// two over the link.
    ///
    /// The local port is acquired first; the OPEN request is answered by the
    /// peer with OPENED (or ERROR), and a missing answer times out after the
    /// keep-alive timeout, releasing everything acquired so far.
    pub fn open_remote_port(&self, remote_name: &str, baud: u32, local_name: &str) -> Result<()> {
        let shared = &self.shared;
        if !shared.open.load(Ordering::Acquire) {
            return Err(LinkError::ConnectionClosed);
        }
        let _sequence = shared.lock_sequence();

        {
            let table = shared.read_claims();
            if table.by_local.contains_key(local_name) {
                return Err(LinkError::ClaimFailed(format!(
                    "local port {local_name} is already linked"
                )));
            }
            if table.by_wire.contains_key(remote_name) {
                return Err(LinkError::ClaimFailed(format!(
                    "remote port {remote_name} is already linked"
                )));
            }
        }

        // Claim the local port first; nothing to undo remotely if it fails.
        let serial_config = shared.config.serial_config(baud);
        let port = (shared.opener)(local_name, &serial_config)?;

        shared.arm_rendezvous(remote_name);
        if let Err(err) = shared.send_message(&Message::Open {
            baud,
            port: remote_name.to_string(),
        }) {
            shared.disarm_rendezvous();
            port.close();
            return Err(err.into());
        }

        match shared.await_rendezvous() {
            Some(true) => {
                let handler = Arc::new(shared.spawn_port_handler(port, remote_name.to_string()));
                let mut table = shared.write_claims();
                table.by_local.insert(
                    local_name.to_string(),
                    PortClaim {
                        handler,
                        wire_name: remote_name.to_string(),
                    },
                );
                table
                    .by_wire
                    .insert(remote_name.to_string(), local_name.to_string());
                info!(
                    local = local_name,
                    remote = remote_name,
                    baud,
                    "port link established"
                );
                Ok(())
            }
            Some(false) => {
                port.close();
                Err(LinkError::ClaimFailed(format!(
                    "peer refused to open {remote_name}"
                )))
            }
            None => {
                port.close();
                // The port may or may not be open on the peer; a courtesy
                // CLOSE resolves the undefined state if it arrives.
                let _ = shared.send_message(&Message::Close {
                    port: remote_name.to_string(),
                });
                Err(LinkError::Timeout(shared.config.inet_keep_alive_timeout))
            }
        }
    }

    /// Release the link registered under the given local port name, asking
    /// the peer to release its side too.
    ///
    /// The local side is released regardless of what the peer answers; an
    /// unanswered CLOSE reports a timeout to the caller.
    pub fn close_remote_port(&self, local_name: &str) -> Result<()> {
        let shared = &self.shared;
        let _sequence = shared.lock_sequence();

        let wire_name = {
            let table = shared.read_claims();
            match table.by_local.get(local_name) {
                Some(claim) => claim.wire_name.clone(),
                None => {
                    return Err(LinkError::ClaimFailed(format!(
                        "local port {local_name} is not linked"
                    )))
                }
            }
        };

        shared.arm_rendezvous(&wire_name);
        let outcome = match shared.send_message(&Message::Close {
            port: wire_name.clone(),
        }) {
            Ok(()) => shared.await_rendezvous(),
            Err(_) => {
                shared.disarm_rendezvous();
                None
            }
        };

        let claim = shared.remove_claim_by_local(local_name);
        drop(claim);

        match outcome {
            Some(confirmed) => {
                if !confirmed {
                    // The peer reported an error (e.g. already closed); the
                    // link is gone either way.
                    warn!(remote = %wire_name, "peer reported an error on close");
                }
                info!(local = local_name, remote = %wire_name, "port link released");
                Ok(())
            }
            None => Err(LinkError::Timeout(shared.config.inet_keep_alive_timeout)),
        }
    }

    /// Release a link from this side only and notify the peer with an
    /// unsolicited CLOSED.
    pub fn close_local_port(&self, local_name: &str) -> Result<()> {
        let shared = &self.shared;
        let claim = shared.remove_claim_by_local(local_name).ok_or_else(|| {
            LinkError::ClaimFailed(format!("local port {local_name} is not linked"))
        })?;
        let wire_name = claim.wire_name.clone();
        drop(claim);
        info!(local = local_name, remote = %wire_name, "port link closed locally");
        let _ = shared.send_message(&Message::Closed { port: wire_name });
        Ok(())
    }

    /// Release every link on this connection. Returns the first error
    /// encountered, after attempting all of them.
    pub fn close_all_ports(&self) -> Result<()> {
        let locals: Vec<String> = self.shared.read_claims().by_local.keys().cloned().collect();
        let mut first_err = None;
        for local in locals {
            if let Err(err) = self.close_remote_port(&local) {
                warn!(port = %local, %err, "failed to release port link");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// All currently established links on this connection.
    pub fn list_ports(&self) -> Vec<PortLink> {
        let table = self.shared.read_claims();
        let mut links: Vec<PortLink> = table
            .by_local
            .iter()
            .map(|(local, claim)| PortLink {
                local: local.clone(),
                remote: claim.wire_name.clone(),
            })
            .collect();
        links.sort_by(|a, b| a.local.cmp(&b.local));
        links
    }

    /// Close the connection and force-release all claims. Idempotent; the
    /// worker threads are joined on drop.
    pub fn shutdown(&self) {
        self.shared.shutdown_inner();
    }
}

impl Drop for SocketHandler {
    fn drop(&mut self) {
        self.shared.shutdown_inner();
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }
    }
}

impl SocketShared {
    fn lock_sequence(&self) -> MutexGuard<'_, ()> {
        self.sequence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_claims(&self) -> std::sync::RwLockReadGuard<'_, ClaimTable> {
        self.claims.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_claims(&self) -> std::sync::RwLockWriteGuard<'_, ClaimTable> {
        self.claims.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a claim, returning it so the handler is dropped (and its
    /// workers joined) after the table lock is released.
    fn remove_claim_by_local(&self, local: &str) -> Option<PortClaim> {
        let mut table = self.write_claims();
        let claim = table.by_local.remove(local)?;
        table.by_wire.remove(&claim.wire_name);
        Some(claim)
    }

    fn send_message(&self, message: &Message) -> soe_frame::Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(FrameError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.send_message(message)
    }

    /// Best-effort ERROR frame; a failed error report is only logged.
    fn send_error(&self, port: Option<&str>, message: &str) {
        let result = self.send_message(&Message::Error {
            port: port.map(str::to_string),
            message: Some(message.to_string()),
        });
        if let Err(err) = result {
            debug!(%err, "failed to send ERROR frame");
        }
    }

    fn notify_serial_data(&self) {
        let mut pending = self.tx_signal.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        drop(pending);
        self.tx_cond.notify_all();
    }

    fn arm_rendezvous(&self, wire_name: &str) {
        let mut rv = self.rendezvous.lock().unwrap_or_else(PoisonError::into_inner);
        rv.wire_name = Some(wire_name.to_string());
        rv.outcome = None;
    }

    fn disarm_rendezvous(&self) {
        let mut rv = self.rendezvous.lock().unwrap_or_else(PoisonError::into_inner);
        rv.wire_name = None;
        rv.outcome = None;
    }

    /// Block until the pending sequence completes, the connection dies or
    /// the keep-alive timeout expires. Disarms the rendezvous.
    fn await_rendezvous(&self) -> Option<bool> {
        let deadline = Instant::now() + self.config.inet_keep_alive_timeout;
        let mut rv = self.rendezvous.lock().unwrap_or_else(PoisonError::into_inner);
        while rv.outcome.is_none() && self.open.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .rendezvous_cond
                .wait_timeout(rv, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            rv = guard;
        }
        let outcome = rv.outcome.take();
        rv.wire_name = None;
        outcome
    }

    /// Wake the pending sequence if `wire_name` matches it. Returns whether
    /// it matched; a mismatch is a stale reply, not an error.
    fn complete_rendezvous(&self, wire_name: &str, positive: bool) -> bool {
        let mut rv = self.rendezvous.lock().unwrap_or_else(PoisonError::into_inner);
        if rv.wire_name.as_deref() == Some(wire_name) && rv.outcome.is_none() {
            rv.outcome = Some(positive);
            drop(rv);
            self.rendezvous_cond.notify_all();
            true
        } else {
            false
        }
    }

    fn shutdown_inner(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            info!(peer = %self.peer, "closing peer connection");
        }
        self.link.shutdown();
        self.notify_serial_data();
        // Abort a pending claim sequence.
        let mut rv = self.rendezvous.lock().unwrap_or_else(PoisonError::into_inner);
        if rv.wire_name.is_some() && rv.outcome.is_none() {
            rv.outcome = Some(false);
            drop(rv);
            self.rendezvous_cond.notify_all();
        }
    }

    fn spawn_port_handler(
        self: &Arc<Self>,
        port: Arc<dyn SerialPort>,
        wire_name: String,
    ) -> PortHandler {
        // The port handler calls back into this socket handler; a weak
        // reference keeps ownership strictly socket -> port.
        let weak = Arc::downgrade(self);
        let new_data: NewDataFn = {
            let weak = weak.clone();
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.notify_serial_data();
                }
            })
        };
        let tx_confirm: TxConfirmFn = Box::new(move |txid| {
            if let Some(shared) = weak.upgrade() {
                let _ = shared.send_message(&Message::TxConfirm {
                    port: wire_name.clone(),
                    id: txid,
                });
            }
        });
        PortHandler::spawn(port, self.config.clone(), new_data, tx_confirm)
    }

    fn lookup_by_wire(&self, wire_name: &str) -> Option<(String, Arc<PortHandler>)> {
        let table = self.read_claims();
        let local = table.by_wire.get(wire_name)?.clone();
        let handler = Arc::clone(&table.by_local.get(&local)?.handler);
        Some((local, handler))
    }

    /// Inbound loop: parse frames, dispatch by opcode. On exit the
    /// connection is draining: every claim is force-released before the
    /// thread ends.
    fn run_receiver(self: Arc<Self>, mut reader: FrameReader<TcpLink>) {
        while self.open.load(Ordering::Acquire) {
            let frame = match reader.read_frame() {
                Ok(frame) => frame,
                Err(FrameError::ConnectionClosed) => {
                    debug!(peer = %self.peer, "peer closed the connection");
                    break;
                }
                Err(err) => {
                    if self.open.load(Ordering::Acquire) {
                        error!(peer = %self.peer, %err, "frame error, closing connection");
                    }
                    break;
                }
            };

            *self.last_recv.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();

            let message = match Message::decode(frame) {
                Ok(message) => message,
                Err(err) if !err.is_fatal() => {
                    // The frame boundary was intact; report and move on.
                    warn!(peer = %self.peer, %err, "malformed control frame");
                    self.send_error(None, &err.to_string());
                    continue;
                }
                Err(err) => {
                    error!(peer = %self.peer, %err, "unrecoverable frame error");
                    break;
                }
            };

            self.dispatch(message);
        }

        self.shutdown_inner();
        self.drain_claims();
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::Open { baud, port } => self.handle_open(baud, port),
            Message::Opened { port } => {
                if !self.complete_rendezvous(&port, true) {
                    debug!(port = %port, "stale OPENED, ignoring");
                }
            }
            Message::Close { port } => self.handle_close(port),
            Message::Closed { port } => self.handle_closed(port),
            Message::Stream { port, id, data } => self.handle_stream(port, id, data),
            Message::RxConfirm { port, id } => match self.lookup_by_wire(&port) {
                Some((_, handler)) => handler.confirm_reception(id),
                None => self.send_error(Some(port.as_str()), "port not claimed"),
            },
            Message::TxConfirm { port, id } => match self.lookup_by_wire(&port) {
                Some((_, handler)) => handler.confirm_transmission(id),
                None => self.send_error(Some(port.as_str()), "port not claimed"),
            },
            Message::Error { port, message } => {
                // An ERROR naming the pending claim completes that sequence;
                // anything else is informational only.
                let completed = port
                    .as_deref()
                    .is_some_and(|name| self.complete_rendezvous(name, false));
                warn!(
                    peer = %self.peer,
                    port = port.as_deref().unwrap_or("<none>"),
                    completed_sequence = completed,
                    "peer reported error: {}",
                    message.as_deref().unwrap_or("<no message>")
                );
            }
        }
    }

    /// Responder side of the claim handshake.
    fn handle_open(self: &Arc<Self>, baud: u32, name: String) {
        {
            let table = self.read_claims();
            if table.by_local.contains_key(&name) || table.by_wire.contains_key(&name) {
                self.send_error(Some(name.as_str()), "port already claimed");
                return;
            }
        }

        let serial_config = self.config.serial_config(baud);
        let port = match (self.opener)(&name, &serial_config) {
            Ok(port) => port,
            Err(err) => {
                warn!(port = %name, %err, "failed to claim port for peer");
                self.send_error(Some(name.as_str()), &format!("failed to claim port: {err}"));
                return;
            }
        };

        let handler = Arc::new(self.spawn_port_handler(port, name.clone()));
        {
            let mut table = self.write_claims();
            table.by_local.insert(
                name.clone(),
                PortClaim {
                    handler,
                    wire_name: name.clone(),
                },
            );
            table.by_wire.insert(name.clone(), name.clone());
        }
        info!(port = %name, baud, "port claimed by peer");

        if self
            .send_message(&Message::Opened { port: name.clone() })
            .is_err()
        {
            // The peer will time out; avoid leaving the port stranded open.
            warn!(port = %name, "failed to confirm OPENED, releasing port");
            let claim = self.remove_claim_by_local(&name);
            drop(claim);
        }
    }

    fn handle_close(&self, name: String) {
        let local = self.read_claims().by_wire.get(&name).cloned();
        match local {
            Some(local) => {
                let claim = self.remove_claim_by_local(&local);
                drop(claim); // closes the serial port, joins its workers
                info!(port = %name, "port released on peer request");
                if self
                    .send_message(&Message::Closed { port: name.clone() })
                    .is_err()
                {
                    self.send_error(Some(name.as_str()), "failed to transmit CLOSE confirmation");
                }
            }
            None => self.send_error(Some(name.as_str()), "port not claimed"),
        }
    }

    fn handle_closed(&self, name: String) {
        if self.complete_rendezvous(&name, true) {
            return;
        }
        // Unsolicited: the peer closed its side of the link.
        let local = self.read_claims().by_wire.get(&name).cloned();
        match local {
            Some(local) => {
                info!(remote = %name, local = %local, "peer closed the port link");
                let claim = self.remove_claim_by_local(&local);
                drop(claim);
            }
            None => debug!(remote = %name, "CLOSED for unknown port, ignoring"),
        }
    }

    fn handle_stream(&self, name: String, id: u32, data: Bytes) {
        let Some((local, handler)) = self.lookup_by_wire(&name) else {
            self.send_error(Some(name.as_str()), "port not claimed");
            return;
        };

        if !handler.is_open() {
            self.send_error(Some(name.as_str()), "port is already closed");
            let claim = self.remove_claim_by_local(&local);
            drop(claim);
            let _ = self.send_message(&Message::Closed { port: name });
            return;
        }

        if !handler.send(id, &data) {
            // Stack refused (full, out of order). The network round-trip is
            // still acknowledged; the peer retransmits until a TX_CONFIRM
            // eventually covers the id.
            trace!(port = %name, txid = id, "payload not queued, acknowledging anyway");
        }
        let _ = self.send_message(&Message::RxConfirm { port: name, id });
    }

    /// Outbound loop: round-robin across claimed ports, retransmission tick,
    /// keep-alive emission, connection-death detection.
    fn run_scheduler(self: Arc<Self>) {
        let mut last_send: HashMap<String, Instant> = HashMap::new();

        while self.open.load(Ordering::Acquire) {
            let silence = self
                .last_recv
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .elapsed();
            if silence >= self.config.inet_keep_alive_timeout {
                warn!(peer = %self.peer, "nothing received within keep-alive timeout, presuming connection dead");
                break;
            }

            let snapshot: Vec<(String, String, Arc<PortHandler>)> = {
                let table = self.read_claims();
                table
                    .by_local
                    .iter()
                    .map(|(local, claim)| {
                        (
                            local.clone(),
                            claim.wire_name.clone(),
                            Arc::clone(&claim.handler),
                        )
                    })
                    .collect()
            };
            last_send.retain(|wire, _| snapshot.iter().any(|(_, w, _)| w == wire));

            let mut sent_any = false;
            for (local, wire, handler) in &snapshot {
                let idle_since = *last_send.entry(wire.clone()).or_insert_with(Instant::now);

                if let Some((rxid, payload)) = handler.read() {
                    let message = Message::Stream {
                        port: wire.clone(),
                        id: rxid,
                        data: payload,
                    };
                    match self.send_message(&message) {
                        Ok(()) => {
                            last_send.insert(wire.clone(), Instant::now());
                            sent_any = true;
                        }
                        Err(err) => {
                            warn!(port = %wire, %err, "failed to transmit STREAM frame, closing port");
                            self.send_error(Some(wire.as_str()), "failed to transmit STREAM frame, close port");
                            let claim = self.remove_claim_by_local(local);
                            drop(claim);
                            let _ = self.send_message(&Message::Closed { port: wire.clone() });
                        }
                    }
                } else if idle_since.elapsed() >= self.config.inet_keep_alive_interval {
                    let message = Message::Stream {
                        port: wire.clone(),
                        id: handler.keepalive_id(),
                        data: Bytes::new(),
                    };
                    if self.send_message(&message).is_ok() {
                        trace!(port = %wire, "keep-alive sent");
                        last_send.insert(wire.clone(), Instant::now());
                    }
                }
            }

            if sent_any {
                continue; // keep draining while data is flowing
            }

            let mut pending = self.tx_signal.lock().unwrap_or_else(PoisonError::into_inner);
            if !*pending {
                // Woken by port handlers on new data, or by the tick that
                // drives the retransmission sweep embedded in read().
                let (guard, _) = self
                    .tx_cond
                    .wait_timeout(pending, self.config.inet_tx_rep_interval)
                    .unwrap_or_else(PoisonError::into_inner);
                pending = guard;
            }
            *pending = false;
        }

        self.shutdown_inner();
    }

    /// Force-release all claims (Draining state).
    fn drain_claims(&self) {
        let claims = {
            let mut table = self.write_claims();
            table.by_wire.clear();
            std::mem::take(&mut table.by_local)
        };
        for (local, claim) in claims {
            info!(port = %local, "auto-closing claimed port");
            drop(claim);
        }
    }
}
