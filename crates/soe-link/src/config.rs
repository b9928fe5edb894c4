use std::time::Duration;

use soe_serial::SerialConfig;

/// Tunable parameters of the SOE engine.
///
/// The defaults mirror the protocol's reference values; both peers may use
/// different settings, the wire format does not depend on them.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Capacity of one reception-stack entry (one STREAM payload).
    pub serial_rx_entry_len: usize,
    /// Entry limit for the reception stack; serial reception holds once the
    /// limit is reached.
    pub serial_rx_stack_limit: usize,
    /// Gap after which a consecutive serial read stops.
    pub serial_rx_timeout_consec: Duration,
    /// Upper bound on a single serial write attempt.
    pub serial_tx_timeout: Duration,
    /// Retransmission sweep interval for unconfirmed payloads, and the
    /// outbound scheduler's tick.
    pub inet_tx_rep_interval: Duration,
    /// Idle time per claim before an empty keep-alive STREAM is sent.
    pub inet_keep_alive_interval: Duration,
    /// Silence on the connection after which it is declared dead; also the
    /// claim-handshake deadline.
    pub inet_keep_alive_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            serial_rx_entry_len: 1024,
            serial_rx_stack_limit: 128,
            serial_rx_timeout_consec: Duration::from_millis(10),
            serial_tx_timeout: Duration::from_millis(1000),
            inet_tx_rep_interval: Duration::from_millis(100),
            inet_keep_alive_interval: Duration::from_millis(1000),
            inet_keep_alive_timeout: Duration::from_millis(10_000),
        }
    }
}

impl LinkConfig {
    /// Serial line parameters for a claim at the given baud rate.
    pub fn serial_config(&self, baud: u32) -> SerialConfig {
        SerialConfig {
            baud,
            read_timeout: self.serial_rx_timeout_consec,
            write_timeout: self.serial_tx_timeout,
        }
    }
}
