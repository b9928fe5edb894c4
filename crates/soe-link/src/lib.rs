//! SOE protocol engine.
//!
//! A peer claims a remote host's serial port by name and baud rate; once the
//! claim succeeds, the link carries two independent, reliable, in-order byte
//! streams between the two serial endpoints. Per connection there is one
//! [`SocketHandler`] (frame dispatch, outbound scheduling, claim registry);
//! per claimed port one [`port::PortHandler`] (reception/transmission stacks
//! and the serial worker threads).
//!
//! Reliability model: the transport is assumed reliable and ordered. What is
//! retransmitted is payload that was acknowledged as *received*
//! (RX_CONFIRM) but whose downstream serial write has not yet been confirmed
//! (TX_CONFIRM), a hedge against loss windows on the confirmation path.

pub mod config;
pub mod error;
pub mod port;
pub mod seq;
pub mod socket;

pub use config::LinkConfig;
pub use error::{LinkError, Result};
pub use port::PortHandler;
pub use socket::{PortLink, SocketHandler};
