//! Message channels over the hypervisor backdoor.
//!
//! This is the core layer of guestrpc. A [`Channel`] turns the register
//! exchanges of the transport into whole messages:
//! - Open negotiates an id and a session cookie
//! - Send announces a size, then moves the payload in one bulk copy or in
//!   4-byte words, whichever the counterpart advertises for that call
//! - Receive polls, pulls the payload the same two ways, and acknowledges
//!
//! The host can checkpoint and restore the VM between any two exchanges.
//! When a reply carries the checkpoint status, the whole operation starts
//! again from its first exchange.

pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use channel::Channel;
pub use config::{ChannelConfig, RetryPolicy};
pub use error::{MessageError, Operation, Result};
pub use protocol::{
    Cookie, MessageStatus, MessageType, OpenFlags, COMMAND_MESSAGE, HB_COMMAND_MESSAGE,
    MAX_CHANNELS, MAX_INBOUND_MESSAGE,
};
