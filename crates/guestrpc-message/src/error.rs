use std::fmt;

use crate::protocol::{MessageStatus, MessageType};

/// The channel call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Open,
    Send,
    Receive,
    Close,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Close => "close",
        })
    }
}

/// Errors surfaced by channel operations.
///
/// Checkpoints never appear here unless a retry bound was configured.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The counterpart refused to open a channel (unknown protocol or no free
    /// slot).
    #[error("counterpart refused to open a channel for protocol {protocol:#x}")]
    OpenRefused { protocol: u32 },

    /// The counterpart denied a request on an open channel.
    #[error("{op} rejected on channel {channel} (status {status:?})")]
    Rejected {
        op: Operation,
        channel: u16,
        status: MessageStatus,
    },

    /// The counterpart answered with an unexpected message type.
    #[error("{op} protocol error on channel {channel}: expected {expected}, got type {actual}")]
    Protocol {
        op: Operation,
        channel: u16,
        expected: MessageType,
        actual: u16,
    },

    /// The receive buffer could not grow to hold an incoming message.
    #[error("not enough memory to receive {size} bytes on channel {channel}")]
    OutOfMemory { channel: u16, size: usize },

    /// Checkpoints kept interrupting the operation past the configured bound.
    #[error("{op} interrupted by checkpoints {attempts} times")]
    RetryLimit { op: Operation, attempts: u32 },
}

pub type Result<T> = std::result::Result<T, MessageError>;
