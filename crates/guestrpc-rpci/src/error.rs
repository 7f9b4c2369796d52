use guestrpc_message::MessageError;

/// Errors from RPCI calls.
#[derive(Debug, thiserror::Error)]
pub enum RpciError {
    /// Channel-level error.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// The host accepted the command but had no reply pending.
    #[error("no reply to RPCI command")]
    NoReply,

    /// The reply did not start with a status prefix.
    #[error("invalid format of RPCI reply: {0:?}")]
    Malformed(String),

    /// The host answered a set with a failure status.
    #[error("RPCI command failed: {0}")]
    Failed(String),

    /// The key cannot be expressed in a guestinfo command.
    #[error("invalid guestinfo key: {0:?}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, RpciError>;
