use std::num::NonZeroU32;

/// How many times one operation may be restarted after a checkpoint.
///
/// The default is unbounded, so a host that checkpoints without pause keeps
/// the caller looping. Tests and callers with their own deadline set a bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts per operation, including the first. `None` retries
    /// forever.
    pub max_attempts: Option<NonZeroU32>,
}

impl RetryPolicy {
    /// Retry without bound.
    pub const fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    /// Allow at most `attempts` attempts per operation.
    pub const fn bounded(attempts: NonZeroU32) -> Self {
        Self {
            max_attempts: Some(attempts),
        }
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max.get())
    }
}

/// Per-channel behavior knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Checkpoint retry bound.
    pub retry: RetryPolicy,
    /// Move payloads word by word even when bulk copy is advertised.
    pub low_bandwidth_only: bool,
    /// Ask for a session cookie on Open.
    pub request_cookie: bool,
    /// Largest message the receive buffer may grow to hold. An announcement
    /// above it fails like an allocation failure. `None` leaves the bound to
    /// the allocator.
    pub receive_limit: Option<usize>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::unbounded(),
            low_bandwidth_only: false,
            request_cookie: true,
            receive_limit: None,
        }
    }
}
