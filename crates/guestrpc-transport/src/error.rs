/// Errors that can occur while acquiring a backdoor transport.
///
/// Individual exchanges never fail at this layer; status is reported in the
/// returned registers and interpreted by the message layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The backdoor is not available on this architecture.
    #[error("backdoor transport not supported on {arch}")]
    Unsupported { arch: &'static str },

    /// The CPU does not report a VMware hypervisor.
    #[error("not running under VMware (hypervisor vendor: {vendor})")]
    NotVmware { vendor: String },

    /// The version probe did not echo the backdoor magic.
    #[error("backdoor probe failed (bx={bx:#x})")]
    ProbeFailed { bx: u32 },
}

pub type Result<T> = std::result::Result<T, TransportError>;
