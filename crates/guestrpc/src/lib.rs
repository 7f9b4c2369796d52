//! Guest-side messaging with a VMware hypervisor.
//!
//! guestrpc lets code running inside a VMware virtual machine exchange
//! messages with the host over the hypervisor backdoor, and builds the RPCI
//! command protocol and `guestinfo.*` access on top.
//!
//! # Crate Structure
//!
//! - [`transport`]: register-level backdoor access and the shared transport
//! - [`message`]: checkpoint-tolerant message channels
//! - [`rpci`]: RPCI commands and guestinfo (behind `rpci` feature)

/// Re-export transport types.
pub mod transport {
    pub use guestrpc_transport::*;
}

/// Re-export message channel types.
pub mod message {
    pub use guestrpc_message::*;
}

/// Re-export RPCI types (requires `rpci` feature).
#[cfg(feature = "rpci")]
pub mod rpci {
    pub use guestrpc_rpci::*;
}

/// Guestinfo access through the process-wide backdoor transport.
///
/// Fails when not running under VMware.
#[cfg(all(feature = "rpci", target_arch = "x86_64"))]
pub fn guestinfo(
) -> Result<rpci::GuestInfo<transport::PortBackdoor>, transport::TransportError> {
    Ok(rpci::GuestInfo::new(transport::Transport::system()?))
}
