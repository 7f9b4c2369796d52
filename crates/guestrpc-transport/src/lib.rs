//! Register-level transport to the hypervisor backdoor.
//!
//! Two primitives are exposed through the [`Backdoor`] trait:
//! - a low-bandwidth exchange of a fixed register block
//! - a high-bandwidth bulk copy between guest memory and the host
//!
//! This is the lowest layer of guestrpc. The only non-portable code in the
//! workspace lives here, in [`PortBackdoor`].

pub mod error;
pub mod regs;
pub mod traits;

#[cfg(target_arch = "x86_64")]
pub mod port;

pub use error::{Result, TransportError};
pub use regs::{Register, Registers};
pub use traits::{Backdoor, Transport, TransportGuard};

#[cfg(target_arch = "x86_64")]
pub use port::{detect_hypervisor, HypervisorInfo, PortBackdoor};

/// Magic value carried in `ax` on every backdoor call.
pub const BACKDOOR_MAGIC: u32 = 0x564D_5868;

/// I/O port for low-bandwidth exchanges.
pub const BACKDOOR_PORT: u16 = 0x5658;

/// I/O port for high-bandwidth copies.
pub const BACKDOOR_HB_PORT: u16 = 0x5659;

/// Backdoor command: query the backdoor version.
pub const COMMAND_GET_VERSION: u16 = 10;
