//! RPCI commands over guestrpc message channels.
//!
//! RPCI is the guest-to-host command protocol: the guest sends a text
//! command such as `info-get guestinfo.hostname` and the host answers with
//! `1 <body>` on success or `0 <reason>` on failure. [`GuestInfo`] wraps the
//! `guestinfo.*` key space on top of it.

pub mod client;
pub mod error;
pub mod guestinfo;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use client::{send_one, send_one_with_config, RpciClient, RpciReply};
pub use error::{Result, RpciError};
pub use guestinfo::GuestInfo;

/// Protocol tag of guest-initiated command channels ("RPCI").
pub const RPCI_PROTOCOL: u32 = 0x4943_5052;

/// Protocol tag of host-initiated command channels ("TCLO").
pub const TCLO_PROTOCOL: u32 = 0x4f4c_4354;
