//! Wire constants and register layouts of the message protocol.
//!
//! Low-bandwidth request:
//! ```text
//! ┌────┬──────────────────────┬──────────────────────────────┐
//! │ bx │ size / payload word / status / protocol|flags        │
//! │ cx │ high: message type   │ low: COMMAND_MESSAGE (0x1e)  │
//! │ dx │ high: channel id     │ low: port (transport)        │
//! │ si │ cookie high                                         │
//! │ di │ cookie low                                          │
//! └────┴─────────────────────────────────────────────────────┘
//! ```
//! The reply carries the status in the high half of `cx` and, where
//! relevant, a message type in the high half of `dx` and data in `bx`.
//!
//! High-bandwidth request: `bx` = (SUCCESS, HB_COMMAND_MESSAGE), channel id
//! in the high half of `dx`, cookie in `bp`/`di` (send) or `si`/`bp`
//! (receive). The reply status is the high half of `bx`.

use std::fmt;

use bitflags::bitflags;
use guestrpc_transport::{Register, Registers};

/// Backdoor command selecting the message protocol.
pub const COMMAND_MESSAGE: u16 = 0x1e;

/// High-bandwidth command selecting the message protocol.
pub const HB_COMMAND_MESSAGE: u16 = 0;

/// Channels the counterpart supports at once, system-wide.
pub const MAX_CHANNELS: usize = 8;

/// Largest message the counterpart accepts from the guest.
pub const MAX_INBOUND_MESSAGE: usize = 64 * 1024;

/// Basic request types. The numbering is part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Open = 0,
    SendSize = 1,
    SendPayload = 2,
    ReceiveSize = 3,
    ReceivePayload = 4,
    ReceiveStatus = 5,
    Close = 6,
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, u16> {
        Ok(match value {
            0 => Self::Open,
            1 => Self::SendSize,
            2 => Self::SendPayload,
            3 => Self::ReceiveSize,
            4 => Self::ReceivePayload,
            5 => Self::ReceiveStatus,
            6 => Self::Close,
            other => return Err(other),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "OPEN",
            Self::SendSize => "SENDSIZE",
            Self::SendPayload => "SENDPAYLOAD",
            Self::ReceiveSize => "RECVSIZE",
            Self::ReceivePayload => "RECVPAYLOAD",
            Self::ReceiveStatus => "RECVSTATUS",
            Self::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Reply status bits. Any combination may be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageStatus: u16 {
        /// The request succeeded.
        const SUCCESS = 0x0001;
        /// The counterpart has a message for this channel.
        const DO_RECEIVE = 0x0002;
        /// The channel has been closed.
        const CLOSED = 0x0004;
        /// The counterpart dropped the message before it was fetched.
        const UNSENT = 0x0008;
        /// A checkpoint occurred; restart the operation.
        const CHECKPOINT = 0x0010;
        /// An underlying device is powering off.
        const POWER_OFF = 0x0020;
        /// The counterpart timed out the channel.
        const TIMEOUT = 0x0040;
        /// High-bandwidth transfer is available for this payload.
        const HIGH_BANDWIDTH = 0x0080;
    }
}

impl MessageStatus {
    /// Status sent by the guest to report a failed step.
    pub const FAILURE: Self = Self::empty();

    pub fn is_success(self) -> bool {
        self.contains(Self::SUCCESS)
    }

    /// A checkpoint interrupted the request. Only meaningful without SUCCESS.
    pub fn is_checkpoint(self) -> bool {
        !self.is_success() && self.contains(Self::CHECKPOINT)
    }

    pub fn high_bandwidth(self) -> bool {
        self.contains(Self::HIGH_BANDWIDTH)
    }
}

bitflags! {
    /// Flags or-ed into the protocol tag of an Open request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Ask the counterpart to assign a session cookie.
        const COOKIE = 0x8000_0000;
    }
}

/// Session token assigned at Open and echoed on every later exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Cookie {
    pub high: u32,
    pub low: u32,
}

impl Cookie {
    pub const fn new(high: u32, low: u32) -> Self {
        Self { high, low }
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.high, self.low)
    }
}

/// Build a low-bandwidth request for an open channel.
pub fn basic_request(ty: MessageType, id: u16, cookie: Cookie, bx: u64) -> Registers {
    Registers {
        bx: Register::from_quad(bx),
        cx: Register::from_halves(ty as u16, COMMAND_MESSAGE),
        dx: Register::from_halves(id, 0),
        si: Register::from_word(cookie.high),
        di: Register::from_word(cookie.low),
        ..Registers::default()
    }
}

/// Build the Open request.
pub fn open_request(protocol: u32, flags: OpenFlags) -> Registers {
    Registers {
        bx: Register::from_word(protocol | flags.bits()),
        cx: Register::from_halves(MessageType::Open as u16, COMMAND_MESSAGE),
        ..Registers::default()
    }
}

fn bulk_command(id: u16) -> Registers {
    Registers {
        bx: Register::from_halves(MessageStatus::SUCCESS.bits(), HB_COMMAND_MESSAGE),
        dx: Register::from_halves(id, 0),
        ..Registers::default()
    }
}

/// Build a guest-to-counterpart bulk copy request. `cx`/`si` are filled by
/// the transport.
pub fn bulk_send_request(id: u16, cookie: Cookie) -> Registers {
    Registers {
        bp: Register::from_word(cookie.high),
        di: Register::from_word(cookie.low),
        ..bulk_command(id)
    }
}

/// Build a counterpart-to-guest bulk copy request. `cx`/`di` are filled by
/// the transport.
pub fn bulk_receive_request(id: u16, cookie: Cookie) -> Registers {
    Registers {
        si: Register::from_word(cookie.high),
        bp: Register::from_word(cookie.low),
        ..bulk_command(id)
    }
}

/// Status of a low-bandwidth reply.
pub fn reply_status(regs: &Registers) -> MessageStatus {
    MessageStatus::from_bits_retain(regs.cx.high())
}

/// Status of a high-bandwidth reply.
pub fn bulk_status(regs: &Registers) -> MessageStatus {
    MessageStatus::from_bits_retain(regs.bx.high())
}

/// Message type the counterpart attached to a reply, as a raw value.
pub fn reply_type(regs: &Registers) -> u16 {
    regs.dx.high()
}

/// Channel id assigned by a successful Open.
pub fn reply_id(regs: &Registers) -> u16 {
    regs.dx.high()
}

/// Cookie assigned by a successful Open.
pub fn reply_cookie(regs: &Registers) -> Cookie {
    Cookie::new(regs.si.word(), regs.di.word())
}

/// Size announced in a ReceiveSize reply.
pub fn reply_size(regs: &Registers) -> usize {
    regs.bx.word() as usize
}

/// Pack 1 to 4 payload bytes into a word, little-endian. Missing high bytes
/// are zero; nothing past `chunk` is read.
pub fn pack_word(chunk: &[u8]) -> u32 {
    debug_assert!((1..=4).contains(&chunk.len()));
    let mut word = [0u8; 4];
    word[..chunk.len()].copy_from_slice(chunk);
    u32::from_le_bytes(word)
}

/// Unpack the low `dst.len()` bytes of a word (at most 4) into `dst`.
pub fn unpack_word(word: u32, dst: &mut [u8]) {
    debug_assert!(dst.len() <= 4);
    dst.copy_from_slice(&word.to_le_bytes()[..dst.len()]);
}
