use std::fmt;

/// One general-purpose register as seen by the backdoor protocol.
///
/// The protocol addresses registers at several widths:
/// ```text
/// ┌───────────────────────────────┬───────────────┬───────────────┐
/// │ upper 32 bits                 │ high (16)     │ low (16)      │
/// │                               ├───────────────┴───────────────┤
/// │                               │ word (32)                     │
/// ├───────────────────────────────┴───────────────────────────────┤
/// │ quad (64)                                                     │
/// └───────────────────────────────────────────────────────────────┘
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Register(u64);

impl Register {
    /// A register holding the full 64-bit value.
    pub const fn from_quad(value: u64) -> Self {
        Self(value)
    }

    /// A register holding a 32-bit value (upper bits zero).
    pub const fn from_word(value: u32) -> Self {
        Self(value as u64)
    }

    /// A register built from the two 16-bit halves of its low word.
    pub const fn from_halves(high: u16, low: u16) -> Self {
        Self(((high as u64) << 16) | low as u64)
    }

    pub const fn quad(self) -> u64 {
        self.0
    }

    pub const fn word(self) -> u32 {
        self.0 as u32
    }

    pub const fn low(self) -> u16 {
        self.0 as u16
    }

    pub const fn high(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Replace the low 16 bits, keeping everything else.
    pub const fn with_low(self, low: u16) -> Self {
        Self((self.0 & !0xffff) | low as u64)
    }

    /// Replace bits 16..32, keeping everything else.
    pub const fn with_high(self, high: u16) -> Self {
        Self((self.0 & !0xffff_0000) | ((high as u64) << 16))
    }
}

impl From<u64> for Register {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Register> for u64 {
    fn from(value: Register) -> Self {
        value.0
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The register block handed to the counterpart and returned mutated.
///
/// Low-bandwidth exchanges use `ax..di`; high-bandwidth copies additionally
/// use `bp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub ax: Register,
    pub bx: Register,
    pub cx: Register,
    pub dx: Register,
    pub si: Register,
    pub di: Register,
    pub bp: Register,
}
