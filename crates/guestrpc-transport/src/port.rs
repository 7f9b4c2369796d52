//! x86_64 I/O-port backdoor.
//!
//! The hypervisor intercepts `in` on [`BACKDOOR_PORT`] and `rep outsb` /
//! `rep insb` on [`BACKDOOR_HB_PORT`] and rewrites the general-purpose
//! registers before the instruction retires. Outside VMware these
//! instructions fault, so a [`PortBackdoor`] can only be obtained through
//! [`PortBackdoor::detect`].

use std::arch::asm;
use std::sync::OnceLock;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::regs::{Register, Registers};
use crate::traits::{Backdoor, Transport};
use crate::{BACKDOOR_HB_PORT, BACKDOOR_MAGIC, BACKDOOR_PORT, COMMAND_GET_VERSION};

const VMWARE_VENDOR: &str = "VMwareVMware";
const CPUID_HYPERVISOR_BIT: u32 = 1 << 31;
const CPUID_HYPERVISOR_LEAF: u32 = 0x4000_0000;

/// Hypervisor identification as reported by CPUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorInfo {
    /// CPUID.1:ECX bit 31.
    pub present: bool,
    /// Vendor signature from leaf 0x4000_0000, empty if no hypervisor.
    pub vendor: String,
}

impl HypervisorInfo {
    pub fn is_vmware(&self) -> bool {
        self.present && self.vendor == VMWARE_VENDOR
    }
}

/// Identify the hypervisor, if any, via CPUID.
pub fn detect_hypervisor() -> HypervisorInfo {
    #[allow(unused_unsafe)]
    // SAFETY: CPUID is available on every x86_64 CPU and has no side effects.
    let features = unsafe { std::arch::x86_64::__cpuid(1) };
    if features.ecx & CPUID_HYPERVISOR_BIT == 0 {
        return HypervisorInfo {
            present: false,
            vendor: String::new(),
        };
    }

    #[allow(unused_unsafe)]
    // SAFETY: leaf 0x4000_0000 is reserved for hypervisor use and reads as
    // zeros or the vendor signature.
    let leaf = unsafe { std::arch::x86_64::__cpuid(CPUID_HYPERVISOR_LEAF) };
    let mut sig = [0u8; 12];
    sig[0..4].copy_from_slice(&leaf.ebx.to_le_bytes());
    sig[4..8].copy_from_slice(&leaf.ecx.to_le_bytes());
    sig[8..12].copy_from_slice(&leaf.edx.to_le_bytes());
    let vendor = String::from_utf8_lossy(&sig)
        .trim_end_matches('\0')
        .to_string();

    HypervisorInfo {
        present: true,
        vendor,
    }
}

/// The real backdoor, reached through I/O ports.
#[derive(Debug)]
pub struct PortBackdoor {
    version: u32,
}

static SYSTEM: OnceLock<Transport<PortBackdoor>> = OnceLock::new();

impl PortBackdoor {
    /// Confirm a VMware hypervisor and probe the backdoor version.
    pub fn detect() -> Result<Self> {
        let info = detect_hypervisor();
        if !info.is_vmware() {
            return Err(TransportError::NotVmware {
                vendor: if info.vendor.is_empty() {
                    "none".to_string()
                } else {
                    info.vendor
                },
            });
        }

        let mut backdoor = Self { version: 0 };
        let out = backdoor.exchange(Registers {
            bx: Register::from_word(u32::MAX),
            cx: Register::from_word(COMMAND_GET_VERSION as u32),
            ..Registers::default()
        });
        if out.bx.word() != BACKDOOR_MAGIC {
            return Err(TransportError::ProbeFailed { bx: out.bx.word() });
        }

        backdoor.version = out.ax.word();
        debug!(version = backdoor.version, "backdoor detected");
        Ok(backdoor)
    }

    /// Backdoor version reported by the probe.
    pub fn version(&self) -> u32 {
        self.version
    }
}

impl Transport<PortBackdoor> {
    /// The process-wide transport, detected on first use.
    ///
    /// Every caller receives a handle to the same backdoor, so exchanges from
    /// all channels in the process are serialized.
    pub fn system() -> Result<Self> {
        if let Some(transport) = SYSTEM.get() {
            return Ok(transport.clone());
        }
        let backdoor = PortBackdoor::detect()?;
        Ok(SYSTEM.get_or_init(|| Transport::new(backdoor)).clone())
    }
}

impl Backdoor for PortBackdoor {
    fn exchange(&mut self, regs: Registers) -> Registers {
        let mut ax = BACKDOOR_MAGIC as u64;
        let mut bx = regs.bx.quad();
        let mut cx = regs.cx.quad();
        let mut dx = regs.dx.with_low(BACKDOOR_PORT).quad();
        let mut si = regs.si.quad();
        let mut di = regs.di.quad();

        // SAFETY: `detect` confirmed the hypervisor intercepts this port. The
        // call only rewrites the listed registers; rbx is reserved by the
        // compiler and is swapped in and out around the instruction.
        unsafe {
            asm!(
                "xchg rbx, {bx}",
                "in eax, dx",
                "xchg rbx, {bx}",
                bx = inout(reg) bx,
                inout("rax") ax,
                inout("rcx") cx,
                inout("rdx") dx,
                inout("rsi") si,
                inout("rdi") di,
                options(nostack),
            );
        }

        Registers {
            ax: ax.into(),
            bx: bx.into(),
            cx: cx.into(),
            dx: dx.into(),
            si: si.into(),
            di: di.into(),
            bp: regs.bp,
        }
    }

    fn bulk_send(&mut self, regs: Registers, payload: &[u8]) -> Registers {
        let mut ax = BACKDOOR_MAGIC as u64;
        let mut bx = regs.bx.quad();
        let mut cx = payload.len() as u64;
        let mut dx = regs.dx.with_low(BACKDOOR_HB_PORT).quad();
        let mut si = payload.as_ptr() as u64;
        let mut di = regs.di.quad();
        let mut bp = regs.bp.quad();

        // SAFETY: the hypervisor reads exactly `cx` bytes starting at `si`,
        // which is the borrowed payload. rbx and rbp cannot be named as
        // operands, so they are loaded and restored by hand.
        unsafe {
            asm!(
                "push rbp",
                "mov rbp, {bp}",
                "xchg rbx, {bx}",
                "rep outsb",
                "xchg rbx, {bx}",
                "mov {bp}, rbp",
                "pop rbp",
                bx = inout(reg) bx,
                bp = inout(reg) bp,
                inout("rax") ax,
                inout("rcx") cx,
                inout("rdx") dx,
                inout("rsi") si,
                inout("rdi") di,
            );
        }

        Registers {
            ax: ax.into(),
            bx: bx.into(),
            cx: cx.into(),
            dx: dx.into(),
            si: si.into(),
            di: di.into(),
            bp: bp.into(),
        }
    }

    fn bulk_receive(&mut self, regs: Registers, buf: &mut [u8]) -> Registers {
        let mut ax = BACKDOOR_MAGIC as u64;
        let mut bx = regs.bx.quad();
        let mut cx = buf.len() as u64;
        let mut dx = regs.dx.with_low(BACKDOOR_HB_PORT).quad();
        let mut si = regs.si.quad();
        let mut di = buf.as_mut_ptr() as u64;
        let mut bp = regs.bp.quad();

        // SAFETY: the hypervisor writes at most `cx` bytes starting at `di`,
        // which is the exclusively borrowed buffer.
        unsafe {
            asm!(
                "push rbp",
                "mov rbp, {bp}",
                "xchg rbx, {bx}",
                "rep insb",
                "xchg rbx, {bx}",
                "mov {bp}, rbp",
                "pop rbp",
                bx = inout(reg) bx,
                bp = inout(reg) bp,
                inout("rax") ax,
                inout("rcx") cx,
                inout("rdx") dx,
                inout("rsi") si,
                inout("rdi") di,
            );
        }

        Registers {
            ax: ax.into(),
            bx: bx.into(),
            cx: cx.into(),
            dx: dx.into(),
            si: si.into(),
            di: di.into(),
            bp: bp.into(),
        }
    }
}
