#[cfg(feature = "asm")]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// `IA32_EFER` / EFER (MSR `0xC000_0080`).
///
/// Extended Feature Enable Register used for `SYSCALL`/`SYSRET`, long mode
/// and the `NX` paging bit. The memory core only ever flips
/// [`nxe`](Efer::nxe), but the neighboring architectural bits are modeled so
/// read-modify-write cycles preserve them faithfully.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct Efer {
    /// Bit 0 — SCE: System Call Extensions (SYSCALL/SYSRET).
    pub sce: bool,

    /// Bits 1–7 — Reserved / legacy AMD K6 bits.
    #[bits(7)]
    pub reserved0: u8,

    /// Bit 8 — LME: Long Mode Enable.
    pub lme: bool,

    /// Bit 9 — Reserved.
    pub reserved1: bool,

    /// Bit 10 — LMA: Long Mode Active (read-only).
    pub lma: bool,

    /// Bit 11 — NXE: No-Execute Enable.
    ///
    /// Enables the NX bit in page tables. Firmware sometimes leaves this
    /// clear; paging init sets it when CPUID reports NX support.
    pub nxe: bool,

    /// Bit 12 — SVME: Secure Virtual Machine Enable (AMD SVM).
    pub svme: bool,

    /// Bit 13 — LMSLE: Long Mode Segment Limit Enable.
    pub lmsle: bool,

    /// Bit 14 — FFXSR: Fast FXSAVE/FXRSTOR.
    pub ffxsr: bool,

    /// Bit 15 — TCE: Translation Cache Extension.
    pub tce: bool,

    /// Bits 16–63 — Reserved / vendor extensions.
    #[bits(48)]
    pub reserved2: u64,
}

impl Efer {
    /// MSR index for `IA32_EFER` / `EFER`.
    pub const MSR_EFER: u32 = 0xC000_0080;
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Efer {
    unsafe fn load_unsafe() -> Self {
        let (lo, hi): (u32, u32);
        unsafe {
            core::arch::asm!(
                "rdmsr",
                in("ecx") Self::MSR_EFER,
                out("eax") lo,
                out("edx") hi,
                options(nomem, preserves_flags)
            );
        }
        Self::from_bits(u64::from(hi) << 32 | u64::from(lo))
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Efer {
    unsafe fn store_unsafe(self) {
        let efer = self.into_bits();
        let lo = efer as u32;
        let hi = (efer >> 32) as u32;
        unsafe {
            core::arch::asm!(
                "wrmsr",
                in("ecx") Self::MSR_EFER,
                in("eax") lo,
                in("edx") hi,
                options(nomem, preserves_flags)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nxe_bit_position() {
        let efer = Efer::new().with_nxe(true);
        assert_eq!(efer.into_bits(), 1 << 11);
        assert_eq!(Efer::from_bits(1 << 11).nxe(), true);
    }

    #[test]
    fn preserves_unrelated_bits() {
        let efer = Efer::from_bits(1 << 0 | 1 << 8 | 1 << 10);
        let efer = efer.with_nxe(true);
        assert!(efer.sce());
        assert!(efer.lme());
        assert!(efer.lma());
        assert!(efer.nxe());
    }
}
