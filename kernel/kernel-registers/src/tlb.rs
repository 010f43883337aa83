//! # TLB maintenance
//!
//! Local-CPU invalidation only; this kernel performs no cross-CPU
//! shootdowns.

#[cfg(feature = "asm")]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe, cr3::Cr3};
#[cfg(feature = "asm")]
use kernel_addr::VirtAddr;

/// Invalidate the TLB entry covering `va` on the calling CPU (`invlpg`).
///
/// # Safety
/// Must run at CPL0. Only meaningful for the currently active address
/// space; other CPUs are unaffected.
#[cfg(feature = "asm")]
#[inline]
pub unsafe fn invalidate_page(va: VirtAddr) {
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) va.as_u64(),
            options(nostack, preserves_flags)
        );
    }
}

/// Flush all non-global TLB entries of the current address space by
/// reloading CR3 with its present value.
///
/// # Safety
/// Must run at CPL0. Global (PGE) entries survive; affects the calling CPU
/// only.
#[cfg(feature = "asm")]
#[inline]
pub unsafe fn flush_all() {
    unsafe {
        Cr3::load_unsafe().store_unsafe();
    }
}
