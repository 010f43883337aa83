#[cfg(feature = "asm")]
use crate::LoadRegisterUnsafe;
use kernel_addr::VirtAddr;

/// CR2 — Page-Fault Linear Address.
///
/// The CPU latches the faulting linear address here on every #PF; the
/// exception path reads it to report which access failed. Read-only from
/// the kernel's perspective.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Cr2(VirtAddr);

impl Cr2 {
    /// The faulting linear address.
    #[inline]
    #[must_use]
    pub const fn fault_address(self) -> VirtAddr {
        self.0
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr2 {
    unsafe fn load_unsafe() -> Self {
        let cr2: u64;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        Self(VirtAddr::new(cr2))
    }
}
