//! # Generic Mapping Flags
//!
//! The public mapping surface speaks an architecture-neutral flag set;
//! translation to x86_64 PTE bits happens in one place so the rules stay
//! auditable:
//!
//! - `READ` is implied by presence.
//! - `EXEC` absent ⇒ the NX bit is set.
//! - `NO_CACHE` ⇒ PCD + PWT (strong uncacheable).
//! - `WRITE_COMBINE` would need the PAT, which this kernel does not
//!   program, and is rejected as [`VmmError::Unsupported`].

use crate::error::VmmError;
use crate::pte::PageTableEntry;

bitflags::bitflags! {
    /// Architecture-neutral page permissions and attributes.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct MemFlags: u32 {
        /// Page is readable (implied by any present mapping).
        const READ = 1 << 0;
        /// Page is writable.
        const WRITE = 1 << 1;
        /// Page is executable.
        const EXEC = 1 << 2;
        /// Page is accessible from user mode.
        const USER = 1 << 3;
        /// Mapping survives address-space switches (TLB-global).
        const GLOBAL = 1 << 4;
        /// Strong uncacheable access (MMIO).
        const NO_CACHE = 1 << 5;
        /// Write-combining access. Unsupported without PAT setup.
        const WRITE_COMBINE = 1 << 6;
    }
}

/// Translate generic flags into an x86_64 leaf entry template (present bit
/// set, frame bits zero).
///
/// # Errors
/// [`VmmError::Unsupported`] for [`MemFlags::WRITE_COMBINE`].
pub fn translate_flags(flags: MemFlags) -> Result<PageTableEntry, VmmError> {
    if flags.contains(MemFlags::WRITE_COMBINE) {
        return Err(VmmError::Unsupported);
    }

    let entry = PageTableEntry::zero()
        .with_present(true)
        .with_writable(flags.contains(MemFlags::WRITE))
        .with_user(flags.contains(MemFlags::USER))
        .with_global(flags.contains(MemFlags::GLOBAL))
        .with_cache_disable(flags.contains(MemFlags::NO_CACHE))
        .with_write_through(flags.contains(MemFlags::NO_CACHE))
        .with_no_execute(!flags.contains(MemFlags::EXEC));

    Ok(entry)
}
