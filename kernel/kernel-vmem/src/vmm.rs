//! # Virtual Memory Manager (global singleton)
//!
//! The process-wide layer over [`AddressSpace`]: it owns the kernel space
//! (adopted from the boot CR3), hands out opaque [`Space`] handles, tracks
//! which space is active, and applies the TLB discipline: one `invlpg` per
//! modified leaf when the affected space is live on this CPU, a full
//! non-global flush on CR3 switch. Single-CPU scope; there are no
//! cross-CPU shootdowns.
//!
//! Frames for page tables come from hooks installed at
//! [`init`] so this crate stays below the physical allocator in the
//! dependency order.

use kernel_addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe, cpuid, cr3::Cr3, efer::Efer, tlb};
use kernel_sync::SpinLock;
use log::{debug, info, warn};

use crate::address_space::AddressSpace;
use crate::error::VmmError;
use crate::flags::MemFlags;
use crate::mapper::{FrameAlloc, HhdmMapper};

/// Page-table frame supplier, wired to the physical allocator at [`init`].
#[derive(Debug, Copy, Clone)]
pub struct FrameHooks {
    /// Allocate one 4 KiB frame (contents undefined).
    pub alloc: fn() -> Option<PhysAddr>,
    /// Return a frame.
    pub free: fn(PhysAddr),
}

/// [`FrameAlloc`] adapter over [`FrameHooks`].
struct HookedFrames(FrameHooks);

impl FrameAlloc for HookedFrames {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        (self.0.alloc)()
    }

    fn free_frame(&mut self, frame: PhysAddr) {
        (self.0.free)(frame);
    }
}

/// Opaque handle to an address space. Cheap to copy; the page-table tree
/// it names is owned by the VMM.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Space(PhysAddr);

/// Aggregate counters for diagnostics.
#[derive(Debug, Copy, Clone, Default)]
pub struct VmmStats {
    pub spaces_created: u64,
    pub spaces_destroyed: u64,
    pub pages_mapped: u64,
    pub pages_unmapped: u64,
    pub tlb_flushes: u64,
}

struct VmmState {
    hhdm: HhdmMapper,
    hooks: FrameHooks,
    kernel_root: PhysAddr,
    active_root: PhysAddr,
    nx_enabled: bool,
    stats: VmmStats,
}

static VMM: SpinLock<Option<VmmState>> = SpinLock::new(None);

fn with_state<R>(f: impl FnOnce(&mut VmmState) -> Result<R, VmmError>) -> Result<R, VmmError> {
    let mut guard = VMM.lock();
    let state = guard.as_mut().ok_or(VmmError::NotInitialized)?;
    f(state)
}

/// Initialize the VMM: capture the HHDM offset, adopt the current CR3 as
/// the kernel address space, and enable EFER.NXE when the CPU supports NX.
///
/// # Errors
/// [`VmmError::Invalid`] when called a second time.
///
/// # Safety
/// Must run at CPL0 with paging enabled; reads CR3 and may write EFER.
/// The caller must serialize init (single-entry).
pub unsafe fn init(hhdm_offset: u64, hooks: FrameHooks) -> Result<(), VmmError> {
    let mut guard = VMM.lock();
    if guard.is_some() {
        return Err(VmmError::Invalid);
    }

    let kernel_root = unsafe { Cr3::load_unsafe() }.pml4_phys();

    let nx_enabled = cpuid::nx_supported();
    if nx_enabled {
        let efer = unsafe { Efer::load_unsafe() };
        if efer.nxe() {
            debug!("vmm: EFER.NXE already enabled");
        } else {
            unsafe { efer.with_nxe(true).store_unsafe() };
            info!("vmm: enabled EFER.NXE");
        }
    } else {
        warn!("vmm: CPU lacks NX, execute protection unavailable");
    }

    info!(
        "vmm: kernel space adopted (PML4 {kernel_root}), HHDM at {:#x}",
        hhdm_offset
    );

    *guard = Some(VmmState {
        hhdm: HhdmMapper::new(hhdm_offset),
        hooks,
        kernel_root,
        active_root: kernel_root,
        nx_enabled,
        stats: VmmStats {
            spaces_created: 1, // the kernel space
            ..VmmStats::default()
        },
    });
    Ok(())
}

/// Handle to the kernel address space.
///
/// # Errors
/// [`VmmError::NotInitialized`] before [`init`].
pub fn kernel_space() -> Result<Space, VmmError> {
    with_state(|state| Ok(Space(state.kernel_root)))
}

/// Whether EFER.NXE is active (NX bits in leaf entries are honored).
#[must_use]
pub fn nx_enabled() -> bool {
    VMM.lock().as_ref().is_some_and(|s| s.nx_enabled)
}

/// The direct-map accessor captured at [`init`].
///
/// # Errors
/// [`VmmError::NotInitialized`] before [`init`].
pub fn hhdm() -> Result<HhdmMapper, VmmError> {
    with_state(|state| Ok(state.hhdm))
}

/// The virtual alias of `pa` in the higher-half direct map.
///
/// # Errors
/// [`VmmError::NotInitialized`] before [`init`].
pub fn phys_to_virt(pa: PhysAddr) -> Result<VirtAddr, VmmError> {
    with_state(|state| Ok(state.hhdm.phys_to_virt(pa)))
}

/// Walk the **active** address space and translate `va`.
///
/// Returns `PhysAddr::zero()` for unmapped addresses.
#[must_use]
pub fn virt_to_phys(va: VirtAddr) -> PhysAddr {
    with_state(|state| {
        let mapper = state.hhdm;
        let space = AddressSpace::from_root(&mapper, state.active_root);
        Ok(space.resolve(va).unwrap_or(PhysAddr::zero()))
    })
    .unwrap_or(PhysAddr::zero())
}

/// Create a new user address space sharing the kernel higher half.
///
/// # Errors
/// [`VmmError::OutOfMemory`] when the PML4 frame cannot be allocated.
pub fn create_space() -> Result<Space, VmmError> {
    with_state(|state| {
        let mapper = state.hhdm;
        let mut frames = HookedFrames(state.hooks);
        let space = AddressSpace::new_user(&mapper, &mut frames, state.kernel_root)?;
        state.stats.spaces_created += 1;
        debug!("vmm: created space (PML4 {})", space.root());
        Ok(Space(space.root()))
    })
}

/// Destroy `space`, returning its lower-half page-table frames to the
/// physical allocator.
///
/// Data frames mapped by leaf entries are **not** freed; they belong to
/// whoever mapped them. If `space` is active, the kernel space is switched
/// in first.
///
/// # Errors
/// [`VmmError::Invalid`] for the kernel space.
pub fn destroy_space(space: Space) -> Result<(), VmmError> {
    with_state(|state| {
        if space.0 == state.kernel_root {
            warn!("vmm: refusing to destroy the kernel space");
            return Err(VmmError::Invalid);
        }
        if space.0 == state.active_root {
            warn!("vmm: destroying the active space, switching to kernel");
            unsafe { Cr3::from_pml4_phys(state.kernel_root).store_unsafe() };
            state.active_root = state.kernel_root;
            state.stats.tlb_flushes += 1;
        }

        let mapper = state.hhdm;
        let mut frames = HookedFrames(state.hooks);
        AddressSpace::from_root(&mapper, space.0).destroy_into(&mut frames);
        state.stats.spaces_destroyed += 1;
        Ok(())
    })
}

/// Load `space` into CR3 (flushes all non-global TLB entries on this CPU).
///
/// # Errors
/// [`VmmError::NotInitialized`] before [`init`].
pub fn switch_space(space: Space) -> Result<(), VmmError> {
    with_state(|state| {
        if state.active_root == space.0 {
            return Ok(());
        }
        unsafe { Cr3::from_pml4_phys(space.0).store_unsafe() };
        state.active_root = space.0;
        state.stats.tlb_flushes += 1;
        Ok(())
    })
}

/// Map `count` pages `va → pa` into `space`. All-or-nothing; each touched
/// page is invalidated on this CPU when `space` is active.
///
/// # Errors
/// As [`AddressSpace::map_pages`].
pub fn map_pages(
    space: Space,
    va: VirtAddr,
    pa: PhysAddr,
    count: usize,
    flags: MemFlags,
) -> Result<(), VmmError> {
    with_state(|state| {
        let mapper = state.hhdm;
        let mut frames = HookedFrames(state.hooks);
        let mut aspace = AddressSpace::from_root(&mapper, space.0);
        aspace.map_pages(&mut frames, va, pa, count, flags)?;

        if state.active_root == space.0 {
            for i in 0..count {
                unsafe { tlb::invalidate_page(va + (i as u64) * PAGE_SIZE) };
            }
        }
        state.stats.pages_mapped += count as u64;
        Ok(())
    })
}

/// Unmap `count` pages starting at `va`; one `invlpg` per page when the
/// space is active.
///
/// # Errors
/// [`VmmError::NoMap`] at the first absent page (earlier pages stay
/// unmapped); [`VmmError::Invalid`] when the range crosses a large-page
/// leaf.
pub fn unmap_pages(space: Space, va: VirtAddr, count: usize) -> Result<(), VmmError> {
    with_state(|state| {
        let mapper = state.hhdm;
        let mut aspace = AddressSpace::from_root(&mapper, space.0);
        let active = state.active_root == space.0;

        for i in 0..count {
            let curr = va + (i as u64) * PAGE_SIZE;
            aspace.unmap_page(curr)?;
            if active {
                unsafe { tlb::invalidate_page(curr) };
            }
            state.stats.pages_unmapped += 1;
        }
        Ok(())
    })
}

/// Translate `va` through `space`.
///
/// # Errors
/// [`VmmError::NoMap`] when nothing is mapped at `va`.
pub fn resolve(space: Space, va: VirtAddr) -> Result<PhysAddr, VmmError> {
    with_state(|state| {
        let mapper = state.hhdm;
        AddressSpace::from_root(&mapper, space.0)
            .resolve(va)
            .ok_or(VmmError::NoMap)
    })
}

/// Snapshot of the aggregate counters.
///
/// # Errors
/// [`VmmError::NotInitialized`] before [`init`].
pub fn stats() -> Result<VmmStats, VmmError> {
    with_state(|state| Ok(state.stats))
}
