//! # Kernel Heap
//!
//! The hybrid dynamic allocator of the kernel:
//!
//! - **slab caches** serve objects up to 2 KiB out of 4 KiB pages obtained
//!   from the physical allocator;
//! - a **buddy allocator** serves larger blocks (4 KiB .. 1 MiB) out of one
//!   contiguous physical region carved from the PMM at init;
//! - the **facade** (`kalloc`/`kcalloc`/`krealloc`/`kfree`) routes between
//!   them by request size and hands out direct-map virtual pointers.
//!
//! Lock order throughout is slab → buddy → pmm: a cache may take a frame
//! from the PMM while holding its own lock, the buddy never calls anyone,
//! and nothing calls back into the heap.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod buddy;
mod heap;
mod slab;

pub use buddy::{
    BUDDY_MAX_ORDER, BUDDY_MIN_ORDER, BuddyAllocator, BuddyStats, MAX_BLOCK_SIZE, MAX_REGION_SIZE,
    MIN_BLOCK_SIZE,
};
pub use heap::{DirectMap, KernelHeap, SLAB_MAX_CACHES, SLAB_MAX_SIZE};
pub use slab::{ObjectCtor, ObjectDtor, SLAB_MAGIC, SlabCache, SlabCacheStats};

use core::ptr;

use kernel_addr::PAGE_SIZE;
use kernel_pmm::GlobalFrameAlloc;
use kernel_sync::SyncOnceCell;
use kernel_vmem::HhdmMapper;
use log::info;

bitflags::bitflags! {
    /// Allocation behavior flags for [`kalloc_flags`].
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct AllocFlags: u32 {
        /// Zero the returned memory.
        const ZERO = 1 << 0;
        /// Caller cannot sleep. Advisory: no heap path sleeps today.
        const ATOMIC = 1 << 1;
        /// Prefer physically contiguous memory. Advisory: buddy blocks
        /// are contiguous by construction.
        const DMA = 1 << 2;
        /// Honor the `align` argument (power of two).
        const ALIGN = 1 << 3;
    }
}

/// Failure taxonomy of heap setup paths. Allocation itself reports failure
/// with a null pointer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    /// A prerequisite subsystem (PMM, VMM) is not initialized.
    #[error("heap prerequisites not initialized")]
    NotInitialized,
    /// No contiguous physical region for the buddy allocator.
    #[error("out of physical memory for the heap")]
    OutOfMemory,
    /// The buddy region is smaller than one minimum block.
    #[error("heap region too small")]
    RegionTooSmall,
    /// Bad cache geometry (alignment, object size).
    #[error("invalid allocator argument")]
    InvalidArgument,
    /// The slab cache registry is full.
    #[error("slab cache registry exhausted")]
    TooManyCaches,
}

static HEAP: SyncOnceCell<KernelHeap<HhdmMapper>> = SyncOnceCell::new();

/// Initialize the kernel heap: carve a buddy region out of the largest
/// free physical run and seed the default slab classes.
///
/// Idempotent: a second call is a no-op returning `Ok`.
///
/// # Errors
/// - [`HeapError::NotInitialized`] — PMM or VMM not set up yet.
/// - [`HeapError::OutOfMemory`] — no aligned contiguous run available.
pub fn init() -> Result<(), HeapError> {
    if HEAP.get().is_some() {
        return Ok(());
    }

    let mapper = kernel_vmem::vmm::hhdm().map_err(|_| HeapError::NotInitialized)?;
    let (_, run_len) = kernel_pmm::find_largest_free_run().ok_or(HeapError::NotInitialized)?;

    // Budget: half of the largest run, in whole max-order blocks, capped
    // at what one buddy instance can track.
    let max_pages = MAX_REGION_SIZE / PAGE_SIZE;
    let block_pages = MAX_BLOCK_SIZE / PAGE_SIZE;
    let mut pages = (run_len / 2).min(max_pages) / block_pages * block_pages;

    let mut region = None;
    while pages >= block_pages {
        if let Some(base) = kernel_pmm::alloc_aligned(pages, MAX_BLOCK_SIZE) {
            region = Some((base, pages));
            break;
        }
        pages /= 2;
    }
    let (base, pages) = region.ok_or(HeapError::OutOfMemory)?;

    let heap = KernelHeap::new(mapper, base, pages * PAGE_SIZE)?;
    info!(
        "heap: buddy region {} + {} MiB, {} slab classes",
        base,
        pages * PAGE_SIZE / (1024 * 1024),
        heap.caches().count()
    );

    // Losing the race means another init already published a heap; the
    // carved region would leak, but init is serialized by the boot path.
    HEAP.set(heap).map_err(|_| HeapError::NotInitialized)?;
    Ok(())
}

fn heap() -> Option<&'static KernelHeap<HhdmMapper>> {
    HEAP.get()
}

/// Allocate `size` bytes; contents undefined. Null on failure or before
/// [`init`].
pub fn kalloc(size: u64) -> *mut u8 {
    heap().map_or(ptr::null_mut(), |h| h.kalloc(&mut GlobalFrameAlloc, size))
}

/// Allocate with [`AllocFlags`]; see [`KernelHeap::kalloc_flags`].
pub fn kalloc_flags(size: u64, flags: AllocFlags, align: u64) -> *mut u8 {
    heap().map_or(ptr::null_mut(), |h| {
        h.kalloc_flags(&mut GlobalFrameAlloc, size, flags, align)
    })
}

/// Allocate zeroed memory for `n` members of `size` bytes.
pub fn kcalloc(n: u64, size: u64) -> *mut u8 {
    heap().map_or(ptr::null_mut(), |h| h.kcalloc(&mut GlobalFrameAlloc, n, size))
}

/// Resize an allocation; see [`KernelHeap::krealloc`].
pub fn krealloc(p: *mut u8, new_size: u64) -> *mut u8 {
    heap().map_or(ptr::null_mut(), |h| {
        h.krealloc(&mut GlobalFrameAlloc, p, new_size)
    })
}

/// Free a pointer returned by any allocation entry point.
pub fn kfree(p: *mut u8) {
    if let Some(h) = heap() {
        h.kfree(p);
    }
}

/// Run the heap's integrity checks (buddy lists + slab accounting).
#[must_use]
pub fn check_integrity() -> bool {
    heap().is_some_and(KernelHeap::check_integrity)
}

/// Log per-cache and buddy usage.
pub fn dump_info() {
    let Some(h) = heap() else {
        info!("heap: not initialized");
        return;
    };
    for cache in h.caches() {
        let stats = cache.stats();
        info!(
            "heap: cache {:<12} obj={:<5} slabs={:<3} live={}",
            cache.name(),
            stats.object_size,
            stats.total_slabs,
            stats.allocated_objects
        );
    }
    h.with_buddy(|b| {
        info!(
            "heap: buddy free={} KiB largest={} KiB",
            b.total_free() / 1024,
            b.largest_free_block() / 1024
        );
    });
}

/// Shared test fixtures: a contiguous simulated-RAM pool, its mapper, and
/// a bounded frame source drawing from it.
#[cfg(test)]
pub(crate) mod tests {
    use super::heap::DirectMap;
    use kernel_addr::{PhysAddr, VirtAddr};
    use kernel_vmem::{FrameAlloc, PhysMapper};

    /// Simulated physical memory: one contiguous 8-byte-aligned buffer;
    /// physical addresses are offsets into it.
    pub struct Pool {
        mem: Vec<u64>,
    }

    impl Pool {
        pub fn new(bytes: usize) -> Self {
            Self {
                mem: vec![0u64; bytes / 8],
            }
        }

        pub fn mapper(&self) -> PoolMapper {
            PoolMapper {
                base: self.mem.as_ptr() as *mut u8,
            }
        }
    }

    /// [`PhysMapper`]/[`DirectMap`] over a [`Pool`]; the "direct map" is
    /// the host address of the buffer.
    #[derive(Copy, Clone)]
    pub struct PoolMapper {
        base: *mut u8,
    }

    impl PhysMapper for PoolMapper {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            unsafe { &mut *(self.base.add(pa.as_u64() as usize) as *mut T) }
        }
    }

    impl DirectMap for PoolMapper {
        fn phys_to_virt(&self, pa: PhysAddr) -> VirtAddr {
            VirtAddr::new(self.base as u64 + pa.as_u64())
        }

        fn virt_to_phys(&self, va: VirtAddr) -> Option<PhysAddr> {
            va.as_u64().checked_sub(self.base as u64).map(PhysAddr::new)
        }
    }

    /// Frame source handing out pool pages `[first, limit)`.
    pub struct PoolFrames {
        next: u64,
        limit: u64,
        freed: usize,
    }

    impl PoolFrames {
        pub fn new(_pool: &Pool, first_page: u64, limit_page: u64) -> Self {
            Self {
                next: first_page,
                limit: limit_page,
                freed: 0,
            }
        }

        pub fn freed(&self) -> usize {
            self.freed
        }
    }

    impl FrameAlloc for PoolFrames {
        fn alloc_frame(&mut self) -> Option<PhysAddr> {
            if self.next == self.limit {
                return None;
            }
            let frame = PhysAddr::from_page_index(self.next);
            self.next += 1;
            Some(frame)
        }

        fn free_frame(&mut self, _frame: PhysAddr) {
            self.freed += 1;
        }
    }
}
