//! # Physical Memory Manager
//!
//! Page-frame accounting for the whole machine: a bitmap with one bit per
//! 4 KiB frame, built from the bootloader memory map. The allocator core
//! ([`BitmapFrameAllocator`]) is generic over the physical mapper and fully
//! host-testable; the module-level functions wrap the single kernel-wide
//! instance behind a [`SpinLock`].
//!
//! Lifecycle: [`init`] once during early boot (serialized by the caller),
//! then any number of alloc/free calls. Before `init`, allocating returns
//! `None` and the fallible calls report [`PmmError::NotInitialized`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod frame_alloc;

pub use frame_alloc::BitmapFrameAllocator;

use kernel_addr::PhysAddr;
use kernel_bootinfo::MemoryMap;
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, HhdmMapper};
use log::warn;

/// Failure taxonomy of the physical allocator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PmmError {
    /// No frame (or no contiguous run) satisfies the request.
    #[error("out of physical memory")]
    OutOfMemory,
    /// Misaligned or out-of-range physical address.
    #[error("invalid physical address")]
    InvalidAddress,
    /// Free of a frame that is not currently allocated.
    #[error("frame is already free")]
    AlreadyFree,
    /// The PMM has not been initialized (or the memory map was unusable).
    #[error("physical memory manager not initialized")]
    NotInitialized,
}

/// Counters kept alongside the bitmap.
///
/// Invariant at every quiescent point: `free_pages + used_pages ==
/// total_pages`.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PmmStats {
    /// Frames tracked by the bitmap.
    pub total_pages: u64,
    /// Currently free frames.
    pub free_pages: u64,
    /// Currently used frames (including reserved and the bitmap itself).
    pub used_pages: u64,
    /// Frames inside non-reclaimable regions.
    pub reserved_pages: u64,
    /// Successful allocation calls.
    pub alloc_count: u64,
    /// Successful free calls.
    pub free_count: u64,
    /// Frames backing the bitmap.
    pub bitmap_pages: u64,
    /// Longest free run found by the last fragmentation scan.
    pub largest_free_run: u64,
}

static PMM: SpinLock<Option<BitmapFrameAllocator<HhdmMapper>>> = SpinLock::new(None);

/// Initialize the kernel-wide PMM from the bootloader memory map.
///
/// Idempotent: a second call is a no-op returning `Ok`. Callers must
/// serialize init against all other entry points.
///
/// # Errors
/// - [`PmmError::NotInitialized`] — empty memory map.
/// - [`PmmError::OutOfMemory`] — no usable region can hold the bitmap.
pub fn init(mapper: HhdmMapper, map: &MemoryMap) -> Result<(), PmmError> {
    let mut pmm = PMM.lock();
    if pmm.is_some() {
        return Ok(());
    }
    *pmm = Some(BitmapFrameAllocator::new(mapper, map)?);
    Ok(())
}

/// Allocate one 4 KiB frame; contents undefined.
pub fn alloc_page() -> Option<PhysAddr> {
    PMM.lock().as_mut()?.alloc_page()
}

/// Allocate `count` physically contiguous frames; all-or-nothing.
pub fn alloc_pages(count: u64) -> Option<PhysAddr> {
    PMM.lock().as_mut()?.alloc_pages(count)
}

/// Allocate `count` contiguous frames inside `[lo, hi)`.
pub fn alloc_pages_in_range(count: u64, lo: PhysAddr, hi: PhysAddr) -> Option<PhysAddr> {
    PMM.lock().as_mut()?.alloc_pages_in_range(count, lo, hi)
}

/// Allocate `count` contiguous frames aligned to `alignment` bytes (a
/// power of two ≥ the page size).
pub fn alloc_aligned(count: u64, alignment: u64) -> Option<PhysAddr> {
    PMM.lock().as_mut()?.alloc_aligned(count, alignment)
}

/// Free one frame.
///
/// # Errors
/// See [`BitmapFrameAllocator::free_page`]; [`PmmError::NotInitialized`]
/// before [`init`].
pub fn free_page(page: PhysAddr) -> Result<(), PmmError> {
    PMM.lock()
        .as_mut()
        .ok_or(PmmError::NotInitialized)?
        .free_page(page)
}

/// Free `count` contiguous frames; the whole range is validated before any
/// bit changes.
///
/// # Errors
/// See [`BitmapFrameAllocator::free_pages`]; [`PmmError::NotInitialized`]
/// before [`init`].
pub fn free_pages(pages: PhysAddr, count: u64) -> Result<(), PmmError> {
    PMM.lock()
        .as_mut()
        .ok_or(PmmError::NotInitialized)?
        .free_pages(pages, count)
}

/// Whether `page` is currently free (false before [`init`]).
#[must_use]
pub fn is_page_free(page: PhysAddr) -> bool {
    PMM.lock().as_ref().is_some_and(|p| p.is_page_free(page))
}

/// Frame index and free state of `page`, if tracked.
#[must_use]
pub fn page_info(page: PhysAddr) -> Option<(u64, bool)> {
    PMM.lock().as_ref()?.page_info(page)
}

/// Snapshot of the counters.
///
/// # Errors
/// [`PmmError::NotInitialized`] before [`init`].
pub fn stats() -> Result<PmmStats, PmmError> {
    Ok(*PMM.lock().as_ref().ok_or(PmmError::NotInitialized)?.stats())
}

/// Recount the bitmap and compare with the cached counters.
#[must_use]
pub fn check_integrity() -> bool {
    PMM.lock().as_ref().is_some_and(BitmapFrameAllocator::check_integrity)
}

/// Longest free run as `(start_page, length)`.
#[must_use]
pub fn find_largest_free_run() -> Option<(u64, u64)> {
    Some(PMM.lock().as_mut()?.find_largest_free_run())
}

/// [`FrameAlloc`] adapter over the global PMM, for the subsystems that take
/// a frame source (page-table walker, slab caches).
#[derive(Debug, Copy, Clone, Default)]
pub struct GlobalFrameAlloc;

impl FrameAlloc for GlobalFrameAlloc {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        alloc_page()
    }

    fn free_frame(&mut self, frame: PhysAddr) {
        if let Err(err) = free_page(frame) {
            warn!("pmm: dropped frame {frame}: {err}");
        }
    }
}
