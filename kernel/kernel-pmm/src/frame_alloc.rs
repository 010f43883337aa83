//! # Bitmap Frame Allocator
//!
//! One bit per 4 KiB frame of the whole physical address range
//! `[0, highest_addr)`: set ⇒ used/reserved, clear ⇒ free. The bitmap
//! itself lives inside the first usable region with enough aligned slack
//! and is reached through the [`PhysMapper`], which keeps the allocator
//! runnable against simulated RAM in host tests.
//!
//! Allocation is a next-fit scan driven by `next_free_hint`; frees pull the
//! hint back so low addresses are reused first. Multi-frame searches use
//! the sliding-window skip: hitting a used frame at window offset `i`
//! restarts the window *after* that frame instead of one step further.

use kernel_addr::{PAGE_SIZE, PhysAddr, align_up};
use kernel_bootinfo::{MemoryMap, RegionKind};
use kernel_vmem::PhysMapper;
use log::info;

use crate::{PmmError, PmmStats};

const MIB: u64 = 1024 * 1024;

/// Bitmap-based physical frame allocator.
pub struct BitmapFrameAllocator<M: PhysMapper> {
    mapper: M,
    /// Physical base of the bitmap storage.
    bitmap_base: PhysAddr,
    /// Bitmap size in bytes.
    bitmap_bytes: u64,
    /// Frames tracked (= pages up to the highest reclaimable address).
    total_pages: u64,
    /// Next-fit cursor.
    next_free_hint: u64,
    stats: PmmStats,
    total_memory: u64,
    usable_memory: u64,
}

impl<M: PhysMapper> BitmapFrameAllocator<M> {
    /// Build the allocator from a validated bootloader memory map.
    ///
    /// Marks everything used, then clears the page-aligned interior of
    /// every reclaimable region, then re-marks the bitmap's own frames and
    /// physical page 0.
    ///
    /// # Errors
    /// - [`PmmError::NotInitialized`] — the memory map is empty.
    /// - [`PmmError::OutOfMemory`] — no usable region can hold the bitmap.
    pub fn new(mapper: M, map: &MemoryMap) -> Result<Self, PmmError> {
        if map.is_empty() {
            return Err(PmmError::NotInitialized);
        }

        let map_stats = map.stats();
        let highest_addr = map_stats.highest_addr.as_u64();
        let total_pages = highest_addr.div_ceil(PAGE_SIZE);
        let bitmap_bytes = total_pages.div_ceil(8);
        let bitmap_pages = bitmap_bytes.div_ceil(PAGE_SIZE);

        // Place the bitmap in the first usable region with enough slack
        // past its aligned-up base.
        let mut bitmap_base = None;
        for region in map {
            if region.kind != RegionKind::Usable {
                continue;
            }
            let aligned = align_up(region.base.as_u64(), PAGE_SIZE);
            let end = region.base.as_u64() + region.length;
            if end > aligned && end - aligned >= bitmap_bytes {
                bitmap_base = Some(PhysAddr::new(aligned));
                break;
            }
        }
        let bitmap_base = bitmap_base.ok_or(PmmError::OutOfMemory)?;

        let mut pmm = Self {
            mapper,
            bitmap_base,
            bitmap_bytes,
            total_pages,
            next_free_hint: 0,
            stats: PmmStats {
                total_pages,
                bitmap_pages,
                ..PmmStats::default()
            },
            total_memory: map_stats.total_bytes,
            usable_memory: map_stats.usable_bytes,
        };

        // Conservative start: every frame used.
        for i in 0..bitmap_bytes {
            *pmm.byte_mut(i) = 0xFF;
        }

        // Free the page-aligned interior of every reclaimable region; a
        // partially covered edge page never becomes free.
        for region in map {
            let Some((start, end)) = region.aligned_interior() else {
                continue;
            };
            let pages = (end - start) / PAGE_SIZE;
            if region.kind.is_reclaimable() {
                for p in 0..pages {
                    pmm.clear_bit(start.page_index() + p);
                }
            } else {
                pmm.stats.reserved_pages += pages;
            }
        }

        // The bitmap's own frames and the null frame are never handed out.
        for p in 0..bitmap_pages {
            pmm.set_bit(bitmap_base.page_index() + p);
        }
        pmm.set_bit(0);

        // Authoritative recount.
        let (free, used) = pmm.count_bits();
        pmm.stats.free_pages = free;
        pmm.stats.used_pages = used;

        info!(
            "pmm: {} MiB total, {} MiB usable, {} frames tracked",
            pmm.total_memory / MIB,
            pmm.usable_memory / MIB,
            total_pages
        );
        info!(
            "pmm: bitmap at {} ({} bytes, {} pages), {} frames free",
            bitmap_base, bitmap_bytes, bitmap_pages, free
        );

        Ok(pmm)
    }

    /// Allocate one 4 KiB frame; contents undefined.
    pub fn alloc_page(&mut self) -> Option<PhysAddr> {
        if self.stats.free_pages == 0 {
            return None;
        }
        let idx = self.find_free_from(self.next_free_hint)?;
        self.set_bit(idx);
        self.stats.free_pages -= 1;
        self.stats.used_pages += 1;
        self.stats.alloc_count += 1;
        self.update_hint(idx + 1);
        Some(PhysAddr::from_page_index(idx))
    }

    /// Allocate `count` physically contiguous frames; all-or-nothing.
    pub fn alloc_pages(&mut self, count: u64) -> Option<PhysAddr> {
        self.alloc_pages_window(count, 0, self.total_pages, 1)
    }

    /// Allocate `count` contiguous frames inside `[lo, hi)`.
    pub fn alloc_pages_in_range(&mut self, count: u64, lo: PhysAddr, hi: PhysAddr) -> Option<PhysAddr> {
        let first = align_up(lo.as_u64(), PAGE_SIZE) / PAGE_SIZE;
        let limit = (hi.as_u64() / PAGE_SIZE).min(self.total_pages);
        self.alloc_pages_window(count, first, limit, 1)
    }

    /// Allocate `count` contiguous frames whose base is aligned to
    /// `alignment` bytes (a power of two ≥ the page size).
    pub fn alloc_aligned(&mut self, count: u64, alignment: u64) -> Option<PhysAddr> {
        if !alignment.is_power_of_two() || alignment < PAGE_SIZE {
            return None;
        }
        self.alloc_pages_window(count, 0, self.total_pages, alignment / PAGE_SIZE)
    }

    /// Free one frame.
    ///
    /// # Errors
    /// - [`PmmError::InvalidAddress`] — misaligned or out of range.
    /// - [`PmmError::AlreadyFree`] — the frame is not currently allocated.
    pub fn free_page(&mut self, page: PhysAddr) -> Result<(), PmmError> {
        self.free_pages(page, 1)
    }

    /// Free `count` contiguous frames.
    ///
    /// The whole range is validated as currently allocated **before** any
    /// bit changes, so a failed free never leaves partial state.
    ///
    /// # Errors
    /// As [`free_page`](Self::free_page).
    pub fn free_pages(&mut self, pages: PhysAddr, count: u64) -> Result<(), PmmError> {
        if count == 0 || !pages.is_page_aligned() {
            return Err(PmmError::InvalidAddress);
        }
        let start = pages.page_index();
        if start + count > self.total_pages {
            return Err(PmmError::InvalidAddress);
        }
        for i in 0..count {
            if !self.bit_is_set(start + i) {
                return Err(PmmError::AlreadyFree);
            }
        }

        for i in 0..count {
            self.clear_bit(start + i);
        }
        self.stats.free_pages += count;
        self.stats.used_pages -= count;
        self.stats.free_count += 1;
        if start < self.next_free_hint {
            self.update_hint(start);
        }
        Ok(())
    }

    /// Whether `page` is currently free. Misaligned or out-of-range
    /// addresses report `false`.
    #[must_use]
    pub fn is_page_free(&self, page: PhysAddr) -> bool {
        if !page.is_page_aligned() || page.page_index() >= self.total_pages {
            return false;
        }
        !self.bit_is_set(page.page_index())
    }

    /// Frame index and free/used state of `page`, if it is tracked.
    #[must_use]
    pub fn page_info(&self, page: PhysAddr) -> Option<(u64, bool)> {
        if !page.is_page_aligned() {
            return None;
        }
        let idx = page.page_index();
        (idx < self.total_pages).then(|| (idx, !self.bit_is_set(idx)))
    }

    /// Current counters.
    #[must_use]
    pub const fn stats(&self) -> &PmmStats {
        &self.stats
    }

    /// Recount the bitmap and compare against the cached counters.
    #[must_use]
    pub fn check_integrity(&self) -> bool {
        let (free, used) = self.count_bits();
        free == self.stats.free_pages && used == self.stats.used_pages
    }

    /// Longest run of free frames as `(start_page, length)`; updates the
    /// cached `largest_free_run`.
    pub fn find_largest_free_run(&mut self) -> (u64, u64) {
        let mut best = (0, 0);
        let mut run_start = 0;
        let mut run_len = 0;
        for i in 0..self.total_pages {
            if self.bit_is_set(i) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len > best.1 {
                    best = (run_start, run_len);
                }
            }
        }
        self.stats.largest_free_run = best.1;
        best
    }

    // ---- bitmap internals ------------------------------------------------

    /// Contiguous scan of `[first, limit)` for `count` free frames whose
    /// start index is a multiple of `step`, beginning at the hint and
    /// wrapping once.
    fn alloc_pages_window(
        &mut self,
        count: u64,
        first: u64,
        limit: u64,
        step: u64,
    ) -> Option<PhysAddr> {
        if count == 0 || self.stats.free_pages < count || first >= limit {
            return None;
        }

        let hint = self.next_free_hint.clamp(first, limit);
        let hint = align_up(hint - first, step) + first;
        let start = self
            .scan_window(count, hint, limit, limit, step)
            .or_else(|| self.scan_window(count, first, hint, limit, step))?;

        for i in 0..count {
            self.set_bit(start + i);
        }
        self.stats.free_pages -= count;
        self.stats.used_pages += count;
        self.stats.alloc_count += 1;
        self.update_hint(start + count);
        Some(PhysAddr::from_page_index(start))
    }

    /// Sliding-window search for `count` consecutive clear bits. Start
    /// indices range over `[from, to_start)` aligned to `step` frames; the
    /// window itself may extend up to `limit`.
    fn scan_window(&self, count: u64, from: u64, to_start: u64, limit: u64, step: u64) -> Option<u64> {
        let mut start = from;
        while start < to_start && start + count <= limit {
            let mut hit = None;
            for i in 0..count {
                if self.bit_is_set(start + i) {
                    hit = Some(i);
                    break;
                }
            }
            match hit {
                None => return Some(start),
                // Skip past the used frame instead of advancing by one.
                Some(i) => start = align_up(start + i + 1 - from, step) + from,
            }
        }
        None
    }

    fn update_hint(&mut self, new_hint: u64) {
        self.next_free_hint = if new_hint < self.total_pages {
            new_hint
        } else {
            0
        };
    }

    fn byte_mut(&mut self, byte: u64) -> &mut u8 {
        // SAFETY: `byte < bitmap_bytes`; the bitmap region is owned by the
        // allocator and mapped writable.
        unsafe { self.mapper.phys_to_mut::<u8>(self.bitmap_base + byte) }
    }

    fn byte(&self, byte: u64) -> u8 {
        // SAFETY: as in `byte_mut`; read-only use.
        *unsafe { self.mapper.phys_to_mut::<u8>(self.bitmap_base + byte) }
    }

    fn set_bit(&mut self, index: u64) {
        if index < self.total_pages {
            *self.byte_mut(index / 8) |= 1 << (index % 8);
        }
    }

    fn clear_bit(&mut self, index: u64) {
        if index < self.total_pages {
            *self.byte_mut(index / 8) &= !(1 << (index % 8));
        }
    }

    fn bit_is_set(&self, index: u64) -> bool {
        if index >= self.total_pages {
            return true;
        }
        self.byte(index / 8) & (1 << (index % 8)) != 0
    }

    /// First free frame at or after `from`, wrapping once.
    fn find_free_from(&self, from: u64) -> Option<u64> {
        (from..self.total_pages)
            .chain(0..from)
            .find(|&i| !self.bit_is_set(i))
    }

    /// Count (free, used) over the whole bitmap.
    fn count_bits(&self) -> (u64, u64) {
        let mut used = 0;
        for byte in 0..self.bitmap_bytes {
            let mut v = self.byte(byte);
            // Bits past `total_pages` in the last byte are padding.
            if byte == self.bitmap_bytes - 1 {
                let valid = self.total_pages - byte * 8;
                if valid < 8 {
                    v &= (1 << valid) - 1;
                }
            }
            used += u64::from(v.count_ones());
        }
        (self.total_pages - used, used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_addr::is_aligned;
    use kernel_bootinfo::MemoryRegion;
    use std::vec;
    use std::vec::Vec;

    /// Simulated physical memory: one contiguous, page-aligned buffer.
    /// Physical addresses are plain offsets into it.
    struct TestPool {
        mem: Vec<u64>,
    }

    impl TestPool {
        fn with_bytes(bytes: usize) -> Self {
            Self {
                mem: vec![0u64; bytes / 8],
            }
        }
    }

    impl PhysMapper for TestPool {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let base = self.mem.as_ptr() as u64;
            unsafe { &mut *((base + pa.as_u64()) as *mut T) }
        }
    }

    const MIB: u64 = 1024 * 1024;

    /// One usable region `[0x100000, 0x100000 + size)`, like a small
    /// machine with the low megabyte reserved.
    fn small_map(size: u64) -> MemoryMap {
        MemoryMap::from_regions(&[
            MemoryRegion::new(PhysAddr::zero(), MIB, RegionKind::Reserved),
            MemoryRegion::new(PhysAddr::new(MIB), size, RegionKind::Usable),
        ])
    }

    fn small_pmm(size: u64) -> BitmapFrameAllocator<TestPool> {
        let pool = TestPool::with_bytes((MIB + size) as usize);
        BitmapFrameAllocator::new(pool, &small_map(size)).unwrap()
    }

    #[test]
    fn bitmap_protects_itself_and_page_zero() {
        let size = 256 * MIB;
        let pmm = small_pmm(size);

        let total_pages = (MIB + size) / PAGE_SIZE;
        assert_eq!(pmm.stats().total_pages, total_pages);
        let bitmap_bytes = total_pages.div_ceil(8);

        // Page 0 and every page backing the bitmap report used.
        assert!(!pmm.is_page_free(PhysAddr::zero()));
        let mut p = MIB;
        while p < MIB + bitmap_bytes {
            assert!(!pmm.is_page_free(PhysAddr::new(p)), "bitmap page {p:#x} leaked");
            p += PAGE_SIZE;
        }
        // The first frame past the bitmap is free.
        assert!(pmm.is_page_free(PhysAddr::new(align_up(MIB + bitmap_bytes, PAGE_SIZE))));
    }

    #[test]
    fn conservation_invariant() {
        let mut pmm = small_pmm(8 * MIB);
        let s = pmm.stats();
        assert_eq!(s.free_pages + s.used_pages, s.total_pages);
        assert!(pmm.check_integrity());

        let a = pmm.alloc_page().unwrap();
        let b = pmm.alloc_pages(7).unwrap();
        let s = pmm.stats();
        assert_eq!(s.free_pages + s.used_pages, s.total_pages);
        assert!(pmm.check_integrity());

        pmm.free_page(a).unwrap();
        pmm.free_pages(b, 7).unwrap();
        assert!(pmm.check_integrity());
    }

    #[test]
    fn freed_page_is_reused_first() {
        let mut pmm = small_pmm(8 * MIB);

        let a = pmm.alloc_page().unwrap();
        let _b = pmm.alloc_page().unwrap();
        pmm.free_page(a).unwrap();
        let c = pmm.alloc_page().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn page_info_reports_index_and_state() {
        let mut pmm = small_pmm(8 * MIB);

        let a = pmm.alloc_page().unwrap();
        assert_eq!(pmm.page_info(a), Some((a.page_index(), false)));
        pmm.free_page(a).unwrap();
        assert_eq!(pmm.page_info(a), Some((a.page_index(), true)));

        // Misaligned and out-of-range addresses are not tracked.
        assert_eq!(pmm.page_info(a + 7), None);
        assert_eq!(pmm.page_info(PhysAddr::new(1024 * MIB)), None);
    }

    #[test]
    fn contiguous_allocations_do_not_overlap() {
        let mut pmm = small_pmm(8 * MIB);

        let a = pmm.alloc_pages(4).unwrap();
        let b = pmm.alloc_pages(4).unwrap();
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert!(hi.as_u64() >= lo.as_u64() + 4 * PAGE_SIZE);

        // Round trip: freeing makes the exact range allocatable again.
        pmm.free_pages(a, 4).unwrap();
        assert_eq!(pmm.alloc_pages(4).unwrap(), a);
    }

    #[test]
    fn range_constrained_allocation() {
        let mut pmm = small_pmm(32 * MIB);

        let lo = PhysAddr::new(16 * MIB);
        let hi = PhysAddr::new(20 * MIB);
        let p = pmm.alloc_pages_in_range(8, lo, hi).unwrap();
        assert!(p >= lo);
        assert!(p.as_u64() + 8 * PAGE_SIZE <= hi.as_u64());

        // Impossible window.
        assert!(pmm
            .alloc_pages_in_range(8, PhysAddr::new(MIB), PhysAddr::new(MIB + PAGE_SIZE))
            .is_none());
    }

    #[test]
    fn aligned_allocation() {
        let mut pmm = small_pmm(32 * MIB);
        // Skew the cursor so an aligned result is not automatic.
        let _ = pmm.alloc_page().unwrap();

        let p = pmm.alloc_aligned(4, 64 * 1024).unwrap();
        assert!(is_aligned(p.as_u64(), 64 * 1024));

        // Alignment below page size or non-power-of-two is rejected.
        assert!(pmm.alloc_aligned(1, 3 * 1024).is_none());
        assert!(pmm.alloc_aligned(1, 1024).is_none());
    }

    #[test]
    fn free_validates_before_mutating() {
        let mut pmm = small_pmm(8 * MIB);

        let a = pmm.alloc_pages(2).unwrap();
        // Misaligned.
        assert_eq!(pmm.free_page(a + 1), Err(PmmError::InvalidAddress));
        // Out of range.
        assert_eq!(
            pmm.free_page(PhysAddr::new(1024 * MIB)),
            Err(PmmError::InvalidAddress)
        );
        // Range includes a page that is already free: nothing changes.
        let before = *pmm.stats();
        assert_eq!(pmm.free_pages(a, 3), Err(PmmError::AlreadyFree));
        assert_eq!(pmm.stats().free_pages, before.free_pages);
        assert!(pmm.check_integrity());

        // Double free.
        pmm.free_pages(a, 2).unwrap();
        assert_eq!(pmm.free_pages(a, 2), Err(PmmError::AlreadyFree));
    }

    #[test]
    fn exhaustion_returns_none_without_state_change() {
        let mut pmm = small_pmm(2 * MIB);

        let free = pmm.stats().free_pages;
        let mut held = Vec::new();
        for _ in 0..free {
            held.push(pmm.alloc_page().unwrap());
        }
        assert!(pmm.alloc_page().is_none());
        assert_eq!(pmm.stats().free_pages, 0);
        assert!(pmm.check_integrity());

        // Everything can go back.
        for p in held {
            pmm.free_page(p).unwrap();
        }
        assert_eq!(pmm.stats().free_pages, free);
    }

    #[test]
    fn largest_free_run_tracks_holes() {
        let mut pmm = small_pmm(8 * MIB);

        let (_, run_before) = pmm.find_largest_free_run();
        assert_eq!(run_before, pmm.stats().free_pages);

        // Punch a hole: allocate everything, free two disjoint runs.
        let base = pmm.alloc_pages(run_before).unwrap();
        pmm.free_pages(base, 3).unwrap();
        pmm.free_pages(base + 16 * PAGE_SIZE, 9).unwrap();

        let (start, len) = pmm.find_largest_free_run();
        assert_eq!(len, 9);
        assert_eq!(start, base.page_index() + 16);
        assert_eq!(pmm.stats().largest_free_run, 9);
    }

    #[test]
    fn partial_edge_pages_stay_reserved() {
        // A usable region that starts and ends mid-page: only whole pages
        // inside it may become free.
        let map = MemoryMap::from_regions(&[
            MemoryRegion::new(PhysAddr::zero(), MIB, RegionKind::Reserved),
            MemoryRegion::new(PhysAddr::new(MIB + 0x234), 4 * MIB, RegionKind::Usable),
        ]);
        let pool = TestPool::with_bytes((6 * MIB) as usize);
        let pmm = BitmapFrameAllocator::new(pool, &map).unwrap();

        // The edge page containing the region start is not free.
        assert!(!pmm.is_page_free(PhysAddr::new(MIB)));
        // The page straddling the region end is not free either.
        let end = MIB + 0x234 + 4 * MIB;
        assert!(!pmm.is_page_free(PhysAddr::new(end - (end % PAGE_SIZE))));
    }
}
