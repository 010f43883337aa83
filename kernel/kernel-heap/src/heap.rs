//! # Heap Facade
//!
//! Routes allocations by size: at most [`SLAB_MAX_SIZE`] bytes go to the
//! slab caches, anything larger to the buddy allocator, with the returned
//! pointer being the buddy block's alias in the direct map. `kfree`
//! re-routes by physical range (the buddy region is one contiguous span;
//! everything else with a live slab magic belongs to a cache).

use core::ptr;

use kernel_addr::{PhysAddr, VirtAddr, align_up};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::warn;

use crate::buddy::{BuddyAllocator, HEADER_SIZE};
use crate::slab::SlabCache;
use crate::{AllocFlags, HeapError};

/// Requests up to this many bytes are served by the slab caches.
pub const SLAB_MAX_SIZE: u64 = 2048;

/// Upper bound on registered slab caches.
pub const SLAB_MAX_CACHES: usize = 32;

/// Size classes pre-created for the kernel heap.
const DEFAULT_CLASSES: [(u32, &str); 8] = [
    (16, "kmalloc-16"),
    (32, "kmalloc-32"),
    (64, "kmalloc-64"),
    (128, "kmalloc-128"),
    (256, "kmalloc-256"),
    (512, "kmalloc-512"),
    (1024, "kmalloc-1024"),
    (2048, "kmalloc-2048"),
];

/// Marker preceding an alignment-adjusted buddy pointer.
const ALIGN_TAG: u64 = 0xA11A_11A1_B10C_0FF5;

/// Mapper that also exposes the direct-map address arithmetic the facade
/// needs to hand out (and take back) virtual pointers.
pub trait DirectMap: PhysMapper + Clone {
    /// Virtual alias of `pa` in the direct map.
    fn phys_to_virt(&self, pa: PhysAddr) -> VirtAddr;

    /// Inverse of [`phys_to_virt`](Self::phys_to_virt); `None` for
    /// addresses outside the direct map.
    fn virt_to_phys(&self, va: VirtAddr) -> Option<PhysAddr>;
}

impl DirectMap for kernel_vmem::HhdmMapper {
    fn phys_to_virt(&self, pa: PhysAddr) -> VirtAddr {
        VirtAddr::new(self.offset() + pa.as_u64())
    }

    fn virt_to_phys(&self, va: VirtAddr) -> Option<PhysAddr> {
        va.as_u64()
            .checked_sub(self.offset())
            .map(PhysAddr::new)
    }
}

/// The hybrid kernel heap: slab caches over a buddy allocator.
pub struct KernelHeap<M: DirectMap> {
    mapper: M,
    buddy: kernel_sync::SpinLock<BuddyAllocator<M>>,
    caches: [Option<SlabCache<M>>; SLAB_MAX_CACHES],
    cache_count: usize,
}

impl<M: DirectMap> KernelHeap<M> {
    /// Build the heap over the buddy region `[buddy_base, buddy_base +
    /// buddy_size)` and pre-create the default size classes (each class is
    /// its own alignment, so a class-`c` object is `c`-byte aligned).
    ///
    /// # Errors
    /// Propagates buddy/cache construction failures.
    pub fn new(mapper: M, buddy_base: PhysAddr, buddy_size: u64) -> Result<Self, HeapError> {
        let buddy = BuddyAllocator::new(mapper.clone(), buddy_base, buddy_size)?;

        let mut heap = Self {
            mapper,
            buddy: kernel_sync::SpinLock::new(buddy),
            caches: core::array::from_fn(|_| None),
            cache_count: 0,
        };
        for (size, name) in DEFAULT_CLASSES {
            heap.create_cache(name, size, size, None, None)?;
        }
        Ok(heap)
    }

    /// Register an additional cache (bounded table; fixed once the heap is
    /// published as the kernel singleton).
    ///
    /// # Errors
    /// [`HeapError::TooManyCaches`] past [`SLAB_MAX_CACHES`]; cache
    /// construction errors otherwise.
    pub fn create_cache(
        &mut self,
        name: &'static str,
        object_size: u32,
        align: u32,
        ctor: Option<crate::slab::ObjectCtor>,
        dtor: Option<crate::slab::ObjectDtor>,
    ) -> Result<&SlabCache<M>, HeapError> {
        if self.cache_count == SLAB_MAX_CACHES {
            return Err(HeapError::TooManyCaches);
        }
        let cache = SlabCache::new(self.mapper.clone(), name, object_size, align, ctor, dtor)?;
        self.caches[self.cache_count] = Some(cache);
        self.cache_count += 1;
        Ok(self.caches[self.cache_count - 1].as_ref().expect("just stored"))
    }

    /// Allocate `size` bytes; contents undefined. Null on failure.
    pub fn kalloc(&self, frames: &mut impl FrameAlloc, size: u64) -> *mut u8 {
        self.kalloc_flags(frames, size, AllocFlags::empty(), 0)
    }

    /// Allocate `size` bytes zeroed for an array of `n` members.
    pub fn kcalloc(&self, frames: &mut impl FrameAlloc, n: u64, size: u64) -> *mut u8 {
        let Some(total) = n.checked_mul(size) else {
            return ptr::null_mut();
        };
        self.kalloc_flags(frames, total, AllocFlags::ZERO, 0)
    }

    /// Allocate with flags. `align` is honored only with
    /// [`AllocFlags::ALIGN`] and must be a power of two;
    /// [`AllocFlags::ATOMIC`] and [`AllocFlags::DMA`] are advisory today
    /// (every path is non-sleeping and buddy blocks are physically
    /// contiguous anyway).
    pub fn kalloc_flags(
        &self,
        frames: &mut impl FrameAlloc,
        size: u64,
        flags: AllocFlags,
        align: u64,
    ) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let align = if flags.contains(AllocFlags::ALIGN) {
            if align == 0 || !align.is_power_of_two() {
                return ptr::null_mut();
            }
            align
        } else {
            0
        };

        let effective = size.max(align);
        let pa = if effective <= SLAB_MAX_SIZE {
            self.slab_alloc(frames, effective, align)
        } else {
            self.buddy_alloc(size, align)
        };
        let Some(pa) = pa else {
            return ptr::null_mut();
        };

        let ptr = self.mapper.phys_to_virt(pa).as_mut_ptr::<u8>();
        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: the allocation covers at least `size` bytes.
            unsafe { ptr::write_bytes(ptr, 0, size as usize) };
        }
        ptr
    }

    /// Free a pointer from any `kalloc` path. Null is ignored; pointers
    /// the heap does not recognize are logged and dropped.
    pub fn kfree(&self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let Some(pa) = self.mapper.virt_to_phys(VirtAddr::from_ptr(p)) else {
            warn!("heap: kfree of pointer outside the direct map: {p:p}");
            return;
        };

        if self.in_buddy_region(pa) {
            self.buddy_free(pa);
            return;
        }

        if let Some(cache) = self.cache_for_object(pa) {
            cache.free(pa);
            return;
        }
        warn!("heap: kfree of unrecognized pointer {p:p}");
    }

    /// Resize an allocation. `krealloc(null, n)` allocates;
    /// `krealloc(p, 0)` frees and returns null; otherwise the contents are
    /// copied up to the smaller of both sizes.
    pub fn krealloc(&self, frames: &mut impl FrameAlloc, p: *mut u8, new_size: u64) -> *mut u8 {
        if p.is_null() {
            return self.kalloc(frames, new_size);
        }
        if new_size == 0 {
            self.kfree(p);
            return ptr::null_mut();
        }

        let Some(old_size) = self.allocation_size(p) else {
            warn!("heap: krealloc of unrecognized pointer {p:p}");
            return ptr::null_mut();
        };

        let new = self.kalloc(frames, new_size);
        if new.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: both regions are live and at least `min(old, new)` long.
        unsafe { ptr::copy_nonoverlapping(p, new, old_size.min(new_size) as usize) };
        self.kfree(p);
        new
    }

    /// Usable size of the allocation behind `p`, if the heap owns it.
    #[must_use]
    pub fn allocation_size(&self, p: *mut u8) -> Option<u64> {
        let pa = self.mapper.virt_to_phys(VirtAddr::from_ptr(p))?;
        if self.in_buddy_region(pa) {
            let buddy = self.buddy.lock();
            if let Some((base, skew)) = self.aligned_backlink(pa) {
                return buddy.payload_size(base).map(|cap| cap - skew);
            }
            return buddy.payload_size(pa);
        }
        let cache = self.cache_for_object(pa)?;
        Some(u64::from(cache.object_size()))
    }

    /// Run every integrity check the heap has.
    #[must_use]
    pub fn check_integrity(&self) -> bool {
        let mut ok = self.buddy.lock().check_integrity();
        for cache in self.caches() {
            if !cache.check_integrity() {
                warn!("heap: cache {} failed its accounting check", cache.name());
                ok = false;
            }
        }
        ok
    }

    /// The registered caches.
    pub fn caches(&self) -> impl Iterator<Item = &SlabCache<M>> {
        self.caches[..self.cache_count].iter().filter_map(Option::as_ref)
    }

    /// Exclusive access to the buddy allocator (stats, diagnostics).
    pub fn with_buddy<R>(&self, f: impl FnOnce(&mut BuddyAllocator<M>) -> R) -> R {
        f(&mut self.buddy.lock())
    }

    // ---- routing internals -----------------------------------------------

    fn in_buddy_region(&self, pa: PhysAddr) -> bool {
        let buddy = self.buddy.lock();
        pa >= buddy.base() && pa.as_u64() < buddy.base().as_u64() + buddy.size()
    }

    /// Smallest registered cache that can serve `size` bytes at `align`.
    fn find_cache(&self, size: u64, align: u64) -> Option<&SlabCache<M>> {
        self.caches()
            .filter(|c| {
                u64::from(c.object_size()) >= size
                    && (align == 0 || u64::from(c.align()) % align == 0)
            })
            .min_by_key(|c| c.object_size())
    }

    fn slab_alloc(
        &self,
        frames: &mut impl FrameAlloc,
        size: u64,
        align: u64,
    ) -> Option<PhysAddr> {
        self.find_cache(size, align)?.alloc(frames)
    }

    fn buddy_alloc(&self, size: u64, align: u64) -> Option<PhysAddr> {
        // Buddy payloads are HEADER_SIZE-aligned by construction.
        if align <= HEADER_SIZE {
            return self.buddy.lock().alloc(size);
        }

        // Over-allocate and shift to the requested boundary, leaving a
        // tagged back-link just below the returned pointer.
        let payload = self.buddy.lock().alloc(size + align)?;
        let aligned = PhysAddr::new(align_up(payload.as_u64(), align));
        if aligned == payload {
            return Some(payload);
        }
        // SAFETY: `aligned - 16 ≥ payload` because align > HEADER_SIZE
        // forces a gap of at least one alignment unit.
        unsafe {
            *self.mapper.phys_to_mut::<u64>(PhysAddr::new(aligned.as_u64() - 16)) = ALIGN_TAG;
            *self.mapper.phys_to_mut::<u64>(PhysAddr::new(aligned.as_u64() - 8)) =
                payload.as_u64();
        }
        Some(aligned)
    }

    /// If `pa` carries the alignment back-link, return the true payload
    /// base and the skew consumed by the shift.
    fn aligned_backlink(&self, pa: PhysAddr) -> Option<(PhysAddr, u64)> {
        if pa.as_u64() < 16 {
            return None;
        }
        // SAFETY: both words precede `pa` inside the buddy region.
        let tag = *unsafe { self.mapper.phys_to_mut::<u64>(PhysAddr::new(pa.as_u64() - 16)) };
        if tag != ALIGN_TAG {
            return None;
        }
        let base = *unsafe { self.mapper.phys_to_mut::<u64>(PhysAddr::new(pa.as_u64() - 8)) };
        (base < pa.as_u64()).then(|| (PhysAddr::new(base), pa.as_u64() - base))
    }

    fn buddy_free(&self, pa: PhysAddr) {
        let target = self.aligned_backlink(pa).map_or(pa, |(base, _)| base);
        self.buddy.lock().free(target);
    }

    /// The cache owning the slab page that contains `pa`, if any.
    fn cache_for_object(&self, pa: PhysAddr) -> Option<&SlabCache<M>> {
        let page = pa.page_base();
        self.caches().find(|c| c.contains_slab(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{Pool, PoolFrames, PoolMapper};
    use crate::buddy::MIN_BLOCK_SIZE;

    const MIB: u64 = 1024 * 1024;

    /// Heap over a 4 MiB pool: buddy region at [2 MiB, 3 MiB), slab frames
    /// drawn from pages 16..256.
    fn test_heap() -> (Pool, KernelHeap<PoolMapper>, PoolFrames) {
        let pool = Pool::new(4 * MIB as usize);
        let heap = KernelHeap::new(pool.mapper(), PhysAddr::new(2 * MIB), MIB).unwrap();
        let frames = PoolFrames::new(&pool, 16, 256);
        (pool, heap, frames)
    }

    fn pa_of(pool: &Pool, p: *mut u8) -> PhysAddr {
        pool.mapper().virt_to_phys(VirtAddr::from_ptr(p)).unwrap()
    }

    #[test]
    fn size_routing() {
        let (pool, heap, mut frames) = test_heap();

        // Small requests land in slab pages (outside the buddy region).
        for &size in &[1u64, 16, 100, 2048] {
            let p = heap.kalloc(&mut frames, size);
            assert!(!p.is_null());
            let pa = pa_of(&pool, p);
            assert!(pa.as_u64() < 2 * MIB, "size {size} went to the buddy");
            heap.kfree(p);
        }

        // Large requests come from the buddy region.
        for &size in &[2049u64, 4096, 100_000] {
            let p = heap.kalloc(&mut frames, size);
            assert!(!p.is_null());
            let pa = pa_of(&pool, p);
            assert!(
                (2 * MIB..3 * MIB).contains(&pa.as_u64()),
                "size {size} did not go to the buddy"
            );
            heap.kfree(p);
        }

        assert!(heap.check_integrity());
    }

    #[test]
    fn kfree_routes_back_identically() {
        let (_pool, heap, mut frames) = test_heap();

        let small = heap.kalloc(&mut frames, 64);
        let large = heap.kalloc(&mut frames, 8000);
        let buddy_free_before = heap.with_buddy(|b| b.total_free());

        heap.kfree(small);
        // Freeing the small object must not touch the buddy.
        assert_eq!(heap.with_buddy(|b| b.total_free()), buddy_free_before);

        heap.kfree(large);
        assert!(heap.with_buddy(|b| b.total_free()) > buddy_free_before);
        assert!(heap.check_integrity());
    }

    #[test]
    fn kcalloc_zeroes() {
        let (_pool, heap, mut frames) = test_heap();

        let p = heap.kcalloc(&mut frames, 16, 32);
        assert!(!p.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(p, 512) };
        assert!(bytes.iter().all(|&b| b == 0));
        heap.kfree(p);

        // Overflowing products are refused.
        assert!(heap.kcalloc(&mut frames, u64::MAX, 16).is_null());
    }

    #[test]
    fn zero_flag_on_buddy_path() {
        let (_pool, heap, mut frames) = test_heap();

        // Dirty a block, free it, then demand zeroed memory.
        let p = heap.kalloc(&mut frames, 5000);
        unsafe { core::ptr::write_bytes(p, 0xEE, 5000) };
        heap.kfree(p);

        let p = heap.kalloc_flags(&mut frames, 5000, AllocFlags::ZERO, 0);
        let bytes = unsafe { core::slice::from_raw_parts(p, 5000) };
        assert!(bytes.iter().all(|&b| b == 0));
        heap.kfree(p);
    }

    #[test]
    fn aligned_allocations() {
        let (pool, heap, mut frames) = test_heap();

        // Slab path: alignment picks a large enough class.
        let p = heap.kalloc_flags(&mut frames, 40, AllocFlags::ALIGN, 256);
        assert!(!p.is_null());
        assert_eq!(pa_of(&pool, p).as_u64() % 256, 0);
        heap.kfree(p);

        // Buddy path with a large alignment.
        let p = heap.kalloc_flags(&mut frames, 3000, AllocFlags::ALIGN, 4096);
        assert!(!p.is_null());
        assert_eq!(pa_of(&pool, p).as_u64() % 4096, 0);
        heap.kfree(p);

        // Everything must have been returned.
        assert_eq!(heap.with_buddy(|b| b.total_free()), MIB);

        // Bad alignment is refused.
        assert!(heap
            .kalloc_flags(&mut frames, 64, AllocFlags::ALIGN, 3)
            .is_null());
        assert!(heap.check_integrity());
    }

    #[test]
    fn krealloc_semantics() {
        let (_pool, heap, mut frames) = test_heap();

        // null → plain allocation.
        let p = heap.krealloc(&mut frames, core::ptr::null_mut(), 100);
        assert!(!p.is_null());
        unsafe { p.write_bytes(0x5A, 100) };

        // Grow across the slab/buddy boundary; contents survive.
        let q = heap.krealloc(&mut frames, p, 10_000);
        assert!(!q.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(q, 100) };
        assert!(bytes.iter().all(|&b| b == 0x5A));

        // Shrink back into a slab class.
        let r = heap.krealloc(&mut frames, q, 64);
        assert!(!r.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(r, 64) };
        assert!(bytes.iter().all(|&b| b == 0x5A));

        // size 0 frees.
        assert!(heap.krealloc(&mut frames, r, 0).is_null());
        assert_eq!(heap.with_buddy(|b| b.total_free()), MIB);
        assert!(heap.check_integrity());
    }

    #[test]
    fn allocation_size_reports_classes_and_blocks() {
        let (_pool, heap, mut frames) = test_heap();

        let p = heap.kalloc(&mut frames, 100);
        assert_eq!(heap.allocation_size(p), Some(128));
        heap.kfree(p);

        let p = heap.kalloc(&mut frames, 5000);
        assert_eq!(heap.allocation_size(p), Some(8192 - HEADER_SIZE));
        heap.kfree(p);
    }

    #[test]
    fn unrecognized_pointers_are_dropped() {
        let (pool, heap, mut frames) = test_heap();

        // A pointer into pool memory that belongs to neither allocator.
        let stray = pool
            .mapper()
            .phys_to_virt(PhysAddr::new(10 * MIN_BLOCK_SIZE + 8))
            .as_mut_ptr::<u8>();
        heap.kfree(stray);
        assert!(heap.check_integrity());
    }
}
