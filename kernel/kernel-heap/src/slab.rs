//! # Slab Caches
//!
//! Fixed-size object caches for the small half of the kernel heap. Each
//! slab is one 4 KiB page from the frame allocator, formatted as a
//! [`SlabHeader`] followed by a contiguous object array; free objects form
//! a singly-linked list threaded through the first word of their own
//! payload.
//!
//! A cache keeps its slabs on three intrusive lists (`full`, `partial`,
//! `empty`) linked through physical addresses in the headers and walked
//! via the [`PhysMapper`]. Constructors and destructors run outside the
//! cache lock.

use kernel_addr::{PAGE_SIZE, PhysAddr, align_up};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};

use crate::HeapError;

/// Tag at the base of every live slab page.
pub const SLAB_MAGIC: u32 = 0x51AB_51AB;

/// Bytes reserved at the page base for the header; object 0 starts at the
/// first `align` boundary at or after this.
const HEADER_SPACE: u64 = 64;

/// Width of the embedded free-list link; the minimum object size.
const LINK_SIZE: u32 = 8;

/// Object constructor, invoked after allocation (outside the cache lock).
pub type ObjectCtor = fn(*mut u8, usize);
/// Object destructor, invoked on free (outside the cache lock).
pub type ObjectDtor = fn(*mut u8, usize);

/// Header at the base of each slab page.
#[repr(C)]
struct SlabHeader {
    magic: u32,
    object_size: u32,
    total_objects: u16,
    free_objects: u16,
    _reserved: u32,
    /// First free object (physical address; 0 = slab exhausted).
    free_head: u64,
    /// Intrusive list links (physical addresses; 0 terminates).
    prev: u64,
    next: u64,
}

const _: () = assert!(size_of::<SlabHeader>() as u64 <= HEADER_SPACE);

/// Mutable cache state, guarded by the per-cache lock.
#[derive(Default)]
struct CacheInner {
    /// Heads of the three slab lists (physical addresses; 0 = empty).
    full: u64,
    partial: u64,
    empty: u64,
    total_slabs: u32,
    total_objects: u64,
    allocated_objects: u64,
    alloc_count: u64,
    free_count: u64,
}

/// Point-in-time cache counters.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SlabCacheStats {
    pub object_size: u32,
    pub total_slabs: u32,
    pub total_objects: u64,
    pub allocated_objects: u64,
    pub alloc_count: u64,
    pub free_count: u64,
}

/// One object cache: all objects share a size and alignment.
pub struct SlabCache<M: PhysMapper + Clone> {
    name: &'static str,
    object_size: u32,
    align: u32,
    /// Offset of object 0 within a slab page.
    first_object: u64,
    objects_per_slab: u16,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
    mapper: M,
    inner: SpinLock<CacheInner>,
}

impl<M: PhysMapper + Clone> SlabCache<M> {
    /// Create a cache of `object_size`-byte objects aligned to `align`
    /// (0 picks the link width; must be a power of two otherwise).
    ///
    /// The stored size is raised to the free-list link width and rounded
    /// up to `align`.
    ///
    /// # Errors
    /// [`HeapError::InvalidArgument`] for a non-power-of-two alignment or
    /// an object size that leaves no room for a single object per page.
    pub fn new(
        mapper: M,
        name: &'static str,
        object_size: u32,
        align: u32,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> Result<Self, HeapError> {
        let align = if align == 0 { LINK_SIZE } else { align };
        if !align.is_power_of_two() || object_size == 0 {
            return Err(HeapError::InvalidArgument);
        }
        let align = align.max(LINK_SIZE);

        let object_size = object_size.max(LINK_SIZE).next_multiple_of(align);
        let first_object = align_up(HEADER_SPACE, u64::from(align));
        if first_object + u64::from(object_size) > PAGE_SIZE {
            return Err(HeapError::InvalidArgument);
        }
        let objects_per_slab = ((PAGE_SIZE - first_object) / u64::from(object_size)) as u16;

        Ok(Self {
            name,
            object_size,
            align,
            first_object,
            objects_per_slab,
            ctor,
            dtor,
            mapper,
            inner: SpinLock::new(CacheInner::default()),
        })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Rounded object size served by this cache.
    #[must_use]
    pub const fn object_size(&self) -> u32 {
        self.object_size
    }

    /// Object alignment guaranteed by this cache.
    #[must_use]
    pub const fn align(&self) -> u32 {
        self.align
    }

    /// Allocate one object; `None` when no slab can be created.
    ///
    /// Preference order: a partial slab, then an empty one, then a fresh
    /// page from `frames`.
    pub fn alloc(&self, frames: &mut impl FrameAlloc) -> Option<PhysAddr> {
        let obj;
        {
            let mut inner = self.inner.lock();

            let slab = if inner.partial != 0 {
                PhysAddr::new(inner.partial)
            } else if inner.empty != 0 {
                let slab = PhysAddr::new(inner.empty);
                self.unlink(&mut inner, slab);
                self.push(&mut inner.partial, slab);
                slab
            } else {
                let slab = self.create_slab(frames)?;
                inner.total_slabs += 1;
                inner.total_objects += u64::from(self.objects_per_slab);
                self.push(&mut inner.partial, slab);
                slab
            };

            let header = self.header_mut(slab);
            debug_assert_ne!(header.free_head, 0);
            obj = PhysAddr::new(header.free_head);
            // SAFETY: `obj` is a free object inside this slab; its first
            // word is the next-free link.
            header.free_head = *unsafe { self.mapper.phys_to_mut::<u64>(obj) };
            header.free_objects -= 1;

            if header.free_objects == 0 {
                self.unlink(&mut inner, slab);
                self.push(&mut inner.full, slab);
            }

            inner.allocated_objects += 1;
            inner.alloc_count += 1;
        }

        if let Some(ctor) = self.ctor {
            // SAFETY: freshly popped object, exclusively ours.
            let ptr = unsafe { self.mapper.phys_to_mut::<u8>(obj) } as *mut u8;
            ctor(ptr, self.object_size as usize);
        }
        Some(obj)
    }

    /// Free one object.
    ///
    /// The owning slab is recovered by aligning `obj` down to its page; a
    /// missing slab magic means the pointer is foreign and the call is a
    /// silent no-op.
    pub fn free(&self, obj: PhysAddr) {
        let slab = obj.page_base();
        if self.header(slab).magic != SLAB_MAGIC {
            return;
        }

        {
            let mut inner = self.inner.lock();
            let header = self.header_mut(slab);

            // SAFETY: the object returns to the free list; its first word
            // becomes the link.
            *unsafe { self.mapper.phys_to_mut::<u64>(obj) } = header.free_head;
            header.free_head = obj.as_u64();
            header.free_objects += 1;

            let now_empty = header.free_objects == header.total_objects;
            self.unlink(&mut inner, slab);
            if now_empty {
                self.push(&mut inner.empty, slab);
            } else {
                self.push(&mut inner.partial, slab);
            }

            inner.allocated_objects -= 1;
            inner.free_count += 1;
        }

        if let Some(dtor) = self.dtor {
            // SAFETY: object memory stays valid; only the link word was
            // touched.
            let ptr = unsafe { self.mapper.phys_to_mut::<u8>(obj) } as *mut u8;
            dtor(ptr, self.object_size as usize);
        }
    }

    /// Release every slab on the `empty` list back to `frames`; returns
    /// how many pages went back.
    pub fn shrink(&self, frames: &mut impl FrameAlloc) -> u32 {
        let mut inner = self.inner.lock();
        let mut freed = 0;
        while inner.empty != 0 {
            let slab = PhysAddr::new(inner.empty);
            let (next, objects) = {
                let header = self.header_mut(slab);
                let next = header.next;
                let objects = header.total_objects;
                header.magic = 0;
                (next, objects)
            };
            inner.empty = next;
            if next != 0 {
                self.header_mut(PhysAddr::new(next)).prev = 0;
            }
            inner.total_slabs -= 1;
            inner.total_objects -= u64::from(objects);
            frames.free_frame(slab);
            freed += 1;
        }
        freed
    }

    /// Whether `page` is one of this cache's slabs.
    #[must_use]
    pub fn contains_slab(&self, page: PhysAddr) -> bool {
        let inner = self.inner.lock();
        for head in [inner.full, inner.partial, inner.empty] {
            let mut node = head;
            while node != 0 {
                if node == page.as_u64() {
                    return true;
                }
                node = self.header(PhysAddr::new(node)).next;
            }
        }
        false
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SlabCacheStats {
        let inner = self.inner.lock();
        SlabCacheStats {
            object_size: self.object_size,
            total_slabs: inner.total_slabs,
            total_objects: inner.total_objects,
            allocated_objects: inner.allocated_objects,
            alloc_count: inner.alloc_count,
            free_count: inner.free_count,
        }
    }

    /// Slabs per list as `(full, partial, empty)`.
    #[must_use]
    pub fn slab_counts(&self) -> (u32, u32, u32) {
        let inner = self.inner.lock();
        let count = |mut node: u64| {
            let mut n = 0;
            while node != 0 {
                n += 1;
                node = self.header(PhysAddr::new(node)).next;
            }
            n
        };
        (count(inner.full), count(inner.partial), count(inner.empty))
    }

    /// Verify headers and the accounting invariant: the allocated count
    /// equals Σ over slabs of `total - free`.
    #[must_use]
    pub fn check_integrity(&self) -> bool {
        let inner = self.inner.lock();
        let mut in_use = 0u64;
        for head in [inner.full, inner.partial, inner.empty] {
            let mut node = head;
            while node != 0 {
                let header = self.header(PhysAddr::new(node));
                if header.magic != SLAB_MAGIC || header.object_size != self.object_size {
                    return false;
                }
                in_use += u64::from(header.total_objects - header.free_objects);
                node = header.next;
            }
        }
        in_use == inner.allocated_objects
    }

    // ---- internals -------------------------------------------------------

    /// Format a fresh page as an empty slab with all objects free.
    fn create_slab(&self, frames: &mut impl FrameAlloc) -> Option<PhysAddr> {
        let page = frames.alloc_frame()?;

        let mut free_head = 0u64;
        for i in (0..self.objects_per_slab).rev() {
            let obj = page + self.first_object + u64::from(i) * u64::from(self.object_size);
            // SAFETY: `obj` lies inside the fresh page.
            *unsafe { self.mapper.phys_to_mut::<u64>(obj) } = free_head;
            free_head = obj.as_u64();
        }

        let header = self.header_mut(page);
        *header = SlabHeader {
            magic: SLAB_MAGIC,
            object_size: self.object_size,
            total_objects: self.objects_per_slab,
            free_objects: self.objects_per_slab,
            _reserved: 0,
            free_head,
            prev: 0,
            next: 0,
        };
        Some(page)
    }

    fn header(&self, slab: PhysAddr) -> &SlabHeader {
        // SAFETY: slab pages are owned by this cache and mapped writable.
        unsafe { self.mapper.phys_to_mut::<SlabHeader>(slab) }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self, slab: PhysAddr) -> &mut SlabHeader {
        // SAFETY: as in `header`; callers hold the cache lock.
        unsafe { self.mapper.phys_to_mut::<SlabHeader>(slab) }
    }

    /// Push `slab` at the head of the list anchored at `head`.
    fn push(&self, head: &mut u64, slab: PhysAddr) {
        {
            let header = self.header_mut(slab);
            header.prev = 0;
            header.next = *head;
        }
        if *head != 0 {
            self.header_mut(PhysAddr::new(*head)).prev = slab.as_u64();
        }
        *head = slab.as_u64();
    }

    /// Detach `slab` from whichever list currently holds it.
    fn unlink(&self, inner: &mut CacheInner, slab: PhysAddr) {
        let (prev, next) = {
            let header = self.header(slab);
            (header.prev, header.next)
        };
        if prev == 0 {
            let raw = slab.as_u64();
            if inner.full == raw {
                inner.full = next;
            } else if inner.partial == raw {
                inner.partial = next;
            } else if inner.empty == raw {
                inner.empty = next;
            }
        } else {
            self.header_mut(PhysAddr::new(prev)).next = next;
        }
        if next != 0 {
            self.header_mut(PhysAddr::new(next)).prev = prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{Pool, PoolMapper, PoolFrames};
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn cache_64(pool: &Pool) -> SlabCache<PoolMapper> {
        SlabCache::new(pool.mapper(), "test-64", 64, 64, None, None).unwrap()
    }

    #[test]
    fn object_size_is_normalized() {
        let pool = Pool::new(1 << 20);
        let c = SlabCache::new(pool.mapper(), "odd", 3, 0, None, None).unwrap();
        assert_eq!(c.object_size(), 8); // raised to the link width

        let c = SlabCache::new(pool.mapper(), "round", 20, 16, None, None).unwrap();
        assert_eq!(c.object_size(), 32); // rounded to the alignment

        assert!(SlabCache::new(pool.mapper(), "bad", 16, 3, None, None).is_err());
        assert!(SlabCache::new(pool.mapper(), "huge", 8192, 0, None, None).is_err());
    }

    #[test]
    fn slab_lifecycle_full_partial_empty() {
        let pool = Pool::new(1 << 20);
        let cache = cache_64(&pool);
        let mut frames = PoolFrames::new(&pool, 16, 200);

        let per_slab = ((PAGE_SIZE - 64) / 64) as usize; // 63 objects
        let mut objs = Vec::new();
        for _ in 0..per_slab {
            objs.push(cache.alloc(&mut frames).unwrap());
        }

        // One slab, fully loaded.
        assert_eq!(cache.stats().total_slabs, 1);
        assert_eq!(cache.slab_counts(), (1, 0, 0));
        assert!(cache.check_integrity());

        // Freeing one object moves it to partial.
        cache.free(objs.pop().unwrap());
        assert_eq!(cache.slab_counts(), (0, 1, 0));

        // Freeing the rest moves it to empty.
        for obj in objs.drain(..) {
            cache.free(obj);
        }
        assert_eq!(cache.slab_counts(), (0, 0, 1));
        assert_eq!(cache.stats().allocated_objects, 0);
        assert!(cache.check_integrity());

        // Shrink returns the page to the frame source.
        let freed_before = frames.freed();
        assert_eq!(cache.shrink(&mut frames), 1);
        assert_eq!(frames.freed(), freed_before + 1);
        assert_eq!(cache.stats().total_slabs, 0);
    }

    #[test]
    fn accounting_invariant_under_churn() {
        let pool = Pool::new(1 << 21);
        let cache = cache_64(&pool);
        let mut frames = PoolFrames::new(&pool, 16, 200);

        let mut live = Vec::new();
        for round in 0..6 {
            for _ in 0..40 {
                live.push(cache.alloc(&mut frames).unwrap());
            }
            // Free a sliding share each round.
            for _ in 0..(10 + round * 5) {
                if let Some(obj) = live.pop() {
                    cache.free(obj);
                }
            }
            assert!(cache.check_integrity(), "round {round}");
            assert_eq!(cache.stats().allocated_objects, live.len() as u64);
        }

        for obj in live.drain(..) {
            cache.free(obj);
        }
        assert_eq!(cache.stats().allocated_objects, 0);
        assert!(cache.check_integrity());
    }

    #[test]
    fn objects_do_not_overlap_and_respect_alignment() {
        let pool = Pool::new(1 << 20);
        let cache = cache_64(&pool);
        let mut frames = PoolFrames::new(&pool, 16, 200);

        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..150 {
            let obj = cache.alloc(&mut frames).unwrap();
            assert_eq!(obj.as_u64() % 64, 0);
            assert!(seen.insert(obj.as_u64()), "duplicate object {obj}");
        }
    }

    #[test]
    fn foreign_pointer_free_is_a_no_op() {
        let pool = Pool::new(1 << 20);
        let cache = cache_64(&pool);
        let mut frames = PoolFrames::new(&pool, 16, 200);

        let _obj = cache.alloc(&mut frames).unwrap();
        let before = cache.stats();

        // A page that is not a slab (magic missing).
        cache.free(PhysAddr::new(8 * PAGE_SIZE + 64));
        assert_eq!(cache.stats(), before);
        assert!(cache.check_integrity());
    }

    #[test]
    fn exhausted_frame_source_fails_cleanly() {
        let pool = Pool::new(1 << 20);
        let cache = cache_64(&pool);
        let mut frames = PoolFrames::new(&pool, 16, 17); // one page only

        let per_slab = ((PAGE_SIZE - 64) / 64) as usize;
        for _ in 0..per_slab {
            assert!(cache.alloc(&mut frames).is_some());
        }
        assert!(cache.alloc(&mut frames).is_none());
        assert!(cache.check_integrity());
    }

    #[test]
    fn ctor_and_dtor_run_outside_the_lock() {
        static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
        static DTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

        fn ctor(ptr: *mut u8, size: usize) {
            CTOR_RUNS.fetch_add(1, Ordering::SeqCst);
            unsafe { core::ptr::write_bytes(ptr, 0xAB, size) };
        }
        fn dtor(_ptr: *mut u8, _size: usize) {
            DTOR_RUNS.fetch_add(1, Ordering::SeqCst);
        }

        let pool = Pool::new(1 << 20);
        let cache =
            SlabCache::new(pool.mapper(), "ctor", 32, 0, Some(ctor), Some(dtor)).unwrap();
        let mut frames = PoolFrames::new(&pool, 16, 200);

        let a = cache.alloc(&mut frames).unwrap();
        let b = cache.alloc(&mut frames).unwrap();
        assert_eq!(CTOR_RUNS.load(Ordering::SeqCst), 2);

        // The constructor pattern is visible through the mapper.
        let byte = *unsafe { pool.mapper().phys_to_mut::<u8>(a + 8) };
        assert_eq!(byte, 0xAB);

        cache.free(a);
        cache.free(b);
        assert_eq!(DTOR_RUNS.load(Ordering::SeqCst), 2);
    }
}
