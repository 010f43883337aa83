//! # Buddy Allocator
//!
//! Power-of-two block allocator over one contiguous physical region,
//! serving the large half of the kernel heap (blocks of 4 KiB up to
//! 1 MiB). Every free block starts with a [`BlockHeader`] carrying its
//! order and a magic tag, and sits on the free list of its order; a
//! parallel 4 KiB-granular bitmap mirrors the allocated spans so frees and
//! coalescing can be cross-checked.
//!
//! Coalescing: the buddy of a block is found by XOR-ing its region offset
//! with `1 << order`. Merging requires the buddy's bitmap bits to be clear
//! **and** a matching `FREE`-tagged block of the same order on the free
//! list; either check failing stops the merge.
//!
//! Callers that hand in garbage (double frees, foreign pointers, stale
//! magics) get a warning and no state change.

use kernel_addr::{PhysAddr, align_down, align_up};
use kernel_vmem::PhysMapper;
use log::warn;

use crate::HeapError;

/// Smallest block: one 4 KiB page.
pub const BUDDY_MIN_ORDER: u32 = 12;
/// Largest block: 1 MiB.
pub const BUDDY_MAX_ORDER: u32 = 20;
/// Number of managed orders.
pub const ORDER_COUNT: usize = (BUDDY_MAX_ORDER - BUDDY_MIN_ORDER + 1) as usize;

/// Smallest block size in bytes.
pub const MIN_BLOCK_SIZE: u64 = 1 << BUDDY_MIN_ORDER;
/// Largest block size in bytes.
pub const MAX_BLOCK_SIZE: u64 = 1 << BUDDY_MAX_ORDER;

/// Largest region one allocator instance manages. Bounds the inline
/// bitmap (8 KiB at this cap) and thereby the allocator's footprint on the
/// boot stack during construction.
pub const MAX_REGION_SIZE: u64 = 1 << 28;

const BITMAP_WORDS: usize = (MAX_REGION_SIZE / MIN_BLOCK_SIZE / 64) as usize;

const FREE_MAGIC: u32 = 0xF4EE_B10C;
const ALLOC_MAGIC: u32 = 0xA110_B10C;

/// Header at the base of every block, free or allocated.
///
/// Free blocks additionally use `prev`/`next` as their free-list links
/// (physical addresses; 0 terminates).
#[repr(C)]
struct BlockHeader {
    magic: u32,
    order: u32,
    prev: u64,
    next: u64,
}

/// Space reserved for the header before the payload; keeps the payload
/// 32-byte aligned.
pub const HEADER_SIZE: u64 = 32;

const _: () = assert!(size_of::<BlockHeader>() as u64 <= HEADER_SIZE);
const _: () = assert!(HEADER_SIZE < MIN_BLOCK_SIZE);

/// Allocation/free counters.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BuddyStats {
    pub total_allocs: u64,
    pub total_frees: u64,
    pub failed_allocs: u64,
}

/// Buddy allocator over `[base, base + size)`.
pub struct BuddyAllocator<M: PhysMapper> {
    mapper: M,
    base: PhysAddr,
    size: u64,
    /// Free-list heads per order (physical addresses; 0 = empty).
    free_lists: [u64; ORDER_COUNT],
    /// One bit per [`MIN_BLOCK_SIZE`] unit: set while inside an allocation.
    bitmap: [u64; BITMAP_WORDS],
    stats: BuddyStats,
}

impl<M: PhysMapper> BuddyAllocator<M> {
    /// Take ownership of `[base, base + size)` (endpoints normalized to
    /// 4 KiB) and decompose it greedily into the largest aligned blocks.
    ///
    /// # Errors
    /// [`HeapError::RegionTooSmall`] when less than one minimum block
    /// survives normalization (regions over [`MAX_REGION_SIZE`] are
    /// truncated).
    pub fn new(mapper: M, base: PhysAddr, size: u64) -> Result<Self, HeapError> {
        let aligned_base = PhysAddr::new(align_up(base.as_u64(), MIN_BLOCK_SIZE));
        let consumed = aligned_base - base;
        if size <= consumed {
            return Err(HeapError::RegionTooSmall);
        }
        let mut aligned_size = align_down(size - consumed, MIN_BLOCK_SIZE);
        if aligned_size > MAX_REGION_SIZE {
            warn!(
                "buddy: truncating region from {} MiB to {} MiB",
                aligned_size >> 20,
                MAX_REGION_SIZE >> 20
            );
            aligned_size = MAX_REGION_SIZE;
        }
        if aligned_size < MIN_BLOCK_SIZE || aligned_base.is_null() {
            return Err(HeapError::RegionTooSmall);
        }

        let mut buddy = Self {
            mapper,
            base: aligned_base,
            size: aligned_size,
            free_lists: [0; ORDER_COUNT],
            bitmap: [0; BITMAP_WORDS],
            stats: BuddyStats::default(),
        };

        // Greedy decomposition: at each cursor, emit the largest block that
        // both fits the remainder and is aligned at the cursor.
        let mut addr = aligned_base;
        let mut remaining = aligned_size;
        while remaining >= MIN_BLOCK_SIZE {
            let mut order = BUDDY_MAX_ORDER;
            while order > BUDDY_MIN_ORDER {
                let bs = 1u64 << order;
                if bs <= remaining && addr.as_u64() % bs == 0 {
                    break;
                }
                order -= 1;
            }
            let block_size = 1u64 << order;
            buddy.push_free(addr, order);
            addr += block_size;
            remaining -= block_size;
        }

        Ok(buddy)
    }

    /// Base of the managed region.
    #[must_use]
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    /// Size of the managed region in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Allocate at least `size` payload bytes.
    ///
    /// Returns the physical payload address (block base +
    /// [`HEADER_SIZE`]), or `None` when no block of a sufficient order is
    /// free.
    pub fn alloc(&mut self, size: u64) -> Option<PhysAddr> {
        if size == 0 {
            return None;
        }
        let Some(order) = order_for_request(size) else {
            self.stats.failed_allocs += 1;
            return None;
        };

        // First non-empty list at or above the needed order.
        let mut current = order;
        while current <= BUDDY_MAX_ORDER && self.free_lists[list_index(current)] == 0 {
            current += 1;
        }
        if current > BUDDY_MAX_ORDER {
            self.stats.failed_allocs += 1;
            warn!("buddy: alloc failed for {size} bytes");
            return None;
        }

        let block = PhysAddr::new(self.free_lists[list_index(current)]);
        if self.header(block).magic != FREE_MAGIC {
            warn!("buddy: free list head without FREE magic at {block}");
        }
        self.unlink(block, current);

        // Split down to the requested order; each upper half becomes a free
        // block one order below.
        while current > order {
            current -= 1;
            let half = PhysAddr::new(block.as_u64() + (1 << current));
            self.push_free(half, current);
        }

        let header = self.header_mut(block);
        header.magic = ALLOC_MAGIC;
        header.order = order;
        header.prev = 0;
        header.next = 0;
        self.set_span(block, order, true);

        self.stats.total_allocs += 1;
        Some(block + HEADER_SIZE)
    }

    /// Free a payload address previously returned by [`alloc`](Self::alloc)
    /// and coalesce with free buddies as far as possible.
    ///
    /// Invalid input (out-of-region pointer, bad magic, double free) is
    /// logged and ignored.
    pub fn free(&mut self, payload: PhysAddr) {
        if payload.as_u64() < HEADER_SIZE {
            warn!("buddy: bogus pointer {payload}");
            return;
        }
        let mut block = PhysAddr::new(payload.as_u64() - HEADER_SIZE);
        if block < self.base || block.as_u64() >= self.base.as_u64() + self.size {
            warn!("buddy: pointer {payload} outside managed region");
            return;
        }

        let header = self.header(block);
        if header.magic != ALLOC_MAGIC {
            warn!("buddy: double free or invalid pointer {payload}");
            return;
        }
        let mut order = header.order;
        if !(BUDDY_MIN_ORDER..=BUDDY_MAX_ORDER).contains(&order) {
            warn!("buddy: corrupt order {order} at {block}");
            return;
        }

        // The bitmap must agree that the whole span is allocated.
        if !self.span_is(block, order, true) {
            warn!("buddy: double free or invalid pointer {payload}");
            return;
        }
        self.set_span(block, order, false);

        // Coalesce while the buddy is wholly free and sits on the matching
        // free list.
        while order < BUDDY_MAX_ORDER {
            let offset = block - self.base;
            let buddy_offset = offset ^ (1 << order);
            if buddy_offset + (1 << order) > self.size {
                break;
            }
            let buddy = self.base + buddy_offset;
            if !self.span_is(buddy, order, false) {
                break;
            }
            if !self.on_free_list(buddy, order) {
                break;
            }
            self.unlink(buddy, order);
            block = block.min(buddy);
            order += 1;
        }

        self.push_free(block, order);
        self.stats.total_frees += 1;
    }

    /// Size in bytes of the largest free block.
    #[must_use]
    pub fn largest_free_block(&self) -> u64 {
        for order in (BUDDY_MIN_ORDER..=BUDDY_MAX_ORDER).rev() {
            if self.free_lists[list_index(order)] != 0 {
                return 1 << order;
            }
        }
        0
    }

    /// Total free bytes across all lists.
    #[must_use]
    pub fn total_free(&self) -> u64 {
        let mut total = 0;
        for order in BUDDY_MIN_ORDER..=BUDDY_MAX_ORDER {
            let mut node = self.free_lists[list_index(order)];
            while node != 0 {
                total += 1u64 << order;
                node = self.header(PhysAddr::new(node)).next;
            }
        }
        total
    }

    /// Verify every free-list block carries the right order, the `FREE`
    /// magic, and an offset aligned to its size.
    #[must_use]
    pub fn check_integrity(&self) -> bool {
        for order in BUDDY_MIN_ORDER..=BUDDY_MAX_ORDER {
            let mut node = self.free_lists[list_index(order)];
            while node != 0 {
                let header = self.header(PhysAddr::new(node));
                if header.magic != FREE_MAGIC || header.order != order {
                    return false;
                }
                if (node - self.base.as_u64()) % (1 << order) != 0 {
                    return false;
                }
                node = header.next;
            }
        }
        true
    }

    /// Current counters.
    #[must_use]
    pub const fn stats(&self) -> &BuddyStats {
        &self.stats
    }

    /// Payload capacity of the allocation containing `payload`, if it looks
    /// like a live buddy allocation.
    pub(crate) fn payload_size(&self, payload: PhysAddr) -> Option<u64> {
        if payload.as_u64() < HEADER_SIZE {
            return None;
        }
        let block = PhysAddr::new(payload.as_u64() - HEADER_SIZE);
        if block < self.base || block.as_u64() >= self.base.as_u64() + self.size {
            return None;
        }
        let header = self.header(block);
        if header.magic != ALLOC_MAGIC {
            return None;
        }
        Some((1u64 << header.order) - HEADER_SIZE)
    }

    // ---- header / list internals -----------------------------------------

    fn header(&self, block: PhysAddr) -> &BlockHeader {
        // SAFETY: `block` lies within the managed region, which the mapper
        // covers writable.
        unsafe { self.mapper.phys_to_mut::<BlockHeader>(block) }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self, block: PhysAddr) -> &mut BlockHeader {
        // SAFETY: as in `header`.
        unsafe { self.mapper.phys_to_mut::<BlockHeader>(block) }
    }

    /// Initialize `block` as free of `order` and push it onto its list.
    fn push_free(&mut self, block: PhysAddr, order: u32) {
        let head = self.free_lists[list_index(order)];
        {
            let header = self.header_mut(block);
            header.magic = FREE_MAGIC;
            header.order = order;
            header.prev = 0;
            header.next = head;
        }
        if head != 0 {
            self.header_mut(PhysAddr::new(head)).prev = block.as_u64();
        }
        self.free_lists[list_index(order)] = block.as_u64();
    }

    /// Remove `block` from the free list of `order`.
    fn unlink(&mut self, block: PhysAddr, order: u32) {
        let (prev, next) = {
            let header = self.header(block);
            (header.prev, header.next)
        };
        if prev == 0 {
            self.free_lists[list_index(order)] = next;
        } else {
            self.header_mut(PhysAddr::new(prev)).next = next;
        }
        if next != 0 {
            self.header_mut(PhysAddr::new(next)).prev = prev;
        }
    }

    /// Whether a free block of exactly `order` with `FREE` magic sits at
    /// `addr`.
    fn on_free_list(&self, addr: PhysAddr, order: u32) -> bool {
        let mut node = self.free_lists[list_index(order)];
        while node != 0 {
            if node == addr.as_u64() {
                return self.header(addr).magic == FREE_MAGIC;
            }
            node = self.header(PhysAddr::new(node)).next;
        }
        false
    }

    // ---- allocation bitmap ----------------------------------------------

    fn span_range(&self, block: PhysAddr, order: u32) -> (u64, u64) {
        let start = (block - self.base) / MIN_BLOCK_SIZE;
        let count = (1u64 << order) / MIN_BLOCK_SIZE;
        (start, count)
    }

    fn set_span(&mut self, block: PhysAddr, order: u32, used: bool) {
        let (start, count) = self.span_range(block, order);
        for i in start..start + count {
            let (word, bit) = ((i / 64) as usize, i % 64);
            if used {
                self.bitmap[word] |= 1 << bit;
            } else {
                self.bitmap[word] &= !(1 << bit);
            }
        }
    }

    fn span_is(&self, block: PhysAddr, order: u32, used: bool) -> bool {
        let (start, count) = self.span_range(block, order);
        (start..start + count).all(|i| {
            let (word, bit) = ((i / 64) as usize, i % 64);
            (self.bitmap[word] & (1 << bit) != 0) == used
        })
    }
}

/// Order whose block fits `size` payload bytes plus the header, or `None`
/// when even the largest block is too small.
fn order_for_request(size: u64) -> Option<u32> {
    let needed = (size + HEADER_SIZE).max(MIN_BLOCK_SIZE);
    if needed > MAX_BLOCK_SIZE {
        return None;
    }
    let mut order = BUDDY_MIN_ORDER;
    while (1u64 << order) < needed {
        order += 1;
    }
    Some(order)
}

const fn list_index(order: u32) -> usize {
    (order - BUDDY_MIN_ORDER) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::PoolMapper;
    use kernel_addr::PAGE_SIZE;

    const MIB: u64 = 1024 * 1024;

    /// A 1 MiB test region starting at a 1 MiB-aligned "physical" base.
    fn one_mib_buddy() -> (crate::tests::Pool, BuddyAllocator<PoolMapper>) {
        let pool = crate::tests::Pool::new(2 * MIB as usize);
        let mapper = pool.mapper();
        let buddy = BuddyAllocator::new(mapper, PhysAddr::new(MIB), MIB).unwrap();
        (pool, buddy)
    }

    #[test]
    fn fresh_region_is_one_max_block() {
        let (_pool, buddy) = one_mib_buddy();
        assert_eq!(buddy.largest_free_block(), MIB);
        assert_eq!(buddy.total_free(), MIB);
        assert!(buddy.check_integrity());
    }

    #[test]
    fn split_and_full_coalesce_round_trip() {
        let (_pool, mut buddy) = one_mib_buddy();

        let a = buddy.alloc(4096).unwrap();
        let b = buddy.alloc(4096).unwrap();
        assert_ne!(a, b);
        // Splitting pulled the largest block below 1 MiB.
        assert!(buddy.largest_free_block() < MIB);

        buddy.free(a);
        // One buddy still allocated: not fully merged yet.
        assert!(buddy.largest_free_block() < MIB);

        buddy.free(b);
        // Fully merged back to a single 1 MiB block.
        assert_eq!(buddy.largest_free_block(), MIB);
        assert_eq!(buddy.total_free(), MIB);
        assert!(buddy.check_integrity());
    }

    #[test]
    fn blocks_are_size_aligned() {
        let (_pool, mut buddy) = one_mib_buddy();

        let mut held = Vec::new();
        for &req in &[1u64, 4000, 4097, 60_000, 150_000] {
            let p = buddy.alloc(req).unwrap();
            let block = p.as_u64() - HEADER_SIZE;
            let order = order_for_request(req).unwrap();
            assert_eq!(block % (1 << order), 0, "block for {req} misaligned");
            held.push(p);
        }
        assert!(buddy.check_integrity());

        for p in held {
            buddy.free(p);
        }
        assert_eq!(buddy.largest_free_block(), MIB);
        assert!(buddy.check_integrity());
    }

    #[test]
    fn double_free_is_rejected_without_state_change() {
        let (_pool, mut buddy) = one_mib_buddy();

        let a = buddy.alloc(4096).unwrap();
        buddy.free(a);
        let free_before = buddy.total_free();
        let frees_before = buddy.stats().total_frees;

        buddy.free(a); // second free must be a no-op
        assert_eq!(buddy.total_free(), free_before);
        assert_eq!(buddy.stats().total_frees, frees_before);
        assert!(buddy.check_integrity());
    }

    #[test]
    fn foreign_pointer_is_ignored() {
        let (_pool, mut buddy) = one_mib_buddy();
        let before = buddy.total_free();

        buddy.free(PhysAddr::new(0x10)); // below header size
        buddy.free(PhysAddr::new(64 * MIB)); // outside the region
        assert_eq!(buddy.total_free(), before);
    }

    #[test]
    fn exhaustion_fails_cleanly() {
        let (_pool, mut buddy) = one_mib_buddy();

        let mut held = Vec::new();
        while let Some(p) = buddy.alloc(MAX_BLOCK_SIZE / 2) {
            held.push(p);
        }
        assert!(buddy.stats().failed_allocs > 0);
        assert!(buddy.check_integrity());

        for p in held {
            buddy.free(p);
        }
        assert_eq!(buddy.total_free(), MIB);
    }

    #[test]
    fn oversized_request_is_refused() {
        let (_pool, mut buddy) = one_mib_buddy();
        assert!(buddy.alloc(MAX_BLOCK_SIZE).is_none()); // header does not fit
        assert!(buddy.alloc(8 * MIB).is_none());
        assert_eq!(buddy.stats().failed_allocs, 2);
    }

    #[test]
    fn payload_size_reports_block_capacity() {
        let (_pool, mut buddy) = one_mib_buddy();
        let p = buddy.alloc(5000).unwrap();
        // 5000 + header rounds to 8 KiB.
        assert_eq!(buddy.payload_size(p), Some(8192 - HEADER_SIZE));
        buddy.free(p);
        assert_eq!(buddy.payload_size(p), None);
    }

    #[test]
    fn unaligned_region_is_normalized() {
        let pool = crate::tests::Pool::new(2 * MIB as usize);
        let buddy =
            BuddyAllocator::new(pool.mapper(), PhysAddr::new(MIB + 123), MIB - 123).unwrap();
        assert_eq!(buddy.base().as_u64(), MIB + PAGE_SIZE);
        assert_eq!(buddy.size() % MIN_BLOCK_SIZE, 0);
        assert!(buddy.check_integrity());
    }
}
