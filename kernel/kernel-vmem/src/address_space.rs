//! # Address Space (PML4-rooted)
//!
//! Owns one 4-level page-table tree and implements the mapping engine:
//! map/unmap/resolve plus creation and teardown. All physical table frames
//! are reached through a [`PhysMapper`], so the whole engine runs unchanged
//! against simulated RAM in host tests.
//!
//! ## Structure sharing
//!
//! The higher-half PML4 entries (256..512) of a user space alias the kernel
//! space's subtrees; they are copied once at creation and only read
//! afterwards. The lower half (0..256) is private to each space.
//!
//! ## TLB
//!
//! This layer performs **no** TLB maintenance; the singleton in
//! [`vmm`](crate::vmm) invalidates when it mutates the active space.

use kernel_addr::{PAGE_SIZE, PhysAddr, VirtAddr};

use crate::error::VmmError;
use crate::flags::{MemFlags, translate_flags};
use crate::mapper::{FrameAlloc, PhysMapper};
use crate::pte::{ENTRIES_PER_TABLE, PageTable, PageTableEntry, split_indices};

/// First PML4 slot of the kernel half.
pub const KERNEL_HALF_START: usize = 256;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    /// Physical base of the PML4.
    root: PhysAddr,
    mapper: &'m M,
}

/// Result of a read-only walk down the tree.
enum Walk<'t> {
    /// Some level on the path is absent.
    Missing,
    /// A 1 GiB leaf in the PDPT.
    Leaf1G(PageTableEntry),
    /// A 2 MiB leaf in the PD.
    Leaf2M(PageTableEntry),
    /// Reached the page table; the entry may or may not be present.
    Pte { pt: &'t mut PageTable, index: usize },
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing PML4 frame (e.g. the one CR3 points at).
    #[inline]
    #[must_use]
    pub const fn from_root(mapper: &'m M, root: PhysAddr) -> Self {
        Self { root, mapper }
    }

    /// Allocate a fresh, empty address space.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] when no frame is available for the PML4.
    pub fn new(mapper: &'m M, frames: &mut impl FrameAlloc) -> Result<Self, VmmError> {
        let root = frames.alloc_frame().ok_or(VmmError::OutOfMemory)?;
        let space = Self::from_root(mapper, root);
        space.table_mut(root).zero();
        Ok(space)
    }

    /// Allocate a user address space sharing the kernel half of
    /// `kernel_root`.
    ///
    /// PML4 entries 256..512 are copied so every kernel mapping stays
    /// visible; the lower half starts empty.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] when no frame is available for the PML4.
    pub fn new_user(
        mapper: &'m M,
        frames: &mut impl FrameAlloc,
        kernel_root: PhysAddr,
    ) -> Result<Self, VmmError> {
        let space = Self::new(mapper, frames)?;
        let src: &PageTable = space.table_mut(kernel_root);
        let dst = space.table_mut(space.root);
        for i in KERNEL_HALF_START..ENTRIES_PER_TABLE {
            dst.set_entry(i, src.entry(i));
        }
        Ok(space)
    }

    /// Physical base of the PML4 (the value CR3 takes).
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    /// Map one 4 KiB page `va → pa`.
    ///
    /// Intermediate tables are allocated (zeroed) on demand with
    /// `Present | Writable`, plus `User` when the leaf is user-accessible.
    ///
    /// # Errors
    /// - [`VmmError::Invalid`] — misaligned or non-canonical address, or the
    ///   walk hits an existing large-page leaf (this backend never shatters
    ///   large pages).
    /// - [`VmmError::Unsupported`] — flag combination needs the PAT.
    /// - [`VmmError::OutOfMemory`] — intermediate table allocation failed.
    /// - [`VmmError::Busy`] — the leaf entry is already present; the
    ///   existing mapping is left intact.
    pub fn map_page(
        &mut self,
        frames: &mut impl FrameAlloc,
        va: VirtAddr,
        pa: PhysAddr,
        flags: MemFlags,
    ) -> Result<(), VmmError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() || !va.is_canonical() {
            return Err(VmmError::Invalid);
        }
        let template = translate_flags(flags)?;
        let user = flags.contains(MemFlags::USER);

        let (i4, i3, i2, i1) = split_indices(va);
        let pdpt = self.ensure_next(frames, self.root, i4, user)?;
        let pd = self.ensure_next(frames, pdpt, i3, user)?;
        let pt = self.ensure_next(frames, pd, i2, user)?;

        let table = self.table_mut(pt);
        if table.entry(i1).present() {
            return Err(VmmError::Busy);
        }
        table.set_entry(i1, template.with_frame(pa));
        Ok(())
    }

    /// Map `count` consecutive 4 KiB pages starting at `va → pa`.
    ///
    /// All-or-nothing: if page `i` fails, pages `[0, i)` are unmapped again
    /// before the error is returned. Intermediate tables created along the
    /// way are kept (they are reclaimed at teardown).
    ///
    /// # Errors
    /// As [`map_page`](Self::map_page).
    pub fn map_pages(
        &mut self,
        frames: &mut impl FrameAlloc,
        va: VirtAddr,
        pa: PhysAddr,
        count: usize,
        flags: MemFlags,
    ) -> Result<(), VmmError> {
        for i in 0..count {
            let curr_va = va + (i as u64) * PAGE_SIZE;
            let curr_pa = pa + (i as u64) * PAGE_SIZE;
            if let Err(err) = self.map_page(frames, curr_va, curr_pa, flags) {
                for j in 0..i {
                    let rb_va = va + (j as u64) * PAGE_SIZE;
                    let _ = self.unmap_page(rb_va);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Unmap one 4 KiB page.
    ///
    /// Intermediate tables are not freed here; they are reclaimed when the
    /// space is destroyed.
    ///
    /// # Errors
    /// - [`VmmError::NoMap`] — no present 4 KiB mapping at `va`.
    /// - [`VmmError::Invalid`] — `va` is covered by a large-page leaf.
    pub fn unmap_page(&mut self, va: VirtAddr) -> Result<(), VmmError> {
        match self.walk(va) {
            Walk::Pte { pt, index } if pt.entry(index).present() => {
                pt.set_entry(index, PageTableEntry::zero());
                Ok(())
            }
            Walk::Pte { .. } | Walk::Missing => Err(VmmError::NoMap),
            Walk::Leaf1G(_) | Walk::Leaf2M(_) => Err(VmmError::Invalid),
        }
    }

    /// Unmap `count` consecutive 4 KiB pages.
    ///
    /// Pages are processed in order; the first failure stops the loop and
    /// is returned (already-unmapped predecessors stay unmapped).
    ///
    /// # Errors
    /// As [`unmap_page`](Self::unmap_page).
    pub fn unmap_pages(&mut self, va: VirtAddr, count: usize) -> Result<(), VmmError> {
        for i in 0..count {
            self.unmap_page(va + (i as u64) * PAGE_SIZE)?;
        }
        Ok(())
    }

    /// Translate `va` to the physical address it maps to, if any.
    ///
    /// Handles 1 GiB and 2 MiB leaves by composing the large-page base with
    /// the matching in-page offset.
    #[must_use]
    pub fn resolve(&self, va: VirtAddr) -> Option<PhysAddr> {
        match self.walk(va) {
            Walk::Leaf1G(e) => Some(e.frame_1g() + (va.as_u64() & 0x3FFF_FFFF)),
            Walk::Leaf2M(e) => Some(e.frame_2m() + (va.as_u64() & 0x001F_FFFF)),
            Walk::Pte { pt, index } => {
                let e = pt.entry(index);
                e.present().then(|| e.frame() + va.page_offset())
            }
            Walk::Missing => None,
        }
    }

    /// Tear the space down, returning every **lower-half** page-table frame
    /// (PDPT/PD/PT) and finally the PML4 itself to `frames`.
    ///
    /// Data frames referenced by leaf entries are *not* freed; their
    /// ownership stays with whoever mapped them. Kernel-half subtrees are
    /// shared with the kernel space and are left untouched.
    pub fn destroy_into(self, frames: &mut impl FrameAlloc) {
        let pml4: &PageTable = self.table_mut(self.root);
        for i4 in 0..KERNEL_HALF_START {
            let e4 = pml4.entry(i4);
            if !e4.present() {
                continue;
            }
            let pdpt: &PageTable = self.table_mut(e4.frame());
            for i3 in 0..ENTRIES_PER_TABLE {
                let e3 = pdpt.entry(i3);
                if !e3.present() || e3.page_size() {
                    continue;
                }
                let pd: &PageTable = self.table_mut(e3.frame());
                for i2 in 0..ENTRIES_PER_TABLE {
                    let e2 = pd.entry(i2);
                    if e2.present() && !e2.page_size() {
                        frames.free_frame(e2.frame());
                    }
                }
                frames.free_frame(e3.frame());
            }
            frames.free_frame(e4.frame());
        }
        frames.free_frame(self.root);
    }

    /// Borrow the table at `pa` through the mapper.
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, pa: PhysAddr) -> &'m mut PageTable {
        // SAFETY: `pa` is a table frame owned by this tree (or the shared
        // kernel half) and the mapper covers it writable.
        unsafe { self.mapper.phys_to_mut::<PageTable>(pa) }
    }

    /// Walk the present chain at `va` without allocating.
    fn walk(&self, va: VirtAddr) -> Walk<'m> {
        let (i4, i3, i2, i1) = split_indices(va);

        let pml4 = self.table_mut(self.root);
        let e4 = pml4.entry(i4);
        if !e4.present() {
            return Walk::Missing;
        }

        let pdpt = self.table_mut(e4.frame());
        let e3 = pdpt.entry(i3);
        if !e3.present() {
            return Walk::Missing;
        }
        if e3.page_size() {
            return Walk::Leaf1G(e3);
        }

        let pd = self.table_mut(e3.frame());
        let e2 = pd.entry(i2);
        if !e2.present() {
            return Walk::Missing;
        }
        if e2.page_size() {
            return Walk::Leaf2M(e2);
        }

        let pt = self.table_mut(e2.frame());
        Walk::Pte { pt, index: i1 }
    }

    /// Ensure `table[index]` refers to a next-level table; allocate a
    /// zeroed one when absent. Returns the child's physical base.
    ///
    /// Existing entries gain the `User` bit when `user` is set so a CPL-3
    /// walk can traverse down to a user leaf.
    fn ensure_next(
        &self,
        frames: &mut impl FrameAlloc,
        table_pa: PhysAddr,
        index: usize,
        user: bool,
    ) -> Result<PhysAddr, VmmError> {
        let table = self.table_mut(table_pa);
        let entry = table.entry(index);

        if entry.present() {
            if entry.page_size() {
                return Err(VmmError::Invalid);
            }
            if user && !entry.user() {
                table.set_entry(index, entry.with_user(true));
            }
            return Ok(entry.frame());
        }

        let frame = frames.alloc_frame().ok_or(VmmError::OutOfMemory)?;
        self.table_mut(frame).zero();
        table.set_entry(
            index,
            PageTableEntry::zero()
                .with_present(true)
                .with_writable(true)
                .with_user(user)
                .with_frame(frame),
        );
        Ok(frame)
    }
}
