use core::fmt;

use kernel_addr::{PAGE_SIZE, PhysAddr, align_down, align_up};
use limine::memory_map::{Entry, EntryType};
use log::warn;

/// x86_64 decodes at most 52 physical address bits.
const MAX_PHYS_ADDR: u64 = (1 << 52) - 1;

/// Upper bound on memory-map entries we keep. Firmware maps on real
/// hardware run a few dozen entries; anything beyond this is truncated
/// with a warning.
pub const MAX_REGIONS: usize = 128;

/// Classification of a physical memory region, 1:1 with the Limine memory
/// map types plus [`Mmio`](RegionKind::Mmio) for device windows discovered
/// outside the map.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum RegionKind {
    /// Free RAM the kernel may allocate from.
    Usable,
    /// Firmware/hardware reserved; never touched.
    #[default]
    Reserved,
    /// ACPI tables; reclaimable after they have been parsed.
    AcpiReclaimable,
    /// ACPI Non-Volatile Storage; never reclaimed.
    AcpiNvs,
    /// Known-defective RAM.
    Bad,
    /// Bootloader structures; reclaimable once the kernel owns boot data.
    BootloaderReclaimable,
    /// The kernel image and boot modules.
    KernelAndModules,
    /// The linear framebuffer.
    Framebuffer,
    /// Memory-mapped device window.
    Mmio,
}

impl RegionKind {
    /// Kinds the physical allocator may eventually hand out as free frames.
    #[must_use]
    pub const fn is_reclaimable(self) -> bool {
        matches!(
            self,
            Self::Usable | Self::BootloaderReclaimable | Self::AcpiReclaimable
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usable => "usable",
            Self::Reserved => "reserved",
            Self::AcpiReclaimable => "acpi-reclaimable",
            Self::AcpiNvs => "acpi-nvs",
            Self::Bad => "bad",
            Self::BootloaderReclaimable => "bootloader-reclaimable",
            Self::KernelAndModules => "kernel+modules",
            Self::Framebuffer => "framebuffer",
            Self::Mmio => "mmio",
        }
    }
}

impl From<EntryType> for RegionKind {
    fn from(ty: EntryType) -> Self {
        match ty {
            EntryType::USABLE => Self::Usable,
            EntryType::RESERVED => Self::Reserved,
            EntryType::ACPI_RECLAIMABLE => Self::AcpiReclaimable,
            EntryType::ACPI_NVS => Self::AcpiNvs,
            EntryType::BAD_MEMORY => Self::Bad,
            EntryType::BOOTLOADER_RECLAIMABLE => Self::BootloaderReclaimable,
            EntryType::EXECUTABLE_AND_MODULES => Self::KernelAndModules,
            EntryType::FRAMEBUFFER => Self::Framebuffer,
            // Unknown types are treated as reserved.
            _ => Self::Reserved,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One contiguous physical region from the bootloader memory map.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct MemoryRegion {
    /// First byte of the region.
    pub base: PhysAddr,
    /// Length in bytes. Regions as handed over may be byte-granular; use
    /// [`aligned_interior`](Self::aligned_interior) for page math.
    pub length: u64,
    /// What the region holds.
    pub kind: RegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: PhysAddr, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    /// Exclusive end of the region.
    #[must_use]
    pub fn end(&self) -> PhysAddr {
        self.base + self.length
    }

    /// Whether base + length stays within the architectural limits.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.length == 0 {
            return false;
        }
        let Some(end) = self.base.checked_add(self.length) else {
            return false;
        };
        end.as_u64() - 1 <= MAX_PHYS_ADDR
    }

    /// The page-aligned interior `[align_up(base), align_down(end))`.
    ///
    /// Partially covered edge pages are excluded, so a frame is only ever
    /// reported when the region owns all of it. Returns `None` when no
    /// whole page fits.
    #[must_use]
    pub fn aligned_interior(&self) -> Option<(PhysAddr, PhysAddr)> {
        let start = align_up(self.base.as_u64(), PAGE_SIZE);
        let end = align_down(self.base.as_u64() + self.length, PAGE_SIZE);
        (start < end).then(|| (PhysAddr::new(start), PhysAddr::new(end)))
    }
}

/// Aggregate numbers over a [`MemoryMap`], computed once at conversion.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct MemoryStats {
    /// Sum of all region lengths.
    pub total_bytes: u64,
    /// Sum of reclaimable region lengths (see [`RegionKind::is_reclaimable`]).
    pub usable_bytes: u64,
    /// Sum of everything else.
    pub reserved_bytes: u64,
    /// Exclusive end of the highest region.
    pub highest_addr: PhysAddr,
    /// Length of the largest `Usable` region.
    pub largest_usable: u64,
}

/// The validated bootloader memory map: a bounded, base-ordered set of
/// non-overlapping regions.
pub struct MemoryMap {
    regions: [MemoryRegion; MAX_REGIONS],
    len: usize,
    stats: MemoryStats,
}

impl MemoryMap {
    /// An empty map.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            regions: [MemoryRegion {
                base: PhysAddr::zero(),
                length: 0,
                kind: RegionKind::Reserved,
            }; MAX_REGIONS],
            len: 0,
            stats: MemoryStats {
                total_bytes: 0,
                usable_bytes: 0,
                reserved_bytes: 0,
                highest_addr: PhysAddr::zero(),
                largest_usable: 0,
            },
        }
    }

    /// Build a map from raw Limine entries, dropping invalid ones.
    #[must_use]
    pub fn from_limine(entries: &[&Entry]) -> Self {
        let mut map = Self::empty();
        for entry in entries {
            let region = MemoryRegion::new(
                PhysAddr::new(entry.base),
                entry.length,
                RegionKind::from(entry.entry_type),
            );
            map.push(region);
        }
        map
    }

    /// Build a map from already-converted regions (test and early-boot use).
    #[must_use]
    pub fn from_regions(regions: &[MemoryRegion]) -> Self {
        let mut map = Self::empty();
        for &region in regions {
            map.push(region);
        }
        map
    }

    /// Append one region, keeping the aggregate stats current.
    ///
    /// Invalid (empty, overflowing, out-of-range) regions are dropped with
    /// a warning; so are regions beyond [`MAX_REGIONS`].
    pub fn push(&mut self, region: MemoryRegion) {
        if !region.is_valid() {
            warn!(
                "memmap: dropping invalid region {} + {:#x} ({})",
                region.base, region.length, region.kind
            );
            return;
        }
        if self.len == MAX_REGIONS {
            warn!("memmap: too many regions, dropping {}", region.base);
            return;
        }

        self.regions[self.len] = region;
        self.len += 1;

        self.stats.total_bytes += region.length;
        if region.kind.is_reclaimable() {
            self.stats.usable_bytes += region.length;
        } else {
            self.stats.reserved_bytes += region.length;
        }
        if region.kind == RegionKind::Usable && region.length > self.stats.largest_usable {
            self.stats.largest_usable = region.length;
        }
        if region.end() > self.stats.highest_addr {
            self.stats.highest_addr = region.end();
        }
    }

    /// The regions, in bootloader order (ascending base).
    #[must_use]
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions[..self.len]
    }

    #[must_use]
    pub fn iter(&self) -> core::slice::Iter<'_, MemoryRegion> {
        self.regions().iter()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn stats(&self) -> &MemoryStats {
        &self.stats
    }
}

impl<'a> IntoIterator for &'a MemoryMap {
    type Item = &'a MemoryRegion;
    type IntoIter = core::slice::Iter<'a, MemoryRegion>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
