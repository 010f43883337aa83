//! # Virtual Memory Management
//!
//! x86_64 4-level paging for the kernel: typed page tables, an
//! [`AddressSpace`] mapping engine, and the global [`vmm`] singleton with
//! HHDM accessors and TLB discipline.
//!
//! ## Virtual address → physical address walk
//!
//! Each canonical 48-bit virtual address divides into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses the four 9-bit fields as indices into four levels of page
//! tables, each holding 512 × 64-bit entries:
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  physical page
//!   │        │        │       └── PTE: always a 4 KiB leaf
//!   │        │        └── PDE: PS=1 ⇒ 2 MiB leaf
//!   │        └── PDPTE: PS=1 ⇒ 1 GiB leaf
//!   └── PML4E: always points at a PDPT
//! ```
//!
//! Entries 256..512 of the PML4 form the kernel half: every user space
//! aliases the kernel's subtrees there, so kernel mappings are visible in
//! all spaces. Entries 0..256 are per-space.
//!
//! ## Testing
//!
//! Page tables are only ever touched through the [`PhysMapper`] trait, so
//! the engine runs against simulated physical memory in ordinary host
//! tests (see the test module at the bottom of this file).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod error;
mod flags;
mod mapper;
mod pte;
pub mod vmm;

pub use address_space::{AddressSpace, KERNEL_HALF_START};
pub use error::VmmError;
pub use flags::{MemFlags, translate_flags};
pub use mapper::{FrameAlloc, HhdmMapper, PhysMapper};
pub use pte::{
    ENTRIES_PER_TABLE, PHYS_ADDR_MASK, PHYS_ADDR_MASK_1G, PHYS_ADDR_MASK_2M, PageTable,
    PageTableEntry, split_indices,
};
pub use vmm::{FrameHooks, Space, VmmStats};
