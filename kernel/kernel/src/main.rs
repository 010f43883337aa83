//! # Kernel Entry Point
//!
//! Limine hands control to [`_start`]; bring-up then follows the memory
//! dependency order (boot info, physical allocator, virtual memory, heap),
//! runs a short self-test, and parks the CPU.
//!
//! On hosted targets this crate builds as an inert binary so the workspace
//! test run stays green; everything bare-metal lives behind
//! `target_os = "none"`.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![cfg_attr(not(target_os = "none"), allow(dead_code))]
#![allow(unsafe_code)]

mod boot;
mod framebuffer;
mod logger;

use kernel_addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use kernel_registers::{cpu, cpuid};
use kernel_vmem::{HhdmMapper, MemFlags, vmm};
use log::{LevelFilter, error, info, warn};

use crate::framebuffer::{Framebuffer, colors};

/// Number of boot-progress strips painted on the framebuffer.
mod strip {
    pub const PMM: u64 = 0;
    pub const VMM: u64 = 1;
    pub const HEAP: u64 = 2;
}

#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
unsafe extern "C" fn _start() -> ! {
    assert!(boot::base_revision_supported());
    kmain()
}

fn kmain() -> ! {
    logger::init(LevelFilter::Debug).expect("logger install failed");
    info!("kernel: booting");

    let mut fb = boot::framebuffer().and_then(Framebuffer::new);
    if let Some(fb) = fb.as_mut() {
        fb.clear(colors::BACKGROUND);
        info!("kernel: framebuffer {}x{}", fb.width(), fb.height());
    } else {
        warn!("kernel: no usable framebuffer");
    }

    let hhdm_offset = boot::hhdm_offset();
    let map = boot::memory_map();
    {
        let stats = map.stats();
        info!(
            "kernel: memory map: {} regions, {} MiB total, {} MiB usable",
            map.len(),
            stats.total_bytes >> 20,
            stats.usable_bytes >> 20
        );
    }

    // Bring-up in dependency order; a failure here is unrecoverable.
    let mapper = HhdmMapper::new(hhdm_offset);
    if let Err(err) = kernel_pmm::init(mapper, &map) {
        panic!("pmm: init failed: {err}");
    }
    paint(fb.as_mut(), strip::PMM);

    let hooks = vmm::FrameHooks {
        alloc: table_frame_alloc,
        free: table_frame_free,
    };
    // SAFETY: CPL0 with paging enabled; init is called exactly once.
    if let Err(err) = unsafe { vmm::init(hhdm_offset, hooks) } {
        panic!("vmm: init failed: {err}");
    }
    info!(
        "kernel: cpu decodes {} physical bits, nx {}",
        cpuid::max_phys_bits(),
        if vmm::nx_enabled() { "on" } else { "off" }
    );
    paint(fb.as_mut(), strip::VMM);

    if let Err(err) = kernel_heap::init() {
        panic!("heap: init failed: {err}");
    }
    paint(fb.as_mut(), strip::HEAP);

    memory_selftest();

    if let Ok(stats) = kernel_pmm::stats() {
        info!(
            "kernel: pmm {} free / {} total frames",
            stats.free_pages, stats.total_pages
        );
    }
    if let Ok(stats) = vmm::stats() {
        info!(
            "kernel: vmm {} pages mapped, {} unmapped, {} spaces",
            stats.pages_mapped, stats.pages_unmapped, stats.spaces_created
        );
    }
    kernel_heap::dump_info();

    info!("kernel: idle");
    loop {
        // SAFETY: CPL0.
        unsafe { cpu::hlt() };
    }
}

/// Page-table frame supplier handed to the VMM.
fn table_frame_alloc() -> Option<PhysAddr> {
    kernel_pmm::alloc_page()
}

fn table_frame_free(frame: PhysAddr) {
    if let Err(err) = kernel_pmm::free_page(frame) {
        warn!("vmm: dropped table frame {frame}: {err}");
    }
}

fn paint(fb: Option<&mut Framebuffer>, index: u64) {
    if let Some(fb) = fb {
        fb.status_strip(index, colors::OK);
    }
}

/// Exercise each allocator once and cross-check the accounting.
fn memory_selftest() {
    // Physical round trip: a freed frame is the next one handed out.
    let a = kernel_pmm::alloc_page().expect("pmm: selftest alloc");
    let b = kernel_pmm::alloc_page().expect("pmm: selftest alloc");
    kernel_pmm::free_page(a).expect("pmm: selftest free");
    let c = kernel_pmm::alloc_page().expect("pmm: selftest alloc");
    if c != a {
        error!("pmm: selftest expected low-address reuse ({a} vs {c})");
    }
    kernel_pmm::free_page(b).expect("pmm: selftest free");
    kernel_pmm::free_page(c).expect("pmm: selftest free");
    if !kernel_pmm::check_integrity() {
        error!("pmm: selftest bitmap/counter mismatch");
    }

    // Virtual round trip in the kernel space: map a scratch frame at an
    // unused higher-half address, resolve through it, tear it down.
    let scratch_va = VirtAddr::new(0xFFFF_A000_0000_0000);
    let frame = kernel_pmm::alloc_page().expect("vmm: selftest frame");
    let space = vmm::kernel_space().expect("vmm: selftest space");
    match vmm::map_pages(space, scratch_va, frame, 1, MemFlags::READ | MemFlags::WRITE) {
        Ok(()) => {
            let resolved = vmm::resolve(space, scratch_va + 0x123);
            if resolved != Ok(frame + 0x123) {
                error!("vmm: selftest resolve mismatch: {resolved:?}");
            }
            vmm::unmap_pages(space, scratch_va, 1).expect("vmm: selftest unmap");
        }
        Err(err) => error!("vmm: selftest map failed: {err}"),
    }
    kernel_pmm::free_page(frame).expect("vmm: selftest frame free");

    // Heap round trip across both routing paths.
    let small = kernel_heap::kalloc(96);
    let large = kernel_heap::kalloc(3 * PAGE_SIZE);
    if small.is_null() || large.is_null() {
        error!("heap: selftest allocation failed");
    } else {
        // SAFETY: 96 bytes were just allocated.
        unsafe { small.write_bytes(0x42, 96) };
        let grown = kernel_heap::krealloc(small, 4096);
        if grown.is_null() {
            error!("heap: selftest realloc failed");
        } else {
            kernel_heap::kfree(grown);
        }
        kernel_heap::kfree(large);
    }
    if !kernel_heap::check_integrity() {
        error!("heap: selftest integrity check failed");
    }

    info!("kernel: memory self-test complete");
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    error!("kernel panic: {info}");
    // SAFETY: CPL0; nothing to hand control back to.
    unsafe {
        cpu::cli();
        loop {
            cpu::hlt();
        }
    }
}

/// Hosted builds compile to nothing; the kernel proper only exists for the
/// bare-metal target.
#[cfg(not(target_os = "none"))]
fn main() {}
