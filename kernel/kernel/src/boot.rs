//! # Limine Boot Protocol Interface
//!
//! The request statics Limine scans for at boot, plus typed accessors over
//! the responses. Requests live in their own link section, bracketed by
//! the protocol's start/end markers (see `linker.ld`).

use kernel_addr::VirtAddr;
use kernel_bootinfo::{FramebufferInfo, MemoryMap};
use limine::BaseRevision;
use limine::request::{
    FramebufferRequest, HhdmRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker,
};

#[used]
#[unsafe(link_section = ".limine_requests_start")]
static START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

/// Protocol revision this kernel speaks.
#[used]
#[unsafe(link_section = ".limine_requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests_end")]
static END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// Whether the bootloader understood our base revision.
pub fn base_revision_supported() -> bool {
    BASE_REVISION.is_supported()
}

/// The higher-half direct-map offset.
///
/// # Panics
/// When Limine did not answer the HHDM request (boot protocol violation).
pub fn hhdm_offset() -> u64 {
    HHDM_REQUEST
        .get_response()
        .expect("limine: no HHDM response")
        .offset()
}

/// The validated physical memory map.
///
/// # Panics
/// When Limine did not answer the memory-map request.
pub fn memory_map() -> MemoryMap {
    let entries = MEMORY_MAP_REQUEST
        .get_response()
        .expect("limine: no memory map response")
        .entries();
    MemoryMap::from_limine(entries)
}

/// The first framebuffer, if the bootloader set one up.
pub fn framebuffer() -> Option<FramebufferInfo> {
    let response = FRAMEBUFFER_REQUEST.get_response()?;
    let fb = response.framebuffers().next()?;
    Some(FramebufferInfo {
        address: VirtAddr::new(fb.addr() as u64),
        width: fb.width(),
        height: fb.height(),
        pitch: fb.pitch(),
        bpp: fb.bpp(),
    })
}
