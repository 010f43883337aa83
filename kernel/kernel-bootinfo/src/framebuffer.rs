use kernel_addr::VirtAddr;

/// Linear framebuffer description, as handed over by the bootloader.
///
/// The address is already virtual: Limine maps the framebuffer into the
/// higher half before transferring control.
#[derive(Debug, Copy, Clone)]
pub struct FramebufferInfo {
    /// First pixel of the framebuffer.
    pub address: VirtAddr,
    /// Visible width in pixels.
    pub width: u64,
    /// Visible height in pixels.
    pub height: u64,
    /// Bytes per scanline; may exceed `width * bpp / 8` due to padding.
    pub pitch: u64,
    /// Bits per pixel (32 for the usual XRGB8888 modes).
    pub bpp: u16,
}

impl FramebufferInfo {
    /// Total size of the pixel buffer in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.pitch * self.height
    }
}
