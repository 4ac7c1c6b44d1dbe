//! Boot protocol support.
//!
//! VoidFrame boots via Multiboot2: the header below is what the
//! bootloader scans for, and `multiboot2` parses the info structure the
//! bootloader hands back.

pub mod multiboot2;

/// Multiboot2 header, placed early in the image by the linker script.
///
/// Layout: magic, architecture (0 = i386/x86), header length, checksum,
/// then a terminating end tag (type 0, flags 0, size 8).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[repr(C, align(8))]
#[allow(dead_code)] // read by the bootloader, not by Rust
struct Multiboot2Header([u32; 6]);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[link_section = ".multiboot2_header"]
#[used]
static MULTIBOOT2_HEADER: Multiboot2Header = {
    const MAGIC: u32 = 0xE852_50D6;
    const ARCH: u32 = 0;
    const LEN: u32 = 24;
    const CHECKSUM: u32 = (0u32)
        .wrapping_sub(MAGIC)
        .wrapping_sub(ARCH)
        .wrapping_sub(LEN);
    Multiboot2Header([MAGIC, ARCH, LEN, CHECKSUM, 0, 8])
};
