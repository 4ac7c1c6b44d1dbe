//! Multiboot2 boot-information parsing.
//!
//! The bootloader leaves a tag list in memory: a `total_size`/`reserved`
//! header followed by 8-byte-aligned tags. The kernel consumes the
//! memory map (type 6), modules (type 3), the command line (type 1), and
//! framebuffer info (type 8); everything else is skipped. Parsing works
//! on a byte slice with explicit little-endian reads, so the same code
//! runs against synthetic buffers under the host test harness.

use crate::error::{KernelError, KernelResult};

/// Tag type numbers the kernel cares about.
mod tag_type {
    pub const END: u32 = 0;
    pub const CMDLINE: u32 = 1;
    pub const MODULE: u32 = 3;
    pub const MEMORY_MAP: u32 = 6;
    pub const FRAMEBUFFER: u32 = 8;
}

/// Size of one memory-map entry on the wire.
const MMAP_ENTRY_SIZE: usize = 24;

/// Classification of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Usable RAM.
    Available,
    /// ACPI tables, reclaimable once parsed.
    AcpiReclaimable,
    /// Must be preserved across hibernation.
    ReservedHibernate,
    /// Known-bad RAM.
    Defective,
    /// Anything else.
    Reserved,
}

impl MemoryRegionKind {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Available,
            3 => Self::AcpiReclaimable,
            4 => Self::ReservedHibernate,
            5 => Self::Defective,
            _ => Self::Reserved,
        }
    }
}

/// One entry of the memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

/// A boot module (e.g. a ramdisk image loaded by the bootloader).
#[derive(Debug, Clone, Copy)]
pub struct BootModule<'a> {
    pub start: u64,
    pub end: u64,
    pub cmdline: &'a str,
}

/// Framebuffer description from the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
}

/// Parsed view over the boot information structure.
pub struct BootInfo<'a> {
    base: u64,
    data: &'a [u8],
}

fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(off..off + 4)?.try_into().ok()?))
}

fn read_u64(data: &[u8], off: usize) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(off..off + 8)?.try_into().ok()?))
}

fn read_cstr(data: &[u8]) -> &str {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    core::str::from_utf8(&data[..end]).unwrap_or("")
}

impl<'a> BootInfo<'a> {
    /// Parse from an in-memory buffer. The buffer must start at the
    /// `total_size` field.
    pub fn from_bytes(base: u64, data: &'a [u8]) -> KernelResult<Self> {
        let total = read_u32(data, 0).ok_or(KernelError::NotInitialized {
            subsystem: "multiboot2",
        })? as usize;
        if total < 8 || total > data.len() {
            return Err(KernelError::NotInitialized {
                subsystem: "multiboot2",
            });
        }
        Ok(Self {
            base,
            data: &data[..total],
        })
    }

    /// Wrap the physical info structure the bootloader provided.
    ///
    /// # Safety
    ///
    /// `addr` must be the physical address passed by a Multiboot2
    /// bootloader, identity-mapped and untouched since boot.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub unsafe fn from_ptr(addr: u64) -> KernelResult<Self> {
        // SAFETY: caller contract; the first word is the total size.
        let total = unsafe { core::ptr::read(addr as *const u32) } as usize;
        // SAFETY: the structure is `total` bytes long per the protocol.
        let data = unsafe { core::slice::from_raw_parts(addr as *const u8, total) };
        Self::from_bytes(addr, data)
    }

    pub fn base_addr(&self) -> u64 {
        self.base
    }

    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    /// Iterate raw tags as (type, payload-with-header).
    fn tags(&self) -> TagIter<'a> {
        TagIter {
            data: self.data,
            offset: 8,
        }
    }

    fn find_tag(&self, wanted: u32) -> Option<&'a [u8]> {
        self.tags().find(|(t, _)| *t == wanted).map(|(_, body)| body)
    }

    /// Memory map entries, empty if the tag is missing or malformed.
    pub fn memory_regions(&self) -> impl Iterator<Item = MemoryRegion> + 'a {
        let body = self.find_tag(tag_type::MEMORY_MAP);
        let (entries, entry_size) = match body {
            Some(body) => {
                let entry_size = read_u32(body, 8).unwrap_or(0) as usize;
                if entry_size < MMAP_ENTRY_SIZE || body.len() < 16 {
                    (&body[..0], MMAP_ENTRY_SIZE)
                } else {
                    (&body[16..], entry_size)
                }
            }
            None => (&[][..], MMAP_ENTRY_SIZE),
        };
        let count = if entry_size == 0 { 0 } else { entries.len() / entry_size };
        (0..count).filter_map(move |i| {
            let off = i * entry_size;
            Some(MemoryRegion {
                base: read_u64(entries, off)?,
                length: read_u64(entries, off + 8)?,
                kind: MemoryRegionKind::from_raw(read_u32(entries, off + 16)?),
            })
        })
    }

    /// Boot modules in tag order.
    pub fn modules(&self) -> impl Iterator<Item = BootModule<'a>> + 'a {
        self.tags().filter_map(|(t, body)| {
            if t != tag_type::MODULE || body.len() < 16 {
                return None;
            }
            Some(BootModule {
                start: read_u32(body, 8)? as u64,
                end: read_u32(body, 12)? as u64,
                cmdline: read_cstr(&body[16..]),
            })
        })
    }

    /// Kernel command line, if the bootloader passed one.
    pub fn cmdline(&self) -> Option<&'a str> {
        let body = self.find_tag(tag_type::CMDLINE)?;
        if body.len() < 8 {
            return None;
        }
        Some(read_cstr(&body[8..]))
    }

    /// Framebuffer info, if present.
    pub fn framebuffer(&self) -> Option<FramebufferInfo> {
        let body = self.find_tag(tag_type::FRAMEBUFFER)?;
        if body.len() < 30 {
            return None;
        }
        Some(FramebufferInfo {
            addr: read_u64(body, 8)?,
            pitch: read_u32(body, 16)?,
            width: read_u32(body, 20)?,
            height: read_u32(body, 24)?,
            bpp: *body.get(28)?,
        })
    }

    /// Total bytes of available RAM per the memory map.
    pub fn available_bytes(&self) -> u64 {
        self.memory_regions()
            .filter(|r| r.kind == MemoryRegionKind::Available)
            .map(|r| r.length)
            .sum()
    }
}

/// Iterator over (tag type, tag bytes including header).
struct TagIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for TagIter<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let ty = read_u32(self.data, self.offset)?;
        let size = read_u32(self.data, self.offset + 4)? as usize;
        if ty == tag_type::END || size < 8 {
            return None;
        }
        let start = self.offset;
        let end = start.checked_add(size)?;
        if end > self.data.len() {
            return None;
        }
        // Tags are padded to 8-byte alignment.
        self.offset = (end + 7) & !7;
        Some((ty, &self.data[start..end]))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builder for synthetic boot-information buffers.

    use alloc::vec::Vec;

    pub struct BootInfoBuilder {
        tags: Vec<u8>,
    }

    impl BootInfoBuilder {
        pub fn new() -> Self {
            Self { tags: Vec::new() }
        }

        fn push_tag(&mut self, ty: u32, body: &[u8]) {
            let size = 8 + body.len();
            self.tags.extend_from_slice(&ty.to_le_bytes());
            self.tags.extend_from_slice(&(size as u32).to_le_bytes());
            self.tags.extend_from_slice(body);
            while self.tags.len() % 8 != 0 {
                self.tags.push(0);
            }
        }

        pub fn memory_map(mut self, regions: &[(u64, u64, u32)]) -> Self {
            let mut body = Vec::new();
            body.extend_from_slice(&24u32.to_le_bytes()); // entry_size
            body.extend_from_slice(&0u32.to_le_bytes()); // entry_version
            for &(base, len, ty) in regions {
                body.extend_from_slice(&base.to_le_bytes());
                body.extend_from_slice(&len.to_le_bytes());
                body.extend_from_slice(&ty.to_le_bytes());
                body.extend_from_slice(&0u32.to_le_bytes());
            }
            self.push_tag(super::tag_type::MEMORY_MAP, &body);
            self
        }

        pub fn cmdline(mut self, line: &str) -> Self {
            let mut body = line.as_bytes().to_vec();
            body.push(0);
            self.push_tag(super::tag_type::CMDLINE, &body);
            self
        }

        pub fn module(mut self, start: u32, end: u32, name: &str) -> Self {
            let mut body = Vec::new();
            body.extend_from_slice(&start.to_le_bytes());
            body.extend_from_slice(&end.to_le_bytes());
            body.extend_from_slice(name.as_bytes());
            body.push(0);
            self.push_tag(super::tag_type::MODULE, &body);
            self
        }

        pub fn framebuffer(mut self, addr: u64, pitch: u32, w: u32, h: u32, bpp: u8) -> Self {
            let mut body = Vec::new();
            body.extend_from_slice(&addr.to_le_bytes());
            body.extend_from_slice(&pitch.to_le_bytes());
            body.extend_from_slice(&w.to_le_bytes());
            body.extend_from_slice(&h.to_le_bytes());
            body.push(bpp);
            body.push(1); // type: RGB
            body.extend_from_slice(&[0u8; 8]); // reserved + color info
            self.push_tag(super::tag_type::FRAMEBUFFER, &body);
            self
        }

        pub fn build(mut self) -> Vec<u8> {
            // End tag.
            self.tags.extend_from_slice(&0u32.to_le_bytes());
            self.tags.extend_from_slice(&8u32.to_le_bytes());
            let total = (self.tags.len() + 8) as u32;
            let mut out = Vec::new();
            out.extend_from_slice(&total.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&self.tags);
            out
        }
    }
}
