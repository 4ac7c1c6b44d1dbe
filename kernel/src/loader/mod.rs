//! Executable loading.
//!
//! A dispatch layer sniffs the image magic and hands off to the
//! per-format parser (ELF64, PE32+, Mach-O 64, a.out). Parsers are
//! pure: they validate bounds and produce a [`LoadedImage`] describing
//! segments relative to a zero image base. `spawn_from_file` then
//! allocates a guarded, zero-filled image, copies the segments, and
//! creates the process at the translated entry point. Any failure
//! releases everything; the caller either gets a PID or nothing.

pub mod aout;
pub mod elf;
pub mod macho;
pub mod pe;

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult, LoaderError};
use crate::process::{Pid, Privilege, ProcFlags};

/// Default cap on executable file size.
pub const MAX_FILE_SIZE: usize = 4 * 1024 * 1024;

/// Default cap on in-memory image size.
pub const MAX_IMAGE_SIZE: usize = 16 * 1024 * 1024;

/// Supported executable formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecFormat {
    Elf64,
    Pe32Plus,
    MachO64,
    Aout,
}

/// Identify an image by its leading magic.
pub fn detect(data: &[u8]) -> Option<ExecFormat> {
    if data.len() < 4 {
        return None;
    }
    if data[0..4] == [0x7F, b'E', b'L', b'F'] {
        return Some(ExecFormat::Elf64);
    }
    if data[0..2] == [b'M', b'Z'] {
        return Some(ExecFormat::Pe32Plus);
    }
    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic == 0xFEED_FACF {
        return Some(ExecFormat::MachO64);
    }
    if matches!(magic & 0xFFFF, 0o407 | 0o410 | 0o413 | 0o314) {
        return Some(ExecFormat::Aout);
    }
    None
}

/// Loading parameters.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub privilege: Privilege,
    pub flags: ProcFlags,
    pub max_file: usize,
    pub max_memory: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            privilege: Privilege::Normal,
            flags: ProcFlags::empty(),
            max_file: MAX_FILE_SIZE,
            max_memory: MAX_IMAGE_SIZE,
        }
    }
}

/// One loadable piece: bytes `file_start..file_start + file_len` of
/// the file land at `mem_offset` within the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub file_start: usize,
    pub file_len: usize,
    pub mem_offset: usize,
    /// Total in-memory size; the tail past `file_len` stays zero (BSS).
    pub mem_len: usize,
}

/// A parsed, validated image, rebased to zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub format: ExecFormat,
    pub image_size: usize,
    pub entry_offset: usize,
    pub segments: Vec<Segment>,
}

impl LoadedImage {
    /// Shared final checks every parser funnels through.
    pub(crate) fn validate(self, file_len: usize, max_memory: usize) -> Result<Self, LoaderError> {
        if self.image_size == 0 || self.segments.is_empty() {
            return Err(LoaderError::NoEntry);
        }
        if self.image_size > max_memory {
            return Err(LoaderError::TooLarge);
        }
        if self.entry_offset >= self.image_size {
            return Err(LoaderError::NoEntry);
        }
        for seg in &self.segments {
            let file_end = seg
                .file_start
                .checked_add(seg.file_len)
                .ok_or(LoaderError::Truncated)?;
            if file_end > file_len {
                return Err(LoaderError::Truncated);
            }
            if seg.file_len > seg.mem_len {
                return Err(LoaderError::Truncated);
            }
            let mem_end = seg
                .mem_offset
                .checked_add(seg.mem_len)
                .ok_or(LoaderError::TooLarge)?;
            if mem_end > self.image_size {
                return Err(LoaderError::TooLarge);
            }
        }
        Ok(self)
    }
}

/// Parse an image of any supported format.
pub fn parse(data: &[u8], opts: &LoadOptions) -> Result<LoadedImage, LoaderError> {
    if data.len() > opts.max_file {
        return Err(LoaderError::TooLarge);
    }
    match detect(data).ok_or(LoaderError::UnknownFormat)? {
        ExecFormat::Elf64 => elf::parse(data, opts),
        ExecFormat::Pe32Plus => pe::parse(data, opts),
        ExecFormat::MachO64 => macho::parse(data, opts),
        ExecFormat::Aout => aout::parse(data, opts),
    }
}

/// Load `path` and create a process from it.
///
/// Privilege escalation is refused up front; downgrades are silent.
/// Internally this is a typed result — the raw "0 on failure" rule of
/// the syscall ABI is applied at that boundary, not here.
pub fn spawn_from_file(path: &str, opts: &LoadOptions) -> KernelResult<Pid> {
    if opts.privilege == Privilege::System
        && crate::sched::current_privilege() != Privilege::System
    {
        return Err(KernelError::PermissionDenied {
            operation: "load SYSTEM executable",
        });
    }

    let data = crate::fs::read_file(path).map_err(KernelError::Fs)?;
    if data.len() > opts.max_file {
        return Err(LoaderError::TooLarge.into());
    }
    let image = parse(&data, opts)?;

    let name = path.rsplit('/').next().unwrap_or(path);
    spawn_image(name, &data, &image, opts)
}

/// Materialize a parsed image and start the process.
fn spawn_image(
    name: &str,
    data: &[u8],
    image: &LoadedImage,
    opts: &LoadOptions,
) -> KernelResult<Pid> {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    let base = crate::mm::vmm::KERNEL_VMM
        .lock()
        .alloc_with_guards(image.image_size)
        .map_err(KernelError::Vm)?;

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let base = {
        let buf = alloc::vec![0u8; image.image_size].leak();
        crate::mm::VirtualAddress::new(buf.as_ptr() as u64)
    };

    // Copy each loadable segment; the allocation is already zeroed, so
    // BSS tails need nothing.
    for seg in &image.segments {
        // SAFETY: mem_offset + mem_len <= image_size was validated, and
        // base points at image_size writable bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(seg.file_start),
                (base.as_u64() as *mut u8).add(seg.mem_offset),
                seg.file_len,
            );
        }
    }

    let entry = base.as_u64() + image.entry_offset as u64;
    match crate::sched::spawn(
        name,
        entry,
        opts.privilege,
        opts.flags,
        Some((base, image.image_size)),
    ) {
        Ok(pid) => {
            log::info!(
                "loaded {:?} image '{}': {} bytes, entry +{:#x}, pid {}",
                image.format,
                name,
                image.image_size,
                image.entry_offset,
                pid
            );
            Ok(pid)
        }
        Err(e) => {
            // Partial failure releases the image allocation.
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            {
                let _ = crate::mm::vmm::KERNEL_VMM
                    .lock()
                    .free_with_guards(base, image.image_size);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_magics() {
        assert_eq!(detect(&[0x7F, b'E', b'L', b'F', 0, 0]), Some(ExecFormat::Elf64));
        assert_eq!(detect(b"MZ\x90\x00"), Some(ExecFormat::Pe32Plus));
        assert_eq!(
            detect(&0xFEED_FACFu32.to_le_bytes()),
            Some(ExecFormat::MachO64)
        );
        assert_eq!(detect(&0o407u32.to_le_bytes()), Some(ExecFormat::Aout));
        assert_eq!(detect(&0o413u32.to_le_bytes()), Some(ExecFormat::Aout));
        assert_eq!(detect(b"\x00\x00\x00\x00"), None);
        assert_eq!(detect(b"EL"), None);
    }

    #[test]
    fn test_validate_rejects_overflows() {
        let img = LoadedImage {
            format: ExecFormat::Elf64,
            image_size: 0x1000,
            entry_offset: 0,
            segments: alloc::vec![Segment {
                file_start: usize::MAX - 2,
                file_len: 16,
                mem_offset: 0,
                mem_len: 16,
            }],
        };
        assert_eq!(img.validate(64, MAX_IMAGE_SIZE), Err(LoaderError::Truncated));
    }

    #[test]
    fn test_validate_entry_inside_image() {
        let img = LoadedImage {
            format: ExecFormat::Elf64,
            image_size: 0x1000,
            entry_offset: 0x1000,
            segments: alloc::vec![Segment {
                file_start: 0,
                file_len: 16,
                mem_offset: 0,
                mem_len: 16,
            }],
        };
        assert_eq!(img.validate(64, MAX_IMAGE_SIZE), Err(LoaderError::NoEntry));
    }

    #[test]
    fn test_parse_size_cap() {
        let opts = LoadOptions {
            max_file: 16,
            ..Default::default()
        };
        let data = alloc::vec![0u8; 32];
        assert_eq!(parse(&data, &opts), Err(LoaderError::TooLarge));
    }

    #[test]
    fn test_spawn_from_file_end_to_end() {
        use alloc::sync::Arc;

        // A dedicated mount keeps this independent of other tests.
        crate::fs::mount("/loader-test", Arc::new(crate::fs::ramfs::RamFs::new())).unwrap();

        // exit(7): mov rax, 60; mov rdi, 7; int 0x80
        let code = [
            0x48, 0xC7, 0xC0, 0x3C, 0x00, 0x00, 0x00, 0x48, 0xC7, 0xC7, 0x07, 0x00, 0x00,
            0x00, 0xCD, 0x80,
        ];
        let image = elf::test_support::ElfBuilder::new(0x40_0000)
            .segment(0x40_0000, &code, code.len())
            .build();
        crate::fs::create_file("/loader-test/init.elf").unwrap();
        crate::fs::write("/loader-test/init.elf", 0, &image).unwrap();

        let pid = spawn_from_file("/loader-test/init.elf", &LoadOptions::default()).unwrap();

        let table = crate::process::PROCESS_TABLE.lock();
        let p = table.get(pid).expect("process exists");
        assert_eq!(p.name, "init.elf");
        let (base, size) = p.image.expect("image recorded");
        assert_eq!(size, code.len());
        // The segment bytes were copied to the image base, and the
        // entry points at them.
        assert_eq!(p.context.rip, base.as_u64());
        // SAFETY: host image backing is a leaked buffer of `size` bytes.
        let copied =
            unsafe { core::slice::from_raw_parts(base.as_u64() as *const u8, size) };
        assert_eq!(copied, &code);
    }

    #[test]
    fn test_spawn_missing_file_fails() {
        assert!(spawn_from_file("/no-mount-here/prog", &LoadOptions::default()).is_err());
    }
}
