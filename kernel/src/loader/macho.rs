//! Mach-O 64 image parsing.
//!
//! Accepts `MH_MAGIC_64` x86-64 executables. `LC_SEGMENT_64` commands
//! become segments (skipping `__PAGEZERO`); the entry point comes from
//! `LC_MAIN` (an offset) or `LC_UNIXTHREAD` (an absolute RIP in the
//! thread state).

use alloc::vec::Vec;

use crate::error::LoaderError;

use super::{ExecFormat, LoadOptions, LoadedImage, Segment};

const MH_MAGIC_64: u32 = 0xFEED_FACF;
const CPU_TYPE_X86_64: u32 = 0x0100_0007;
const MH_EXECUTE: u32 = 2;

const LC_UNIXTHREAD: u32 = 0x5;
const LC_SEGMENT_64: u32 = 0x19;
const LC_MAIN: u32 = 0x8000_0028;

const HEADER_SIZE: usize = 32;
const X86_THREAD_STATE64: u32 = 4;
/// Index of RIP within the x86_64 thread state GPR array.
const THREAD_RIP_INDEX: usize = 16;

fn u32_at(b: &[u8], o: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(o..o + 4)?.try_into().ok()?))
}

fn u64_at(b: &[u8], o: usize) -> Option<u64> {
    Some(u64::from_le_bytes(b.get(o..o + 8)?.try_into().ok()?))
}

pub fn parse(data: &[u8], opts: &LoadOptions) -> Result<LoadedImage, LoaderError> {
    if u32_at(data, 0) != Some(MH_MAGIC_64) {
        return Err(LoaderError::Truncated);
    }
    if u32_at(data, 4) != Some(CPU_TYPE_X86_64) {
        return Err(LoaderError::WrongArch);
    }
    if u32_at(data, 12) != Some(MH_EXECUTE) {
        return Err(LoaderError::WrongArch);
    }
    let ncmds = u32_at(data, 16).ok_or(LoaderError::Truncated)? as usize;
    let sizeofcmds = u32_at(data, 20).ok_or(LoaderError::Truncated)? as usize;
    if HEADER_SIZE + sizeofcmds > data.len() {
        return Err(LoaderError::Truncated);
    }

    struct RawSeg {
        vmaddr: u64,
        vmsize: u64,
        fileoff: usize,
        filesize: usize,
    }

    let mut raw_segs: Vec<RawSeg> = Vec::new();
    let mut entry_vmaddr: Option<u64> = None;
    let mut entry_fileoff: Option<u64> = None;

    let mut off = HEADER_SIZE;
    for _ in 0..ncmds {
        let cmd = u32_at(data, off).ok_or(LoaderError::Truncated)?;
        let cmdsize = u32_at(data, off + 4).ok_or(LoaderError::Truncated)? as usize;
        if cmdsize < 8 || off + cmdsize > data.len() {
            return Err(LoaderError::Truncated);
        }
        match cmd {
            LC_SEGMENT_64 => {
                if cmdsize < 72 {
                    return Err(LoaderError::Truncated);
                }
                let name = &data[off + 8..off + 24];
                let vmaddr = u64_at(data, off + 24).ok_or(LoaderError::Truncated)?;
                let vmsize = u64_at(data, off + 32).ok_or(LoaderError::Truncated)?;
                let fileoff = u64_at(data, off + 40).ok_or(LoaderError::Truncated)? as usize;
                let filesize = u64_at(data, off + 48).ok_or(LoaderError::Truncated)? as usize;
                // __PAGEZERO is the null-guard mapping, not content.
                if !name.starts_with(b"__PAGEZERO") && vmsize > 0 {
                    raw_segs.push(RawSeg {
                        vmaddr,
                        vmsize,
                        fileoff,
                        filesize,
                    });
                }
            }
            LC_MAIN => {
                entry_fileoff = Some(u64_at(data, off + 8).ok_or(LoaderError::Truncated)?);
            }
            LC_UNIXTHREAD => {
                // flavor, count, then the GPR state.
                let flavor = u32_at(data, off + 8).ok_or(LoaderError::Truncated)?;
                if flavor == X86_THREAD_STATE64 {
                    let rip_off = off + 16 + THREAD_RIP_INDEX * 8;
                    entry_vmaddr = Some(u64_at(data, rip_off).ok_or(LoaderError::Truncated)?);
                }
            }
            _ => {}
        }
        off += cmdsize;
    }

    if raw_segs.is_empty() {
        return Err(LoaderError::NoEntry);
    }
    let min_vmaddr = raw_segs.iter().map(|s| s.vmaddr).min().unwrap();
    let max_end = raw_segs
        .iter()
        .map(|s| s.vmaddr.checked_add(s.vmsize).ok_or(LoaderError::TooLarge))
        .try_fold(0u64, |acc, e| e.map(|v| acc.max(v)))?;
    let image_size = (max_end - min_vmaddr) as usize;

    let entry_offset = if let Some(vmaddr) = entry_vmaddr {
        if vmaddr < min_vmaddr || vmaddr >= max_end {
            return Err(LoaderError::NoEntry);
        }
        (vmaddr - min_vmaddr) as usize
    } else if let Some(fileoff) = entry_fileoff {
        // LC_MAIN gives a file offset; translate through the segment
        // that contains it.
        let seg = raw_segs
            .iter()
            .find(|s| {
                (fileoff as usize) >= s.fileoff && (fileoff as usize) < s.fileoff + s.filesize
            })
            .ok_or(LoaderError::NoEntry)?;
        (seg.vmaddr - min_vmaddr) as usize + (fileoff as usize - seg.fileoff)
    } else {
        return Err(LoaderError::NoEntry);
    };

    let segments = raw_segs
        .iter()
        .map(|s| Segment {
            file_start: s.fileoff,
            file_len: s.filesize,
            mem_offset: (s.vmaddr - min_vmaddr) as usize,
            mem_len: s.vmsize as usize,
        })
        .collect();

    LoadedImage {
        format: ExecFormat::MachO64,
        image_size,
        entry_offset,
        segments,
    }
    .validate(data.len(), opts.max_memory)
}
