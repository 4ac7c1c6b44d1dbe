//! ELF64 image parsing.
//!
//! Accepts x86-64 little-endian `ET_EXEC` images only. The image span
//! runs from the lowest `p_vaddr` to the highest `p_vaddr + p_memsz`
//! over the PT_LOAD segments, rebased so the lowest address is offset
//! zero.

use alloc::vec::Vec;

use crate::error::LoaderError;

use super::{ExecFormat, LoadOptions, LoadedImage, Segment};

const ELF_CLASS_64: u8 = 2;
const ELF_DATA_2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3E;
const PT_LOAD: u32 = 1;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

fn u16_at(b: &[u8], o: usize) -> u16 {
    u16::from_le_bytes(b[o..o + 2].try_into().unwrap())
}

fn u32_at(b: &[u8], o: usize) -> u32 {
    u32::from_le_bytes(b[o..o + 4].try_into().unwrap())
}

fn u64_at(b: &[u8], o: usize) -> u64 {
    u64::from_le_bytes(b[o..o + 8].try_into().unwrap())
}

pub fn parse(data: &[u8], opts: &LoadOptions) -> Result<LoadedImage, LoaderError> {
    if data.len() < EHDR_SIZE {
        return Err(LoaderError::Truncated);
    }
    if data[4] != ELF_CLASS_64 || data[5] != ELF_DATA_2LSB {
        return Err(LoaderError::WrongArch);
    }
    if u16_at(data, 16) != ET_EXEC {
        return Err(LoaderError::WrongArch);
    }
    if u16_at(data, 18) != EM_X86_64 {
        return Err(LoaderError::WrongArch);
    }

    let entry = u64_at(data, 24);
    let phoff = u64_at(data, 32) as usize;
    let phentsize = u16_at(data, 54) as usize;
    let phnum = u16_at(data, 56) as usize;
    if phnum == 0 || phentsize < PHDR_SIZE {
        return Err(LoaderError::NoEntry);
    }
    let table_end = phoff
        .checked_add(phentsize.checked_mul(phnum).ok_or(LoaderError::Truncated)?)
        .ok_or(LoaderError::Truncated)?;
    if table_end > data.len() {
        return Err(LoaderError::Truncated);
    }

    // First pass: the image span over PT_LOAD.
    let mut min_vaddr = u64::MAX;
    let mut max_end = 0u64;
    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        if u32_at(data, ph) != PT_LOAD {
            continue;
        }
        let vaddr = u64_at(data, ph + 16);
        let memsz = u64_at(data, ph + 40);
        if memsz == 0 {
            continue;
        }
        min_vaddr = min_vaddr.min(vaddr);
        max_end = max_end.max(vaddr.checked_add(memsz).ok_or(LoaderError::TooLarge)?);
    }
    if min_vaddr == u64::MAX {
        return Err(LoaderError::NoEntry);
    }
    let image_size = (max_end - min_vaddr) as usize;

    // Second pass: rebased segments with per-segment bounds checks.
    let mut segments = Vec::new();
    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        if u32_at(data, ph) != PT_LOAD {
            continue;
        }
        let offset = u64_at(data, ph + 8) as usize;
        let vaddr = u64_at(data, ph + 16);
        let filesz = u64_at(data, ph + 32) as usize;
        let memsz = u64_at(data, ph + 40) as usize;
        if memsz == 0 {
            continue;
        }
        if offset.checked_add(filesz).is_none_or(|end| end > data.len()) {
            return Err(LoaderError::Truncated);
        }
        if filesz > memsz {
            return Err(LoaderError::Truncated);
        }
        segments.push(Segment {
            file_start: offset,
            file_len: filesz,
            mem_offset: (vaddr - min_vaddr) as usize,
            mem_len: memsz,
        });
    }

    if entry < min_vaddr || entry >= max_end {
        return Err(LoaderError::NoEntry);
    }

    LoadedImage {
        format: ExecFormat::Elf64,
        image_size,
        entry_offset: (entry - min_vaddr) as usize,
        segments,
    }
    .validate(data.len(), opts.max_memory)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builder for small synthetic ELF64 executables.

    use alloc::vec::Vec;

    pub struct ElfBuilder {
        entry: u64,
        segments: Vec<(u64, Vec<u8>, usize)>, // (vaddr, file bytes, memsz)
    }

    impl ElfBuilder {
        pub fn new(entry: u64) -> Self {
            Self {
                entry,
                segments: Vec::new(),
            }
        }

        pub fn segment(mut self, vaddr: u64, bytes: &[u8], memsz: usize) -> Self {
            self.segments.push((vaddr, bytes.to_vec(), memsz));
            self
        }

        pub fn build(self) -> Vec<u8> {
            let phnum = self.segments.len();
            let mut data_start = 64 + phnum * 56;
            let mut out = alloc::vec![0u8; data_start];

            out[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
            out[4] = 2; // 64-bit
            out[5] = 1; // little endian
            out[6] = 1; // version
            out[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
            out[18..20].copy_from_slice(&0x3Eu16.to_le_bytes());
            out[20..24].copy_from_slice(&1u32.to_le_bytes());
            out[24..32].copy_from_slice(&self.entry.to_le_bytes());
            out[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
            out[52..54].copy_from_slice(&64u16.to_le_bytes()); // ehsize
            out[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
            out[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

            for (i, (vaddr, bytes, memsz)) in self.segments.iter().enumerate() {
                let ph = 64 + i * 56;
                out[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
                out[ph + 4..ph + 8].copy_from_slice(&7u32.to_le_bytes()); // rwx
                out[ph + 8..ph + 16].copy_from_slice(&(data_start as u64).to_le_bytes());
                out[ph + 16..ph + 24].copy_from_slice(&vaddr.to_le_bytes());
                out[ph + 32..ph + 40].copy_from_slice(&(bytes.len() as u64).to_le_bytes());
                out[ph + 40..ph + 48].copy_from_slice(&(*memsz as u64).to_le_bytes());
                data_start += bytes.len();
            }
            for (_, bytes, _) in &self.segments {
                out.extend_from_slice(bytes);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ElfBuilder;
    use super::*;

    fn opts() -> LoadOptions {
        LoadOptions::default()
    }

    #[test]
    fn test_minimal_executable() {
        // exit(7): mov rax, 60; mov rdi, 7; int 0x80
        let code = [
            0x48, 0xC7, 0xC0, 0x3C, 0x00, 0x00, 0x00, // mov rax, 60
            0x48, 0xC7, 0xC7, 0x07, 0x00, 0x00, 0x00, // mov rdi, 7
            0xCD, 0x80, // int 0x80
        ];
        let data = ElfBuilder::new(0x40_0000)
            .segment(0x40_0000, &code, code.len())
            .build();
        let img = parse(&data, &opts()).unwrap();
        assert_eq!(img.format, ExecFormat::Elf64);
        assert_eq!(img.entry_offset, 0);
        assert_eq!(img.image_size, code.len());
        assert_eq!(img.segments.len(), 1);
        assert_eq!(img.segments[0].file_len, code.len());
    }

    #[test]
    fn test_bss_tail() {
        let data = ElfBuilder::new(0x40_0000)
            .segment(0x40_0000, b"code", 4)
            .segment(0x40_1000, b"data", 0x100) // 0xFC bytes of BSS
            .build();
        let img = parse(&data, &opts()).unwrap();
        assert_eq!(img.image_size, 0x1100);
        assert_eq!(img.segments[1].mem_offset, 0x1000);
        assert_eq!(img.segments[1].file_len, 4);
        assert_eq!(img.segments[1].mem_len, 0x100);
    }

    #[test]
    fn test_entry_mid_image() {
        let data = ElfBuilder::new(0x40_0010)
            .segment(0x40_0000, &[0x90; 0x20], 0x20)
            .build();
        let img = parse(&data, &opts()).unwrap();
        assert_eq!(img.entry_offset, 0x10);
    }

    #[test]
    fn test_truncated_segment_rejected() {
        let mut data = ElfBuilder::new(0x40_0000)
            .segment(0x40_0000, &[0x90; 64], 64)
            .build();
        // Inflate p_filesz so p_offset + p_filesz > file size.
        data[64 + 32..64 + 40].copy_from_slice(&0x10_0000u64.to_le_bytes());
        assert_eq!(parse(&data, &opts()), Err(LoaderError::Truncated));
    }

    #[test]
    fn test_wrong_machine_rejected() {
        let mut data = ElfBuilder::new(0x40_0000)
            .segment(0x40_0000, &[0x90; 4], 4)
            .build();
        data[18..20].copy_from_slice(&0xB7u16.to_le_bytes()); // aarch64
        assert_eq!(parse(&data, &opts()), Err(LoaderError::WrongArch));
    }

    #[test]
    fn test_relocatable_rejected() {
        let mut data = ElfBuilder::new(0x40_0000)
            .segment(0x40_0000, &[0x90; 4], 4)
            .build();
        data[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
        assert_eq!(parse(&data, &opts()), Err(LoaderError::WrongArch));
    }

    #[test]
    fn test_entry_outside_image_rejected() {
        let data = ElfBuilder::new(0x99_0000)
            .segment(0x40_0000, &[0x90; 4], 4)
            .build();
        assert_eq!(parse(&data, &opts()), Err(LoaderError::NoEntry));
    }

    #[test]
    fn test_image_size_cap() {
        let data = ElfBuilder::new(0x40_0000)
            .segment(0x40_0000, b"x", 32 * 1024 * 1024)
            .build();
        assert_eq!(parse(&data, &opts()), Err(LoaderError::TooLarge));
    }

    #[test]
    fn test_no_load_segments_rejected() {
        let data = ElfBuilder::new(0x40_0000).build();
        assert_eq!(parse(&data, &opts()), Err(LoaderError::NoEntry));
    }
}
