//! PE32+ image parsing.
//!
//! MZ stub, COFF header, optional header (0x20B), section table. The
//! image occupies `SizeOfImage` bytes; each section's raw data is
//! copied to its RVA, and the entry point is `AddressOfEntryPoint`
//! (already an RVA, so no rebasing is needed).

use alloc::vec::Vec;

use crate::error::LoaderError;

use super::{ExecFormat, LoadOptions, LoadedImage, Segment};

const PE_MAGIC: &[u8; 4] = b"PE\0\0";
const MACHINE_AMD64: u16 = 0x8664;
const OPT_MAGIC_PE32PLUS: u16 = 0x20B;
const CHARACTERISTIC_EXECUTABLE: u16 = 0x0002;
const CHARACTERISTIC_DLL: u16 = 0x2000;

fn u16_at(b: &[u8], o: usize) -> Option<u16> {
    Some(u16::from_le_bytes(b.get(o..o + 2)?.try_into().ok()?))
}

fn u32_at(b: &[u8], o: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(o..o + 4)?.try_into().ok()?))
}

pub fn parse(data: &[u8], opts: &LoadOptions) -> Result<LoadedImage, LoaderError> {
    // e_lfanew points at the PE signature.
    let pe_off = u32_at(data, 0x3C).ok_or(LoaderError::Truncated)? as usize;
    if data.get(pe_off..pe_off + 4) != Some(PE_MAGIC) {
        return Err(LoaderError::Truncated);
    }
    let coff = pe_off + 4;

    let machine = u16_at(data, coff).ok_or(LoaderError::Truncated)?;
    if machine != MACHINE_AMD64 {
        return Err(LoaderError::WrongArch);
    }
    let num_sections = u16_at(data, coff + 2).ok_or(LoaderError::Truncated)? as usize;
    let opt_size = u16_at(data, coff + 16).ok_or(LoaderError::Truncated)? as usize;
    let characteristics = u16_at(data, coff + 18).ok_or(LoaderError::Truncated)?;
    if characteristics & CHARACTERISTIC_EXECUTABLE == 0
        || characteristics & CHARACTERISTIC_DLL != 0
    {
        return Err(LoaderError::WrongArch);
    }

    let opt = coff + 20;
    if opt_size < 112 {
        return Err(LoaderError::Truncated);
    }
    let opt_magic = u16_at(data, opt).ok_or(LoaderError::Truncated)?;
    if opt_magic != OPT_MAGIC_PE32PLUS {
        return Err(LoaderError::WrongArch);
    }
    let entry_rva = u32_at(data, opt + 16).ok_or(LoaderError::Truncated)? as usize;
    let image_size = u32_at(data, opt + 56).ok_or(LoaderError::Truncated)? as usize;

    // Section table follows the optional header.
    let sect_table = opt + opt_size;
    let mut segments = Vec::new();
    for i in 0..num_sections {
        let s = sect_table + i * 40;
        let virt_size = u32_at(data, s + 8).ok_or(LoaderError::Truncated)? as usize;
        let rva = u32_at(data, s + 12).ok_or(LoaderError::Truncated)? as usize;
        let raw_size = u32_at(data, s + 16).ok_or(LoaderError::Truncated)? as usize;
        let raw_ptr = u32_at(data, s + 20).ok_or(LoaderError::Truncated)? as usize;
        if virt_size == 0 && raw_size == 0 {
            continue;
        }
        // Raw data can be padded past the virtual size; copy the
        // smaller of the two.
        let mem_len = if virt_size == 0 { raw_size } else { virt_size };
        let file_len = raw_size.min(mem_len);
        segments.push(Segment {
            file_start: raw_ptr,
            file_len,
            mem_offset: rva,
            mem_len,
        });
    }

    LoadedImage {
        format: ExecFormat::Pe32Plus,
        image_size,
        entry_offset: entry_rva,
        segments,
    }
    .validate(data.len(), opts.max_memory)
}

#[cfg(test)]
pub(crate) mod test_support {
    use alloc::vec::Vec;

    pub struct PeBuilder {
        entry_rva: u32,
        image_size: u32,
        characteristics: u16,
        machine: u16,
        sections: Vec<(u32, Vec<u8>, u32)>, // (rva, raw bytes, virt size)
    }

    impl PeBuilder {
        pub fn new(entry_rva: u32, image_size: u32) -> Self {
            Self {
                entry_rva,
                image_size,
                characteristics: 0x0002, // executable
                machine: 0x8664,
                sections: Vec::new(),
            }
        }

        pub fn machine(mut self, m: u16) -> Self {
            self.machine = m;
            self
        }

        pub fn characteristics(mut self, c: u16) -> Self {
            self.characteristics = c;
            self
        }

        pub fn section(mut self, rva: u32, bytes: &[u8], virt_size: u32) -> Self {
            self.sections.push((rva, bytes.to_vec(), virt_size));
            self
        }

        pub fn build(self) -> Vec<u8> {
            const PE_OFF: usize = 0x80;
            let opt_size = 112usize;
            let sect_table = PE_OFF + 4 + 20 + opt_size;
            let mut raw_ptr = sect_table + self.sections.len() * 40;
            let mut out = alloc::vec![0u8; raw_ptr];

            out[0] = b'M';
            out[1] = b'Z';
            out[0x3C..0x40].copy_from_slice(&(PE_OFF as u32).to_le_bytes());
            out[PE_OFF..PE_OFF + 4].copy_from_slice(b"PE\0\0");
            let coff = PE_OFF + 4;
            out[coff..coff + 2].copy_from_slice(&self.machine.to_le_bytes());
            out[coff + 2..coff + 4]
                .copy_from_slice(&(self.sections.len() as u16).to_le_bytes());
            out[coff + 16..coff + 18].copy_from_slice(&(opt_size as u16).to_le_bytes());
            out[coff + 18..coff + 20].copy_from_slice(&self.characteristics.to_le_bytes());
            let opt = coff + 20;
            out[opt..opt + 2].copy_from_slice(&0x20Bu16.to_le_bytes());
            out[opt + 16..opt + 20].copy_from_slice(&self.entry_rva.to_le_bytes());
            out[opt + 56..opt + 60].copy_from_slice(&self.image_size.to_le_bytes());

            for (i, (rva, bytes, virt)) in self.sections.iter().enumerate() {
                let s = sect_table + i * 40;
                out[s + 8..s + 12].copy_from_slice(&virt.to_le_bytes());
                out[s + 12..s + 16].copy_from_slice(&rva.to_le_bytes());
                out[s + 16..s + 20].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                out[s + 20..s + 24].copy_from_slice(&(raw_ptr as u32).to_le_bytes());
                raw_ptr += bytes.len();
            }
            for (_, bytes, _) in &self.sections {
                out.extend_from_slice(bytes);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::PeBuilder;
    use super::*;

    fn opts() -> LoadOptions {
        LoadOptions::default()
    }

    #[test]
    fn test_minimal_pe() {
        let data = PeBuilder::new(0x1000, 0x3000)
            .section(0x1000, &[0x90; 64], 64)
            .section(0x2000, b"data", 0x100)
            .build();
        let img = parse(&data, &opts()).unwrap();
        assert_eq!(img.format, ExecFormat::Pe32Plus);
        assert_eq!(img.image_size, 0x3000);
        assert_eq!(img.entry_offset, 0x1000);
        assert_eq!(img.segments.len(), 2);
        assert_eq!(img.segments[0].mem_offset, 0x1000);
    }

    #[test]
    fn test_wrong_machine_rejected() {
        let data = PeBuilder::new(0x1000, 0x2000)
            .machine(0x014C) // i386
            .section(0x1000, &[0x90; 16], 16)
            .build();
        assert_eq!(parse(&data, &opts()), Err(LoaderError::WrongArch));
    }

    #[test]
    fn test_dll_rejected() {
        let data = PeBuilder::new(0x1000, 0x2000)
            .characteristics(0x2002) // executable | DLL
            .section(0x1000, &[0x90; 16], 16)
            .build();
        assert_eq!(parse(&data, &opts()), Err(LoaderError::WrongArch));
    }

    #[test]
    fn test_non_executable_rejected() {
        let data = PeBuilder::new(0x1000, 0x2000)
            .characteristics(0)
            .section(0x1000, &[0x90; 16], 16)
            .build();
        assert_eq!(parse(&data, &opts()), Err(LoaderError::WrongArch));
    }

    #[test]
    fn test_truncated_section_rejected() {
        let mut data = PeBuilder::new(0x1000, 0x2000)
            .section(0x1000, &[0x90; 16], 16)
            .build();
        // Point the raw data pointer past the end of the file.
        let sect = 0x80 + 4 + 20 + 112;
        data[sect + 20..sect + 24].copy_from_slice(&0x10_0000u32.to_le_bytes());
        assert_eq!(parse(&data, &opts()), Err(LoaderError::Truncated));
    }

    #[test]
    fn test_bad_pe_signature() {
        let mut data = PeBuilder::new(0x1000, 0x2000)
            .section(0x1000, &[0x90; 16], 16)
            .build();
        data[0x80] = b'X';
        assert_eq!(parse(&data, &opts()), Err(LoaderError::Truncated));
    }
}
