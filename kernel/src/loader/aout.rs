//! a.out image parsing.
//!
//! The venerable format: a 32-byte header giving text, data, and bss
//! sizes, followed by the text and data images. OMAGIC/NMAGIC/QMAGIC
//! place the text right after the header; ZMAGIC pads the header block
//! to 1024 bytes.

use crate::error::LoaderError;

use super::{ExecFormat, LoadOptions, LoadedImage, Segment};

pub const OMAGIC: u32 = 0o407;
pub const NMAGIC: u32 = 0o410;
pub const ZMAGIC: u32 = 0o413;
pub const QMAGIC: u32 = 0o314;

const HEADER_SIZE: usize = 32;
const ZMAGIC_TEXT_OFFSET: usize = 1024;

fn u32_at(b: &[u8], o: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(o..o + 4)?.try_into().ok()?))
}

pub fn parse(data: &[u8], opts: &LoadOptions) -> Result<LoadedImage, LoaderError> {
    if data.len() < HEADER_SIZE {
        return Err(LoaderError::Truncated);
    }
    let magic = u32_at(data, 0).ok_or(LoaderError::Truncated)? & 0xFFFF;
    if !matches!(magic, OMAGIC | NMAGIC | ZMAGIC | QMAGIC) {
        return Err(LoaderError::UnknownFormat);
    }

    let a_text = u32_at(data, 4).ok_or(LoaderError::Truncated)? as usize;
    let a_data = u32_at(data, 8).ok_or(LoaderError::Truncated)? as usize;
    let a_bss = u32_at(data, 12).ok_or(LoaderError::Truncated)? as usize;
    let a_entry = u32_at(data, 20).ok_or(LoaderError::Truncated)? as usize;

    if a_text == 0 {
        return Err(LoaderError::NoEntry);
    }

    let text_offset = if magic == ZMAGIC {
        ZMAGIC_TEXT_OFFSET
    } else {
        HEADER_SIZE
    };

    let image_size = a_text
        .checked_add(a_data)
        .and_then(|s| s.checked_add(a_bss))
        .ok_or(LoaderError::TooLarge)?;

    // Entry is an offset into the combined text+data image.
    if a_entry >= a_text + a_data {
        return Err(LoaderError::NoEntry);
    }

    let segments = alloc::vec![
        Segment {
            file_start: text_offset,
            file_len: a_text,
            mem_offset: 0,
            mem_len: a_text,
        },
        Segment {
            file_start: text_offset + a_text,
            file_len: a_data,
            mem_offset: a_text,
            // BSS rides on the tail of the data segment.
            mem_len: a_data + a_bss,
        },
    ];

    LoadedImage {
        format: ExecFormat::Aout,
        image_size,
        entry_offset: a_entry,
        segments,
    }
    .validate(data.len(), opts.max_memory)
}


#[cfg(test)]
mod tests {
    use super::test_support::build;
    use super::*;

    fn opts() -> LoadOptions {
        LoadOptions::default()
    }

    #[test]
    fn test_minimal_aout() {
        let data = build(OMAGIC, &[0x90; 64], b"data", 128, 0);
        let img = parse(&data, &opts()).unwrap();
        assert_eq!(img.format, ExecFormat::Aout);
        assert_eq!(img.image_size, 64 + 4 + 128);
        assert_eq!(img.entry_offset, 0);
        assert_eq!(img.segments[0].file_start, 32);
        assert_eq!(img.segments[1].mem_len, 4 + 128);
    }

    #[test]
    fn test_all_magics_accepted() {
        for magic in [OMAGIC, NMAGIC, QMAGIC] {
            let data = build(magic, &[0x90; 16], &[], 0, 0);
            assert!(parse(&data, &opts()).is_ok(), "magic {:o}", magic);
        }
    }

    #[test]
    fn test_zmagic_text_at_1k() {
        let text = [0xAB; 16];
        let mut data = build(ZMAGIC, &text, &[], 0, 0);
        // The builder placed text at 32; move it to the ZMAGIC offset.
        data.resize(1024 + 16, 0);
        data.copy_within(32..48, 1024);
        let img = parse(&data, &opts()).unwrap();
        assert_eq!(img.segments[0].file_start, 1024);
    }

    #[test]
    fn test_truncated_rejected() {
        // Header claims more text than the file carries.
        let mut data = build(OMAGIC, &[0x90; 16], &[], 0, 0);
        data[4..8].copy_from_slice(&4096u32.to_le_bytes());
        assert_eq!(parse(&data, &opts()), Err(LoaderError::Truncated));
    }

    #[test]
    fn test_entry_in_bss_rejected() {
        let data = build(OMAGIC, &[0x90; 16], &[], 64, 20);
        assert_eq!(parse(&data, &opts()), Err(LoaderError::NoEntry));
    }

    #[test]
    fn test_empty_text_rejected() {
        let data = build(OMAGIC, &[], b"data", 0, 0);
        assert_eq!(parse(&data, &opts()), Err(LoaderError::NoEntry));
    }
}
