//! FAT12/16/32 filesystem driver.
//!
//! The boot sector is parsed at mount and the first FAT copy is cached
//! in memory; cluster chains are followed through the cache and written
//! back (all copies) when the chain changes. Names are classic 8.3,
//! upper-cased and space-padded. The FAT variant is decided, as the
//! format requires, purely by the data-cluster count.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::FsError;
use crate::sync::SpinLock;

use super::blockdev::BlockDevice;
use super::{DirEntry, FileSystem, NodeKind};

const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LFN: u8 = 0x0F;

const ENTRY_SIZE: usize = 32;
const ENTRY_FREE: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xE5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

impl FatVariant {
    fn eoc(&self) -> u32 {
        match self {
            Self::Fat12 => 0xFFF,
            Self::Fat16 => 0xFFFF,
            Self::Fat32 => 0x0FFF_FFFF,
        }
    }

    fn is_eoc(&self, entry: u32) -> bool {
        match self {
            Self::Fat12 => entry >= 0xFF8,
            Self::Fat16 => entry >= 0xFFF8,
            Self::Fat32 => entry >= 0x0FFF_FFF8,
        }
    }
}

/// Decoded BPB plus derived layout.
#[derive(Debug, Clone, Copy)]
struct Layout {
    bytes_per_sector: usize,
    sectors_per_cluster: usize,
    reserved_sectors: u64,
    num_fats: usize,
    root_entries: usize,
    fat_size_sectors: u64,
    first_root_sector: u64,
    first_data_sector: u64,
    cluster_count: u32,
    root_cluster: u32,
    variant: FatVariant,
}

impl Layout {
    fn parse(sector: &[u8], total_sectors_dev: u64) -> Result<Self, FsError> {
        if sector.len() < 512 || sector[510] != 0x55 || sector[511] != 0xAA {
            return Err(FsError::InvalidSuperblock);
        }
        let u16_at = |o: usize| u16::from_le_bytes([sector[o], sector[o + 1]]) as u64;
        let u32_at = |o: usize| {
            u32::from_le_bytes([sector[o], sector[o + 1], sector[o + 2], sector[o + 3]]) as u64
        };

        let bytes_per_sector = u16_at(11) as usize;
        let sectors_per_cluster = sector[13] as usize;
        if !bytes_per_sector.is_power_of_two()
            || bytes_per_sector < 512
            || sectors_per_cluster == 0
            || !sectors_per_cluster.is_power_of_two()
        {
            return Err(FsError::InvalidSuperblock);
        }
        let reserved_sectors = u16_at(14);
        let num_fats = sector[16] as usize;
        let root_entries = u16_at(17) as usize;
        let total16 = u16_at(19);
        let fat_size16 = u16_at(22);
        let total32 = u32_at(32);
        let fat_size32 = u32_at(36);

        let total_sectors = if total16 != 0 { total16 } else { total32 };
        let fat_size_sectors = if fat_size16 != 0 { fat_size16 } else { fat_size32 };
        if num_fats == 0 || fat_size_sectors == 0 || total_sectors == 0 {
            return Err(FsError::InvalidSuperblock);
        }
        if total_sectors > total_sectors_dev {
            return Err(FsError::InvalidSuperblock);
        }

        let root_dir_sectors =
            (root_entries * ENTRY_SIZE).div_ceil(bytes_per_sector) as u64;
        let first_root_sector = reserved_sectors + num_fats as u64 * fat_size_sectors;
        let first_data_sector = first_root_sector + root_dir_sectors;
        let data_sectors = total_sectors.saturating_sub(first_data_sector);
        let cluster_count = (data_sectors / sectors_per_cluster as u64) as u32;

        let variant = if cluster_count < 4085 {
            FatVariant::Fat12
        } else if cluster_count < 65525 {
            FatVariant::Fat16
        } else {
            FatVariant::Fat32
        };

        let root_cluster = if variant == FatVariant::Fat32 {
            u32_at(44) as u32
        } else {
            0
        };

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            root_entries,
            fat_size_sectors,
            first_root_sector,
            first_data_sector,
            cluster_count,
            root_cluster,
            variant,
        })
    }

    fn cluster_bytes(&self) -> usize {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.first_data_sector + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }
}

/// Where a directory's entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirLoc {
    /// FAT12/16 fixed root region.
    FixedRoot,
    /// A cluster chain (subdirectories, FAT32 root).
    Chain(u32),
}

/// One raw 32-byte directory entry and where it sits on disk.
#[derive(Clone)]
struct RawEntry {
    bytes: [u8; ENTRY_SIZE],
    sector: u64,
    offset: usize,
}

impl RawEntry {
    fn name83(&self) -> [u8; 11] {
        self.bytes[0..11].try_into().unwrap()
    }

    fn attr(&self) -> u8 {
        self.bytes[11]
    }

    fn is_dir(&self) -> bool {
        self.attr() & ATTR_DIRECTORY != 0
    }

    fn first_cluster(&self) -> u32 {
        let lo = u16::from_le_bytes([self.bytes[26], self.bytes[27]]) as u32;
        let hi = u16::from_le_bytes([self.bytes[20], self.bytes[21]]) as u32;
        (hi << 16) | lo
    }

    fn size(&self) -> u32 {
        u32::from_le_bytes(self.bytes[28..32].try_into().unwrap())
    }

    fn set_first_cluster(&mut self, cluster: u32) {
        self.bytes[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
        self.bytes[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    }

    fn set_size(&mut self, size: u32) {
        self.bytes[28..32].copy_from_slice(&size.to_le_bytes());
    }
}

/// Encode a file name as 8.3: upper-cased, space-padded, extension
/// after the last dot. Overlong parts are truncated.
fn to_83(name: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos + 1..]),
        _ => (name, ""),
    };
    for (i, b) in stem.bytes().take(8).enumerate() {
        out[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        out[8 + i] = b.to_ascii_uppercase();
    }
    out
}

/// Decode an 8.3 name for listings.
fn from_83(raw: &[u8; 11]) -> String {
    let stem: &[u8] = &raw[..8];
    let ext: &[u8] = &raw[8..];
    let stem_end = stem.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
    let ext_end = ext.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
    let mut s = String::new();
    for &b in &stem[..stem_end] {
        s.push(b as char);
    }
    if ext_end > 0 {
        s.push('.');
        for &b in &ext[..ext_end] {
            s.push(b as char);
        }
    }
    s
}

struct FatInner {
    layout: Layout,
    /// Cached first FAT copy.
    fat: Vec<u8>,
    fat_dirty: bool,
}

/// The driver.
pub struct FatFs {
    dev: Arc<dyn BlockDevice>,
    inner: SpinLock<FatInner>,
}

impl FatFs {
    /// Mount: parse the boot sector and cache the FAT.
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Self, FsError> {
        let ssz = dev.sector_size();
        let mut boot = vec![0u8; ssz.max(512)];
        dev.read_sectors(0, &mut boot[..ssz])?;
        let layout = Layout::parse(&boot, dev.total_sectors())?;

        let fat_bytes = layout.fat_size_sectors as usize * layout.bytes_per_sector;
        let mut fat = vec![0u8; fat_bytes];
        dev.read_sectors(layout.reserved_sectors, &mut fat)?;

        Ok(Self {
            dev,
            inner: SpinLock::new(FatInner {
                layout,
                fat,
                fat_dirty: false,
            }),
        })
    }

    pub fn variant(&self) -> FatVariant {
        self.inner.lock().layout.variant
    }

    /// Format a device as FAT12/16 with one FAT copy pair and a fixed
    /// root directory, then return nothing; mount it afterwards.
    pub fn format(dev: &dyn BlockDevice) -> Result<(), FsError> {
        let ssz = dev.sector_size();
        if ssz < 512 {
            return Err(FsError::InvalidSuperblock);
        }
        let total = dev.total_sectors();
        // Room for the boot sector, two FATs, and the root directory.
        if total < 16 {
            return Err(FsError::Full);
        }
        let spc = 1usize;
        let reserved = 1u64;
        let num_fats = 2usize;
        let root_entries = 64usize;
        let root_sectors = (root_entries * ENTRY_SIZE).div_ceil(ssz) as u64;

        // Iterate the FAT size until it covers the clusters it implies.
        let mut fat_size = 1u64;
        loop {
            let data = total - reserved - num_fats as u64 * fat_size - root_sectors;
            let clusters = data / spc as u64;
            let fat12 = clusters < 4085;
            let bytes_needed = if fat12 {
                ((clusters as usize + 2) * 3).div_ceil(2)
            } else {
                (clusters as usize + 2) * 2
            };
            let needed = (bytes_needed.div_ceil(ssz)) as u64;
            if needed <= fat_size {
                break;
            }
            fat_size = needed;
        }

        let mut boot = vec![0u8; ssz];
        boot[11..13].copy_from_slice(&(ssz as u16).to_le_bytes());
        boot[13] = spc as u8;
        boot[14..16].copy_from_slice(&(reserved as u16).to_le_bytes());
        boot[16] = num_fats as u8;
        boot[17..19].copy_from_slice(&(root_entries as u16).to_le_bytes());
        if total <= u16::MAX as u64 {
            boot[19..21].copy_from_slice(&(total as u16).to_le_bytes());
        } else {
            boot[32..36].copy_from_slice(&(total as u32).to_le_bytes());
        }
        boot[21] = 0xF8; // media descriptor
        boot[22..24].copy_from_slice(&(fat_size as u16).to_le_bytes());
        boot[510] = 0x55;
        boot[511] = 0xAA;
        dev.write_sectors(0, &boot)?;

        // Zeroed FATs with the two reserved entries set.
        let mut fat = vec![0u8; fat_size as usize * ssz];
        let data = total - reserved - num_fats as u64 * fat_size - root_sectors;
        let fat12 = data / spc as u64 > 0 && (data / spc as u64) < 4085;
        if fat12 {
            fat[0] = 0xF8;
            fat[1] = 0xFF;
            fat[2] = 0xFF;
        } else {
            fat[0] = 0xF8;
            fat[1] = 0xFF;
            fat[2] = 0xFF;
            fat[3] = 0xFF;
        }
        for copy in 0..num_fats {
            dev.write_sectors(reserved + copy as u64 * fat_size, &fat)?;
        }

        // Zeroed root directory.
        let root_start = reserved + num_fats as u64 * fat_size;
        let zero = vec![0u8; ssz];
        for s in 0..root_sectors {
            dev.write_sectors(root_start + s, &zero)?;
        }
        Ok(())
    }

    // ----- FAT access -----

    fn fat_get(inner: &FatInner, cluster: u32) -> u32 {
        let fat = &inner.fat;
        // Entries past the cached FAT (malformed images) read as EOC so
        // chain walks stop instead of indexing out of bounds.
        let width = match inner.layout.variant {
            FatVariant::Fat12 => cluster as usize * 3 / 2 + 2,
            FatVariant::Fat16 => cluster as usize * 2 + 2,
            FatVariant::Fat32 => cluster as usize * 4 + 4,
        };
        if width > fat.len() {
            return inner.layout.variant.eoc();
        }
        match inner.layout.variant {
            FatVariant::Fat12 => {
                let off = cluster as usize * 3 / 2;
                let v = u16::from_le_bytes([fat[off], fat[off + 1]]);
                if cluster & 1 == 0 {
                    (v & 0x0FFF) as u32
                } else {
                    (v >> 4) as u32
                }
            }
            FatVariant::Fat16 => {
                let off = cluster as usize * 2;
                u16::from_le_bytes([fat[off], fat[off + 1]]) as u32
            }
            FatVariant::Fat32 => {
                let off = cluster as usize * 4;
                u32::from_le_bytes(fat[off..off + 4].try_into().unwrap()) & 0x0FFF_FFFF
            }
        }
    }

    fn fat_set(inner: &mut FatInner, cluster: u32, value: u32) {
        let variant = inner.layout.variant;
        let fat = &mut inner.fat;
        let width = match variant {
            FatVariant::Fat12 => cluster as usize * 3 / 2 + 2,
            FatVariant::Fat16 => cluster as usize * 2 + 2,
            FatVariant::Fat32 => cluster as usize * 4 + 4,
        };
        if width > fat.len() {
            return;
        }
        match variant {
            FatVariant::Fat12 => {
                let off = cluster as usize * 3 / 2;
                let cur = u16::from_le_bytes([fat[off], fat[off + 1]]);
                let new = if cluster & 1 == 0 {
                    (cur & 0xF000) | (value as u16 & 0x0FFF)
                } else {
                    (cur & 0x000F) | ((value as u16 & 0x0FFF) << 4)
                };
                fat[off..off + 2].copy_from_slice(&new.to_le_bytes());
            }
            FatVariant::Fat16 => {
                let off = cluster as usize * 2;
                fat[off..off + 2].copy_from_slice(&(value as u16).to_le_bytes());
            }
            FatVariant::Fat32 => {
                let off = cluster as usize * 4;
                let cur = u32::from_le_bytes(fat[off..off + 4].try_into().unwrap());
                let new = (cur & 0xF000_0000) | (value & 0x0FFF_FFFF);
                fat[off..off + 4].copy_from_slice(&new.to_le_bytes());
            }
        }
        inner.fat_dirty = true;
    }

    /// Find and claim a free cluster, terminating it.
    fn alloc_cluster(inner: &mut FatInner) -> Result<u32, FsError> {
        let count = inner.layout.cluster_count;
        for cluster in 2..count + 2 {
            if Self::fat_get(inner, cluster) == 0 {
                let eoc = inner.layout.variant.eoc();
                Self::fat_set(inner, cluster, eoc);
                return Ok(cluster);
            }
        }
        Err(FsError::Full)
    }

    fn free_chain(inner: &mut FatInner, mut cluster: u32) {
        while cluster >= 2 && !inner.layout.variant.is_eoc(cluster) {
            let next = Self::fat_get(inner, cluster);
            Self::fat_set(inner, cluster, 0);
            if next < 2 {
                break;
            }
            cluster = next;
        }
    }

    /// Write every FAT copy back if the cache changed.
    fn flush_fat(&self, inner: &mut FatInner) -> Result<(), FsError> {
        if !inner.fat_dirty {
            return Ok(());
        }
        for copy in 0..inner.layout.num_fats {
            let lba = inner.layout.reserved_sectors
                + copy as u64 * inner.layout.fat_size_sectors;
            self.dev.write_sectors(lba, &inner.fat)?;
        }
        inner.fat_dirty = false;
        Ok(())
    }

    // ----- cluster I/O -----

    fn read_cluster(&self, inner: &FatInner, cluster: u32, buf: &mut [u8]) -> Result<(), FsError> {
        let lba = inner.layout.cluster_to_sector(cluster);
        self.dev.read_sectors(lba, buf)?;
        Ok(())
    }

    fn write_cluster(&self, inner: &FatInner, cluster: u32, buf: &[u8]) -> Result<(), FsError> {
        let lba = inner.layout.cluster_to_sector(cluster);
        self.dev.write_sectors(lba, buf)?;
        Ok(())
    }

    // ----- directory plumbing -----

    /// Collect the raw entries of a directory.
    fn dir_entries(&self, inner: &FatInner, loc: DirLoc) -> Result<Vec<RawEntry>, FsError> {
        let mut out = Vec::new();
        let ssz = inner.layout.bytes_per_sector;
        match loc {
            DirLoc::FixedRoot => {
                let sectors =
                    (inner.layout.root_entries * ENTRY_SIZE).div_ceil(ssz) as u64;
                let mut buf = vec![0u8; ssz];
                for s in 0..sectors {
                    let lba = inner.layout.first_root_sector + s;
                    self.dev.read_sectors(lba, &mut buf)?;
                    for i in 0..ssz / ENTRY_SIZE {
                        let b: [u8; ENTRY_SIZE] =
                            buf[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE].try_into().unwrap();
                        out.push(RawEntry {
                            bytes: b,
                            sector: lba,
                            offset: i * ENTRY_SIZE,
                        });
                    }
                }
            }
            DirLoc::Chain(start) => {
                let mut cluster = start;
                let mut buf = vec![0u8; inner.layout.cluster_bytes()];
                let mut hops = 0u32;
                while cluster >= 2 && !inner.layout.variant.is_eoc(cluster) {
                    self.read_cluster(inner, cluster, &mut buf)?;
                    let base = inner.layout.cluster_to_sector(cluster);
                    for i in 0..buf.len() / ENTRY_SIZE {
                        let b: [u8; ENTRY_SIZE] =
                            buf[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE].try_into().unwrap();
                        out.push(RawEntry {
                            bytes: b,
                            sector: base + (i * ENTRY_SIZE / ssz) as u64,
                            offset: (i * ENTRY_SIZE) % ssz,
                        });
                    }
                    cluster = Self::fat_get(inner, cluster);
                    hops += 1;
                    if hops > inner.layout.cluster_count {
                        return Err(FsError::Io);
                    }
                }
            }
        }
        Ok(out)
    }

    fn live_entries(&self, inner: &FatInner, loc: DirLoc) -> Result<Vec<RawEntry>, FsError> {
        Ok(self
            .dir_entries(inner, loc)?
            .into_iter()
            .take_while(|e| e.bytes[0] != ENTRY_FREE)
            .filter(|e| {
                e.bytes[0] != ENTRY_DELETED
                    && e.attr() != ATTR_LFN
                    && e.attr() & ATTR_VOLUME_ID == 0
            })
            .collect())
    }

    /// Write one raw entry back to disk in place.
    fn store_entry(&self, inner: &FatInner, entry: &RawEntry) -> Result<(), FsError> {
        let ssz = inner.layout.bytes_per_sector;
        let mut sector = vec![0u8; ssz];
        self.dev.read_sectors(entry.sector, &mut sector)?;
        sector[entry.offset..entry.offset + ENTRY_SIZE].copy_from_slice(&entry.bytes);
        self.dev.write_sectors(entry.sector, &sector)?;
        Ok(())
    }

    fn root_loc(&self, inner: &FatInner) -> DirLoc {
        match inner.layout.variant {
            FatVariant::Fat32 => DirLoc::Chain(inner.layout.root_cluster),
            _ => DirLoc::FixedRoot,
        }
    }

    /// Resolve a path to its directory entry; `None` means the root
    /// directory itself.
    fn lookup(&self, inner: &FatInner, path: &str) -> Result<Option<RawEntry>, FsError> {
        let mut loc = self.root_loc(inner);
        let mut current: Option<RawEntry> = None;
        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if let Some(e) = &current {
                if !e.is_dir() {
                    return Err(FsError::NotADirectory);
                }
                loc = DirLoc::Chain(e.first_cluster());
            }
            let want = to_83(comp);
            let found = self
                .live_entries(inner, loc)?
                .into_iter()
                .find(|e| e.name83() == want)
                .ok_or(FsError::NotFound)?;
            current = Some(found);
        }
        Ok(current)
    }

    /// Directory location for a path already known to be a directory.
    fn dir_loc(&self, inner: &FatInner, path: &str) -> Result<DirLoc, FsError> {
        match self.lookup(inner, path)? {
            None => Ok(self.root_loc(inner)),
            Some(e) if e.is_dir() => Ok(DirLoc::Chain(e.first_cluster())),
            Some(_) => Err(FsError::NotADirectory),
        }
    }

    fn split_parent<'p>(path: &'p str) -> Result<(&'p str, &'p str), FsError> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(FsError::InvalidPath);
        }
        match trimmed.rfind('/') {
            Some(0) => Ok(("/", &trimmed[1..])),
            Some(pos) => Ok((&trimmed[..pos], &trimmed[pos + 1..])),
            None => Err(FsError::InvalidPath),
        }
    }

    /// Claim a free slot in a directory and write `bytes` into it.
    fn insert_entry(
        &self,
        inner: &mut FatInner,
        loc: DirLoc,
        bytes: [u8; ENTRY_SIZE],
    ) -> Result<(), FsError> {
        let entries = self.dir_entries(inner, loc)?;
        if let Some(slot) = entries
            .iter()
            .find(|e| e.bytes[0] == ENTRY_FREE || e.bytes[0] == ENTRY_DELETED)
        {
            let mut slot = slot.clone();
            slot.bytes = bytes;
            return self.store_entry(inner, &slot);
        }
        // Directory full: fixed roots cannot grow, chains can.
        match loc {
            DirLoc::FixedRoot => Err(FsError::Full),
            DirLoc::Chain(start) => {
                let fresh = Self::alloc_cluster(inner)?;
                // Find the chain tail and link the new cluster.
                let mut tail = start;
                while !inner.layout.variant.is_eoc(Self::fat_get(inner, tail)) {
                    tail = Self::fat_get(inner, tail);
                }
                Self::fat_set(inner, tail, fresh);
                let zero = vec![0u8; inner.layout.cluster_bytes()];
                self.write_cluster(inner, fresh, &zero)?;
                let mut page = zero;
                page[..ENTRY_SIZE].copy_from_slice(&bytes);
                self.write_cluster(inner, fresh, &page)?;
                Ok(())
            }
        }
    }

    fn new_entry(name: &str, attr: u8, cluster: u32, size: u32) -> [u8; ENTRY_SIZE] {
        let mut b = [0u8; ENTRY_SIZE];
        b[0..11].copy_from_slice(&to_83(name));
        b[11] = attr;
        b[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
        b[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        b[28..32].copy_from_slice(&size.to_le_bytes());
        b
    }

    fn delete_inner(
        &self,
        inner: &mut FatInner,
        path: &str,
        recursive: bool,
    ) -> Result<(), FsError> {
        let entry = self
            .lookup(inner, path)?
            .ok_or(FsError::InvalidPath)?; // the root itself

        if entry.is_dir() {
            let loc = DirLoc::Chain(entry.first_cluster());
            let children: Vec<RawEntry> = self
                .live_entries(inner, loc)?
                .into_iter()
                .filter(|e| {
                    let n = e.name83();
                    n != to_83(".") && n != to_83("..")
                })
                .collect();
            if !children.is_empty() {
                if !recursive {
                    return Err(FsError::DirectoryNotEmpty);
                }
                for child in children {
                    let name = from_83(&child.name83());
                    let child_path = alloc::format!("{}/{}", path.trim_end_matches('/'), name);
                    self.delete_inner(inner, &child_path, true)?;
                }
            }
        }

        // Free the data chain and tombstone the entry.
        let first = entry.first_cluster();
        if first >= 2 {
            Self::free_chain(inner, first);
        }
        let mut dead = entry;
        dead.bytes[0] = ENTRY_DELETED;
        self.store_entry(inner, &dead)?;
        Ok(())
    }
}

impl FileSystem for FatFs {
    fn fs_name(&self) -> &'static str {
        "fat"
    }

    fn read(&self, path: &str, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let inner = self.inner.lock();
        let entry = self.lookup(&inner, path)?.ok_or(FsError::IsADirectory)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let size = entry.size() as usize;
        if offset >= size {
            return Ok(0);
        }
        let want = buf.len().min(size - offset);

        let cb = inner.layout.cluster_bytes();
        let mut cluster = entry.first_cluster();
        // Skip whole clusters before the offset.
        let mut skip = offset / cb;
        while skip > 0 {
            cluster = Self::fat_get(&inner, cluster);
            if cluster < 2 || inner.layout.variant.is_eoc(cluster) {
                return Ok(0);
            }
            skip -= 1;
        }

        let mut done = 0usize;
        let mut within = offset % cb;
        let mut scratch = vec![0u8; cb];
        while done < want && cluster >= 2 && !inner.layout.variant.is_eoc(cluster) {
            self.read_cluster(&inner, cluster, &mut scratch)?;
            let n = (cb - within).min(want - done);
            buf[done..done + n].copy_from_slice(&scratch[within..within + n]);
            done += n;
            within = 0;
            cluster = Self::fat_get(&inner, cluster);
        }
        Ok(done)
    }

    fn write(&self, path: &str, offset: usize, data: &[u8]) -> Result<usize, FsError> {
        let mut inner = self.inner.lock();
        let mut entry = self.lookup(&inner, path)?.ok_or(FsError::IsADirectory)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if entry.attr() & ATTR_READ_ONLY != 0 {
            return Err(FsError::ReadOnly);
        }

        let cb = inner.layout.cluster_bytes();
        let end = offset + data.len();
        let needed_clusters = end.div_ceil(cb).max(1);

        // Ensure the chain is long enough, allocating from the FAT.
        let mut first = entry.first_cluster();
        if first < 2 {
            first = Self::alloc_cluster(&mut inner)?;
            entry.set_first_cluster(first);
        }
        let mut have = 1;
        let mut tail = first;
        while !inner.layout.variant.is_eoc(Self::fat_get(&inner, tail)) {
            tail = Self::fat_get(&inner, tail);
            have += 1;
        }
        while have < needed_clusters {
            let fresh = Self::alloc_cluster(&mut inner)?;
            let zero = vec![0u8; cb];
            self.write_cluster(&inner, fresh, &zero)?;
            Self::fat_set(&mut inner, tail, fresh);
            tail = fresh;
            have += 1;
        }

        // Walk to the first affected cluster and write through.
        let mut cluster = first;
        for _ in 0..offset / cb {
            cluster = Self::fat_get(&inner, cluster);
        }
        let mut done = 0usize;
        let mut within = offset % cb;
        let mut scratch = vec![0u8; cb];
        while done < data.len() {
            self.read_cluster(&inner, cluster, &mut scratch)?;
            let n = (cb - within).min(data.len() - done);
            scratch[within..within + n].copy_from_slice(&data[done..done + n]);
            self.write_cluster(&inner, cluster, &scratch)?;
            done += n;
            within = 0;
            if done < data.len() {
                cluster = Self::fat_get(&inner, cluster);
            }
        }

        // Update the directory entry and flush the FAT copies.
        if end > entry.size() as usize {
            entry.set_size(end as u32);
        }
        self.store_entry(&inner, &entry)?;
        self.flush_fat(&mut inner)?;
        Ok(data.len())
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let inner = self.inner.lock();
        let loc = self.dir_loc(&inner, path)?;
        Ok(self
            .live_entries(&inner, loc)?
            .iter()
            .filter(|e| {
                let n = e.name83();
                n != to_83(".") && n != to_83("..")
            })
            .map(|e| DirEntry {
                name: from_83(&e.name83()),
                kind: if e.is_dir() {
                    NodeKind::Directory
                } else {
                    NodeKind::File
                },
                size: e.size() as usize,
            })
            .collect())
    }

    fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        let inner = self.inner.lock();
        match self.lookup(&inner, path)? {
            None => Ok(true),
            Some(e) => Ok(e.is_dir()),
        }
    }

    fn create_file(&self, path: &str) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        let (dir, name) = Self::split_parent(path)?;
        let loc = self.dir_loc(&inner, dir)?;
        if self
            .live_entries(&inner, loc)?
            .iter()
            .any(|e| e.name83() == to_83(name))
        {
            return Err(FsError::AlreadyExists);
        }
        let bytes = Self::new_entry(name, 0, 0, 0);
        self.insert_entry(&mut inner, loc, bytes)?;
        self.flush_fat(&mut inner)
    }

    fn create_dir(&self, path: &str) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        let (dir, name) = Self::split_parent(path)?;
        let loc = self.dir_loc(&inner, dir)?;
        if self
            .live_entries(&inner, loc)?
            .iter()
            .any(|e| e.name83() == to_83(name))
        {
            return Err(FsError::AlreadyExists);
        }

        // A directory gets one cluster holding its "." / ".." entries.
        let cluster = Self::alloc_cluster(&mut inner)?;
        let cb = inner.layout.cluster_bytes();
        let mut page = vec![0u8; cb];
        let parent_cluster = match loc {
            DirLoc::FixedRoot => 0,
            DirLoc::Chain(c) => c,
        };
        page[..ENTRY_SIZE].copy_from_slice(&Self::new_entry(".", ATTR_DIRECTORY, cluster, 0));
        page[ENTRY_SIZE..2 * ENTRY_SIZE]
            .copy_from_slice(&Self::new_entry("..", ATTR_DIRECTORY, parent_cluster, 0));
        self.write_cluster(&inner, cluster, &page)?;

        let bytes = Self::new_entry(name, ATTR_DIRECTORY, cluster, 0);
        self.insert_entry(&mut inner, loc, bytes)?;
        self.flush_fat(&mut inner)
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        self.delete_inner(&mut inner, path, recursive)?;
        self.flush_fat(&mut inner)
    }

    fn size(&self, path: &str) -> Result<usize, FsError> {
        let inner = self.inner.lock();
        let entry = self.lookup(&inner, path)?.ok_or(FsError::IsADirectory)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory);
        }
        Ok(entry.size() as usize)
    }

    fn sync(&self) -> Result<(), FsError> {
        let mut inner = self.inner.lock();
        self.flush_fat(&mut inner)
    }
}

#[cfg(test)]
mod tests {
    use super::super::blockdev::RamDisk;
    use super::*;

    fn fresh_fs(sectors: u64) -> FatFs {
        let disk = RamDisk::new("fat0", sectors, 512);
        FatFs::format(&disk).unwrap();
        FatFs::mount(Arc::new(disk)).unwrap()
    }

    #[test]
    fn test_format_and_mount_fat12() {
        let fs = fresh_fs(256);
        assert_eq!(fs.variant(), FatVariant::Fat12);
        assert_eq!(fs.list_dir("/").unwrap(), Vec::new());
        assert!(fs.is_dir("/").unwrap());
    }

    #[test]
    fn test_format_larger_is_fat16() {
        // Enough clusters to cross the 4085 threshold.
        let fs = fresh_fs(8192);
        assert_eq!(fs.variant(), FatVariant::Fat16);
    }

    #[test]
    fn test_names_are_upper_padded_83() {
        assert_eq!(&to_83("hello.txt"), b"HELLO   TXT");
        assert_eq!(&to_83("A"), b"A          ");
        assert_eq!(&to_83("verylongname.jpeg"), b"VERYLONGJPE");
        assert_eq!(from_83(b"HELLO   TXT"), "HELLO.TXT");
        assert_eq!(from_83(b"A          "), "A");
    }

    #[test]
    fn test_create_write_read() {
        let fs = fresh_fs(256);
        fs.create_file("/hello.txt").unwrap();
        fs.write("/hello.txt", 0, b"hello fat world").unwrap();
        let mut buf = [0u8; 32];
        let n = fs.read("/hello.txt", 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello fat world");
        assert_eq!(fs.size("/hello.txt").unwrap(), 15);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let fs = fresh_fs(256);
        fs.create_file("/Hello.Txt").unwrap();
        assert!(fs.size("/HELLO.TXT").is_ok());
        assert!(fs.size("/hello.txt").is_ok());
    }

    #[test]
    fn test_multi_cluster_file() {
        let fs = fresh_fs(256);
        fs.create_file("/big.bin").unwrap();
        // Cluster size is 512; span several clusters.
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        fs.write("/big.bin", 0, &data).unwrap();
        let mut back = vec![0u8; 2000];
        let n = fs.read("/big.bin", 0, &mut back).unwrap();
        assert_eq!(n, 2000);
        assert_eq!(back, data);

        // Offset read mid-chain.
        let mut mid = vec![0u8; 100];
        let n = fs.read("/big.bin", 700, &mut mid).unwrap();
        assert_eq!(n, 100);
        assert_eq!(mid, data[700..800]);
    }

    #[test]
    fn test_overwrite_in_place() {
        let fs = fresh_fs(256);
        fs.create_file("/f").unwrap();
        fs.write("/f", 0, b"AAAAAA").unwrap();
        fs.write("/f", 2, b"BB").unwrap();
        let mut buf = [0u8; 6];
        fs.read("/f", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"AABBAA");
        assert_eq!(fs.size("/f").unwrap(), 6);
    }

    #[test]
    fn test_subdirectories() {
        let fs = fresh_fs(256);
        fs.create_dir("/sub").unwrap();
        assert!(fs.is_dir("/sub").unwrap());
        fs.create_file("/sub/inner.txt").unwrap();
        fs.write("/sub/inner.txt", 0, b"nested").unwrap();
        let mut buf = [0u8; 6];
        fs.read("/sub/inner.txt", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"nested");

        let entries = fs.list_dir("/sub").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "INNER.TXT");

        // Nested one more level.
        fs.create_dir("/sub/deep").unwrap();
        fs.create_file("/sub/deep/f").unwrap();
        assert!(fs.size("/sub/deep/f").is_ok());
    }

    #[test]
    fn test_delete_file_frees_clusters() {
        let fs = fresh_fs(64);
        fs.create_file("/a").unwrap();
        let data = vec![7u8; 5 * 512];
        fs.write("/a", 0, &data).unwrap();
        fs.delete("/a", false).unwrap();
        assert_eq!(fs.size("/a"), Err(FsError::NotFound));
        // The clusters are reusable: a new file of the same size fits.
        fs.create_file("/b").unwrap();
        fs.write("/b", 0, &data).unwrap();
    }

    #[test]
    fn test_delete_nonempty_dir_requires_recursive() {
        let fs = fresh_fs(256);
        fs.create_dir("/d").unwrap();
        fs.create_file("/d/f").unwrap();
        assert_eq!(fs.delete("/d", false), Err(FsError::DirectoryNotEmpty));
        fs.delete("/d", true).unwrap();
        assert_eq!(fs.is_dir("/d"), Err(FsError::NotFound));
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let fs = fresh_fs(256);
        fs.create_file("/f").unwrap();
        assert_eq!(fs.create_file("/f"), Err(FsError::AlreadyExists));
    }

    #[test]
    fn test_fat_persists_across_remount() {
        let disk = Arc::new(RamDisk::new("fat0", 256, 512));
        FatFs::format(disk.as_ref()).unwrap();
        {
            let fs = FatFs::mount(disk.clone()).unwrap();
            fs.create_file("/keep.txt").unwrap();
            fs.write("/keep.txt", 0, b"persistent").unwrap();
            fs.sync().unwrap();
        }
        // Remount from the same backing store.
        let fs = FatFs::mount(disk).unwrap();
        let mut buf = [0u8; 10];
        let n = fs.read("/keep.txt", 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"persistent");
    }

    #[test]
    fn test_bad_boot_sector_rejected() {
        let disk = Arc::new(RamDisk::new("junk", 64, 512));
        assert!(FatFs::mount(disk).is_err());
    }

    #[test]
    fn test_fat12_entry_packing() {
        // Adjacent FAT12 entries share a byte; setting one must not
        // clobber its neighbour.
        let fs = fresh_fs(256);
        let mut inner = fs.inner.lock();
        FatFs::fat_set(&mut inner, 2, 0xABC);
        FatFs::fat_set(&mut inner, 3, 0x123);
        assert_eq!(FatFs::fat_get(&inner, 2), 0xABC);
        assert_eq!(FatFs::fat_get(&inner, 3), 0x123);
        FatFs::fat_set(&mut inner, 2, 0xFFF);
        assert_eq!(FatFs::fat_get(&inner, 3), 0x123);
    }
}
