//! Block devices: the abstraction filesystems sit on, the registry, and
//! partition detection.
//!
//! A registered device gets its MBR or GPT scanned; detected partitions
//! are registered as derived devices with adjusted LBA bases, named in
//! the usual way (`sda` -> `sda1`, `nvme0n1` -> `nvme0n1p1`).

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::crypto::crc32;
use crate::error::{BlockError, KernelError, KernelResult};
use crate::sync::SpinLock;

/// A block device. Implementations serialize their own I/O internally.
pub trait BlockDevice: Send + Sync {
    fn name(&self) -> &str;

    fn sector_size(&self) -> usize {
        512
    }

    fn total_sectors(&self) -> u64;

    /// Read whole sectors starting at `lba`. The buffer length must be
    /// a multiple of the sector size.
    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Write whole sectors starting at `lba`.
    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError>;
}

/// Bounds/shape check shared by implementations.
pub fn check_io(dev: &dyn BlockDevice, lba: u64, len: usize) -> Result<(), BlockError> {
    let ssz = dev.sector_size();
    if len == 0 || len % ssz != 0 {
        return Err(BlockError::BadBuffer);
    }
    let sectors = (len / ssz) as u64;
    if lba.checked_add(sectors).is_none_or(|end| end > dev.total_sectors()) {
        return Err(BlockError::OutOfRange);
    }
    Ok(())
}

/// RAM-backed block device: boot modules become one of these, and the
/// filesystem tests format them.
pub struct RamDisk {
    name: String,
    sector_size: usize,
    data: SpinLock<Vec<u8>>,
}

impl RamDisk {
    pub fn new(name: &str, sectors: u64, sector_size: usize) -> Self {
        Self {
            name: name.to_string(),
            sector_size,
            data: SpinLock::new(vec![0u8; sectors as usize * sector_size]),
        }
    }

    /// Wrap existing contents (e.g. a boot module image).
    pub fn from_bytes(name: &str, bytes: Vec<u8>, sector_size: usize) -> Self {
        let mut bytes = bytes;
        let rem = bytes.len() % sector_size;
        if rem != 0 {
            bytes.resize(bytes.len() + sector_size - rem, 0);
        }
        Self {
            name: name.to_string(),
            sector_size,
            data: SpinLock::new(bytes),
        }
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn total_sectors(&self) -> u64 {
        (self.data.lock().len() / self.sector_size) as u64
    }

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        check_io(self, lba, buf.len())?;
        let data = self.data.lock();
        let off = lba as usize * self.sector_size;
        buf.copy_from_slice(&data[off..off + buf.len()]);
        Ok(())
    }

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        check_io(self, lba, buf.len())?;
        let mut data = self.data.lock();
        let off = lba as usize * self.sector_size;
        data[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// A partition, presented as its own device over the parent.
pub struct Partition {
    parent: Arc<dyn BlockDevice>,
    name: String,
    base_lba: u64,
    sectors: u64,
}

impl BlockDevice for Partition {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_size(&self) -> usize {
        self.parent.sector_size()
    }

    fn total_sectors(&self) -> u64 {
        self.sectors
    }

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        check_io(self, lba, buf.len())?;
        self.parent.read_sectors(self.base_lba + lba, buf)
    }

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        check_io(self, lba, buf.len())?;
        self.parent.write_sectors(self.base_lba + lba, buf)
    }
}

fn partition_name(parent: &str, index: usize) -> String {
    if parent.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", parent, index)
    } else {
        format!("{}{}", parent, index)
    }
}

/// A detected partition range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRange {
    pub base_lba: u64,
    pub sectors: u64,
}

fn read_u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_u64_at(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Scan an MBR partition table. Returns detected ranges, or an empty
/// list when no valid table exists. A protective-MBR GPT disk defers to
/// the GPT scan.
pub fn scan_partitions(dev: &dyn BlockDevice) -> Vec<PartitionRange> {
    let ssz = dev.sector_size();
    if ssz < 512 {
        return Vec::new();
    }
    let mut sector = vec![0u8; ssz];
    if dev.read_sectors(0, &mut sector).is_err() {
        return Vec::new();
    }
    if sector[510] != 0x55 || sector[511] != 0xAA {
        return Vec::new();
    }

    let mut found = Vec::new();
    let mut is_gpt = false;
    for i in 0..4 {
        let e = 0x1BE + i * 16;
        let ptype = sector[e + 4];
        if ptype == 0 {
            continue;
        }
        if ptype == 0xEE {
            is_gpt = true;
            continue;
        }
        let base = read_u32_at(&sector, e + 8) as u64;
        let count = read_u32_at(&sector, e + 12) as u64;
        if count > 0 && base + count <= dev.total_sectors() {
            found.push(PartitionRange {
                base_lba: base,
                sectors: count,
            });
        }
    }

    if is_gpt {
        return scan_gpt(dev);
    }
    found
}

/// Scan a GPT: header at LBA 1 with a CRC-checked header, entry array
/// behind it.
fn scan_gpt(dev: &dyn BlockDevice) -> Vec<PartitionRange> {
    let ssz = dev.sector_size();
    let mut header = vec![0u8; ssz];
    if dev.read_sectors(1, &mut header).is_err() {
        return Vec::new();
    }
    if &header[0..8] != b"EFI PART" {
        return Vec::new();
    }
    let header_size = read_u32_at(&header, 12) as usize;
    if header_size < 92 || header_size > ssz {
        return Vec::new();
    }
    let stored_crc = read_u32_at(&header, 16);
    let mut check = header[..header_size].to_vec();
    check[16..20].fill(0);
    if crc32::checksum(&check) != stored_crc {
        return Vec::new();
    }

    let entries_lba = read_u64_at(&header, 72);
    let entry_count = read_u32_at(&header, 80) as usize;
    let entry_size = read_u32_at(&header, 84) as usize;
    if entry_size < 128 || entry_count == 0 {
        return Vec::new();
    }

    let total_bytes = entry_count * entry_size;
    let sectors = total_bytes.div_ceil(ssz);
    let mut table = vec![0u8; sectors * ssz];
    if dev.read_sectors(entries_lba, &mut table).is_err() {
        return Vec::new();
    }

    let mut found = Vec::new();
    for i in 0..entry_count {
        let e = i * entry_size;
        // All-zero type GUID means unused.
        if table[e..e + 16].iter().all(|&b| b == 0) {
            continue;
        }
        let first = read_u64_at(&table, e + 32);
        let last = read_u64_at(&table, e + 40);
        if last >= first && last < dev.total_sectors() {
            found.push(PartitionRange {
                base_lba: first,
                sectors: last - first + 1,
            });
        }
    }
    found
}

/// The device registry.
pub struct BlockRegistry {
    devices: Vec<Arc<dyn BlockDevice>>,
}

impl BlockRegistry {
    pub const fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    fn register_inner(&mut self, dev: Arc<dyn BlockDevice>) -> KernelResult<()> {
        if self.devices.iter().any(|d| d.name() == dev.name()) {
            return Err(KernelError::Block(BlockError::DuplicateName));
        }
        self.devices.push(dev);
        Ok(())
    }

    /// Register a device and any partitions found on it.
    pub fn register(&mut self, dev: Arc<dyn BlockDevice>) -> KernelResult<()> {
        let parts = scan_partitions(dev.as_ref());
        let base_name = dev.name().to_string();
        self.register_inner(dev.clone())?;
        for (i, p) in parts.iter().enumerate() {
            let part = Arc::new(Partition {
                parent: dev.clone(),
                name: partition_name(&base_name, i + 1),
                base_lba: p.base_lba,
                sectors: p.sectors,
            });
            self.register_inner(part)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.devices.iter().find(|d| d.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global registry. Taken after the VFS lock, before allocator locks.
pub static BLOCK_REGISTRY: SpinLock<BlockRegistry> = SpinLock::new(BlockRegistry::new());

/// Register into the global registry.
pub fn register(dev: Arc<dyn BlockDevice>) -> KernelResult<()> {
    BLOCK_REGISTRY.lock().register(dev)
}

/// Look up a device by name.
pub fn get(name: &str) -> Option<Arc<dyn BlockDevice>> {
    BLOCK_REGISTRY.lock().get(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramdisk_round_trip() {
        let disk = RamDisk::new("vblk0", 64, 512);
        let mut wbuf = vec![0u8; 1024];
        wbuf[0] = 0xAB;
        wbuf[1023] = 0xCD;
        disk.write_sectors(3, &wbuf).unwrap();
        let mut rbuf = vec![0u8; 1024];
        disk.read_sectors(3, &mut rbuf).unwrap();
        assert_eq!(rbuf, wbuf);
    }

    #[test]
    fn test_io_bounds() {
        let disk = RamDisk::new("vblk0", 4, 512);
        let mut buf = vec![0u8; 512];
        assert_eq!(
            disk.read_sectors(4, &mut buf),
            Err(BlockError::OutOfRange)
        );
        let mut odd = vec![0u8; 100];
        assert_eq!(disk.read_sectors(0, &mut odd), Err(BlockError::BadBuffer));
    }

    fn write_mbr(disk: &RamDisk, entries: &[(u8, u32, u32)]) {
        let mut sector = vec![0u8; 512];
        for (i, &(ptype, base, count)) in entries.iter().enumerate() {
            let e = 0x1BE + i * 16;
            sector[e + 4] = ptype;
            sector[e + 8..e + 12].copy_from_slice(&base.to_le_bytes());
            sector[e + 12..e + 16].copy_from_slice(&count.to_le_bytes());
        }
        sector[510] = 0x55;
        sector[511] = 0xAA;
        disk.write_sectors(0, &sector).unwrap();
    }

    #[test]
    fn test_mbr_scan() {
        let disk = RamDisk::new("sda", 1000, 512);
        write_mbr(&disk, &[(0x83, 10, 100), (0x0C, 200, 300)]);
        let parts = scan_partitions(&disk);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], PartitionRange { base_lba: 10, sectors: 100 });
        assert_eq!(parts[1], PartitionRange { base_lba: 200, sectors: 300 });
    }

    #[test]
    fn test_no_signature_no_partitions() {
        let disk = RamDisk::new("sda", 100, 512);
        assert!(scan_partitions(&disk).is_empty());
    }

    #[test]
    fn test_mbr_rejects_out_of_range_entry() {
        let disk = RamDisk::new("sda", 100, 512);
        write_mbr(&disk, &[(0x83, 90, 100)]);
        assert!(scan_partitions(&disk).is_empty());
    }

    fn write_gpt(disk: &RamDisk, parts: &[(u64, u64)]) {
        // Protective MBR.
        write_mbr(disk, &[(0xEE, 1, 999)]);

        // Entry array at LBA 2.
        let mut table = vec![0u8; 4 * 512];
        for (i, &(first, last)) in parts.iter().enumerate() {
            let e = i * 128;
            table[e] = 1; // non-zero type GUID
            table[e + 32..e + 40].copy_from_slice(&first.to_le_bytes());
            table[e + 40..e + 48].copy_from_slice(&last.to_le_bytes());
        }
        disk.write_sectors(2, &table).unwrap();

        // Header at LBA 1.
        let mut header = vec![0u8; 512];
        header[0..8].copy_from_slice(b"EFI PART");
        header[12..16].copy_from_slice(&92u32.to_le_bytes()); // header size
        header[72..80].copy_from_slice(&2u64.to_le_bytes()); // entries LBA
        header[80..84].copy_from_slice(&(parts.len() as u32).to_le_bytes());
        header[84..88].copy_from_slice(&128u32.to_le_bytes());
        let crc = crc32::checksum(&header[..92]);
        header[16..20].copy_from_slice(&crc.to_le_bytes());
        disk.write_sectors(1, &header).unwrap();
    }

    #[test]
    fn test_gpt_scan() {
        let disk = RamDisk::new("nvme0n1", 1000, 512);
        write_gpt(&disk, &[(34, 133), (200, 499)]);
        let parts = scan_partitions(&disk);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], PartitionRange { base_lba: 34, sectors: 100 });
        assert_eq!(parts[1], PartitionRange { base_lba: 200, sectors: 300 });
    }

    #[test]
    fn test_gpt_bad_crc_rejected() {
        let disk = RamDisk::new("nvme0n1", 1000, 512);
        write_gpt(&disk, &[(34, 133)]);
        // Corrupt one header byte after the CRC was computed.
        let mut header = vec![0u8; 512];
        disk.read_sectors(1, &mut header).unwrap();
        header[40] ^= 0xFF;
        disk.write_sectors(1, &header).unwrap();
        assert!(scan_partitions(&disk).is_empty());
    }

    #[test]
    fn test_registry_registers_partitions() {
        let mut reg = BlockRegistry::new();
        let disk = Arc::new(RamDisk::new("sda", 1000, 512));
        write_mbr(&disk, &[(0x83, 10, 100)]);
        reg.register(disk).unwrap();
        assert!(reg.get("sda").is_some());
        let part = reg.get("sda1").expect("partition registered");
        assert_eq!(part.total_sectors(), 100);

        // Partition I/O is offset by the base LBA.
        let mut buf = vec![0u8; 512];
        buf[0] = 0x5A;
        part.write_sectors(0, &buf).unwrap();
        let parent = reg.get("sda").unwrap();
        let mut check = vec![0u8; 512];
        parent.read_sectors(10, &mut check).unwrap();
        assert_eq!(check[0], 0x5A);
    }

    #[test]
    fn test_partition_naming() {
        assert_eq!(partition_name("sda", 1), "sda1");
        assert_eq!(partition_name("nvme0n1", 2), "nvme0n1p2");
        assert_eq!(partition_name("vblk0", 1), "vblk0p1");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut reg = BlockRegistry::new();
        reg.register(Arc::new(RamDisk::new("sda", 10, 512))).unwrap();
        assert!(reg.register(Arc::new(RamDisk::new("sda", 10, 512))).is_err());
    }
}
