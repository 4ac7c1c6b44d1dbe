//! ISO9660 filesystem driver (read-only).
//!
//! Mounting reads the primary volume descriptor at LBA 16 and keeps its
//! root directory record; lookups walk directory extents. Version
//! suffixes (`;1`) are stripped from names and comparisons are
//! case-insensitive, since mastering tools upper-case freely.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::FsError;
use crate::sync::SpinLock;

use super::blockdev::BlockDevice;
use super::{DirEntry, FileSystem, NodeKind};

/// ISO9660 logical sector size.
pub const ISO_SECTOR: usize = 2048;

const PVD_LBA: u64 = 16;
const FLAG_DIRECTORY: u8 = 0x02;

/// A decoded directory record.
#[derive(Debug, Clone)]
struct Record {
    extent_lba: u32,
    size: u32,
    flags: u8,
    name: String,
}

impl Record {
    fn is_dir(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }
}

fn u32_lsb(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

/// Decode one on-disk record at `off`; returns the record and its
/// length (0 length means end of this sector's records).
fn decode_record(buf: &[u8], off: usize) -> Option<(Record, usize)> {
    let len = *buf.get(off)? as usize;
    if len == 0 || off + len > buf.len() || len < 34 {
        return None;
    }
    let name_len = buf[off + 32] as usize;
    if off + 33 + name_len > buf.len() {
        return None;
    }
    let raw_name = &buf[off + 33..off + 33 + name_len];
    let name = match raw_name {
        [0x00] => String::from("."),
        [0x01] => String::from(".."),
        _ => {
            let s = core::str::from_utf8(raw_name).unwrap_or("");
            // Strip the ";1" version suffix.
            let s = s.split(';').next().unwrap_or(s);
            String::from(s)
        }
    };
    Some((
        Record {
            extent_lba: u32_lsb(buf, off + 2),
            size: u32_lsb(buf, off + 10),
            flags: buf[off + 25],
            name,
        },
        len,
    ))
}

struct IsoInner {
    root: Record,
}

pub struct Iso9660Fs {
    dev: Arc<dyn BlockDevice>,
    inner: SpinLock<IsoInner>,
}

impl Iso9660Fs {
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Self, FsError> {
        if dev.sector_size() != ISO_SECTOR {
            return Err(FsError::InvalidSuperblock);
        }
        let mut pvd = vec![0u8; ISO_SECTOR];
        dev.read_sectors(PVD_LBA, &mut pvd)?;
        if pvd[0] != 1 || &pvd[1..6] != b"CD001" {
            return Err(FsError::InvalidSuperblock);
        }
        // The root directory record is embedded at offset 156.
        let (root, _) = decode_record(&pvd, 156).ok_or(FsError::InvalidSuperblock)?;
        if !root.is_dir() {
            return Err(FsError::InvalidSuperblock);
        }
        Ok(Self {
            dev,
            inner: SpinLock::new(IsoInner { root }),
        })
    }

    fn read_extent(&self, rec: &Record) -> Result<Vec<u8>, FsError> {
        let sectors = (rec.size as usize).div_ceil(ISO_SECTOR).max(1);
        let mut buf = vec![0u8; sectors * ISO_SECTOR];
        self.dev.read_sectors(rec.extent_lba as u64, &mut buf)?;
        buf.truncate(rec.size as usize);
        Ok(buf)
    }

    fn dir_records(&self, dir: &Record) -> Result<Vec<Record>, FsError> {
        let data = self.read_extent(dir)?;
        let mut out = Vec::new();
        // Records never straddle sector boundaries; a zero length skips
        // to the next sector.
        let mut sector_start = 0usize;
        while sector_start < data.len() {
            let end = (sector_start + ISO_SECTOR).min(data.len());
            let mut off = sector_start;
            while off < end {
                match decode_record(&data[..end], off) {
                    Some((rec, len)) => {
                        out.push(rec);
                        off += len;
                    }
                    None => break,
                }
            }
            sector_start += ISO_SECTOR;
        }
        Ok(out)
    }

    fn lookup(&self, path: &str) -> Result<Record, FsError> {
        let mut cur = self.inner.lock().root.clone();
        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if !cur.is_dir() {
                return Err(FsError::NotADirectory);
            }
            cur = self
                .dir_records(&cur)?
                .into_iter()
                .find(|r| r.name.eq_ignore_ascii_case(comp))
                .ok_or(FsError::NotFound)?;
        }
        Ok(cur)
    }
}

impl FileSystem for Iso9660Fs {
    fn fs_name(&self) -> &'static str {
        "iso9660"
    }

    fn read_only(&self) -> bool {
        true
    }

    fn read(&self, path: &str, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let rec = self.lookup(path)?;
        if rec.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let size = rec.size as usize;
        if offset >= size {
            return Ok(0);
        }
        let data = self.read_extent(&rec)?;
        let n = buf.len().min(size - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, _path: &str, _offset: usize, _data: &[u8]) -> Result<usize, FsError> {
        Err(FsError::ReadOnly)
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let dir = self.lookup(path)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(self
            .dir_records(&dir)?
            .into_iter()
            .filter(|r| r.name != "." && r.name != "..")
            .map(|r| DirEntry {
                name: r.name.clone(),
                kind: if r.is_dir() {
                    NodeKind::Directory
                } else {
                    NodeKind::File
                },
                size: r.size as usize,
            })
            .collect())
    }

    fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        Ok(self.lookup(path)?.is_dir())
    }

    fn create_file(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::ReadOnly)
    }

    fn create_dir(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::ReadOnly)
    }

    fn delete(&self, _path: &str, _recursive: bool) -> Result<(), FsError> {
        Err(FsError::ReadOnly)
    }

    fn size(&self, path: &str) -> Result<usize, FsError> {
        let rec = self.lookup(path)?;
        if rec.is_dir() {
            return Err(FsError::IsADirectory);
        }
        Ok(rec.size as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::super::blockdev::RamDisk;
    use super::*;

    fn put_record(
        buf: &mut [u8],
        off: usize,
        extent: u32,
        size: u32,
        flags: u8,
        name: &[u8],
    ) -> usize {
        let len = 33 + name.len() + (name.len() % 2 == 0) as usize;
        buf[off] = len as u8;
        buf[off + 2..off + 6].copy_from_slice(&extent.to_le_bytes());
        buf[off + 10..off + 14].copy_from_slice(&size.to_le_bytes());
        buf[off + 25] = flags;
        buf[off + 32] = name.len() as u8;
        buf[off + 33..off + 33 + name.len()].copy_from_slice(name);
        off + len
    }

    /// Miniature image: PVD at 16, root dir extent at 20, a file at 21,
    /// a subdirectory at 22 whose file shares extent 21.
    fn build_image() -> RamDisk {
        let disk = RamDisk::new("cd0", 32, ISO_SECTOR);

        let mut pvd = vec![0u8; ISO_SECTOR];
        pvd[0] = 1;
        pvd[1..6].copy_from_slice(b"CD001");
        // Root record embedded in the PVD.
        put_record(&mut pvd, 156, 20, ISO_SECTOR as u32, FLAG_DIRECTORY, &[0x00]);
        disk.write_sectors(PVD_LBA, &pvd).unwrap();

        let mut root = vec![0u8; ISO_SECTOR];
        let mut off = 0;
        off = put_record(&mut root, off, 20, ISO_SECTOR as u32, FLAG_DIRECTORY, &[0x00]);
        off = put_record(&mut root, off, 20, ISO_SECTOR as u32, FLAG_DIRECTORY, &[0x01]);
        off = put_record(&mut root, off, 21, 12, 0, b"README.TXT;1");
        let _ = put_record(&mut root, off, 22, ISO_SECTOR as u32, FLAG_DIRECTORY, b"BOOT");
        disk.write_sectors(20, &root).unwrap();

        let mut file = vec![0u8; ISO_SECTOR];
        file[..12].copy_from_slice(b"iso contents");
        disk.write_sectors(21, &file).unwrap();

        let mut boot = vec![0u8; ISO_SECTOR];
        let mut off = 0;
        off = put_record(&mut boot, off, 22, ISO_SECTOR as u32, FLAG_DIRECTORY, &[0x00]);
        off = put_record(&mut boot, off, 20, ISO_SECTOR as u32, FLAG_DIRECTORY, &[0x01]);
        let _ = put_record(&mut boot, off, 21, 12, 0, b"KERNEL.BIN;1");
        disk.write_sectors(22, &boot).unwrap();

        disk
    }

    fn mounted() -> Iso9660Fs {
        Iso9660Fs::mount(Arc::new(build_image())).unwrap()
    }

    #[test]
    fn test_mount_validates_pvd() {
        let junk = Arc::new(RamDisk::new("cd1", 32, ISO_SECTOR));
        assert!(Iso9660Fs::mount(junk).is_err());
        assert!(Iso9660Fs::mount(Arc::new(build_image())).is_ok());
    }

    #[test]
    fn test_list_root_strips_version_suffix() {
        let fs = mounted();
        let entries = fs.list_dir("/").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["README.TXT", "BOOT"]);
    }

    #[test]
    fn test_read_file() {
        let fs = mounted();
        let mut buf = [0u8; 16];
        let n = fs.read("/README.TXT", 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"iso contents");
        assert_eq!(fs.size("/README.TXT").unwrap(), 12);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let fs = mounted();
        assert!(fs.size("/readme.txt").is_ok());
        assert!(fs.is_dir("/boot").unwrap());
    }

    #[test]
    fn test_subdirectory() {
        let fs = mounted();
        let entries = fs.list_dir("/BOOT").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "KERNEL.BIN");
        let mut buf = [0u8; 12];
        fs.read("/BOOT/KERNEL.BIN", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"iso contents");
    }

    #[test]
    fn test_writes_rejected() {
        let fs = mounted();
        assert!(fs.read_only());
        assert_eq!(fs.write("/README.TXT", 0, b"x"), Err(FsError::ReadOnly));
        assert_eq!(fs.create_file("/new"), Err(FsError::ReadOnly));
        assert_eq!(fs.delete("/README.TXT", false), Err(FsError::ReadOnly));
    }

    #[test]
    fn test_offset_read() {
        let fs = mounted();
        let mut buf = [0u8; 8];
        let n = fs.read("/README.TXT", 4, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"contents");
        assert_eq!(fs.read("/README.TXT", 100, &mut buf).unwrap(), 0);
    }
}
