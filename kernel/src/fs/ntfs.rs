//! NTFS filesystem driver.
//!
//! Parses the boot sector and the MFT, resolving file data from
//! resident $DATA attributes or by decoding non-resident run lists.
//! Directory listing scans MFT records for $FILE_NAME attributes whose
//! parent reference matches — index B-trees are deliberately not
//! walked, which caps the driver at moderate volumes but keeps it
//! honest about what it understands.
//!
//! Writes are overwrite-in-place, the same policy as the ext2 driver:
//! bytes inside a file's existing $DATA extent can be rewritten
//! (resident content goes back through the MFT record with its update
//! sequence re-applied), but the driver allocates no clusters, so
//! growth reports `Full` and namespace changes report `ReadOnly`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::FsError;
use crate::sync::SpinLock;

use super::blockdev::BlockDevice;
use super::{DirEntry, FileSystem, NodeKind};

const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_END: u32 = 0xFFFF_FFFF;

/// Record number of the MFT itself and of the root directory.
const MFT_RECORD_MFT: u64 = 0;
const MFT_RECORD_ROOT: u64 = 5;

/// Cap on records visited by the scanning lookups.
const MAX_SCAN_RECORDS: u64 = 4096;

/// One extent of a non-resident attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    /// Starting cluster (absolute), or None for a sparse run.
    pub lcn: Option<u64>,
    pub clusters: u64,
}

/// Decode an NTFS run list: each header byte packs the byte lengths of
/// the run-length and (signed, relative) run-offset fields.
pub fn decode_runs(data: &[u8]) -> Vec<DataRun> {
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut lcn: i64 = 0;
    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break;
        }
        pos += 1;
        let len_size = (header & 0x0F) as usize;
        let off_size = (header >> 4) as usize;
        if len_size == 0 || pos + len_size + off_size > data.len() {
            break;
        }

        let mut clusters = 0u64;
        for i in 0..len_size {
            clusters |= (data[pos + i] as u64) << (8 * i);
        }
        pos += len_size;

        if off_size == 0 {
            // Sparse run.
            runs.push(DataRun {
                lcn: None,
                clusters,
            });
            continue;
        }
        let mut delta = 0i64;
        for i in 0..off_size {
            delta |= (data[pos + i] as i64) << (8 * i);
        }
        // Sign-extend the top byte.
        let shift = 64 - 8 * off_size;
        delta = (delta << shift) >> shift;
        pos += off_size;

        lcn += delta;
        runs.push(DataRun {
            lcn: Some(lcn as u64),
            clusters,
        });
    }
    runs
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    bytes_per_sector: usize,
    sectors_per_cluster: usize,
    mft_lcn: u64,
    record_size: usize,
}

impl Layout {
    fn cluster_bytes(&self) -> usize {
        self.bytes_per_sector * self.sectors_per_cluster
    }
}

/// A file found by name scan.
#[derive(Debug, Clone)]
struct Found {
    record: u64,
    name: String,
    is_dir: bool,
}

struct NtfsInner {
    layout: Layout,
    /// Run list of the MFT's own $DATA attribute.
    mft_runs: Vec<DataRun>,
}

pub struct NtfsFs {
    dev: Arc<dyn BlockDevice>,
    inner: SpinLock<NtfsInner>,
}

fn u16_at(b: &[u8], o: usize) -> u16 {
    u16::from_le_bytes(b[o..o + 2].try_into().unwrap())
}

fn u32_at(b: &[u8], o: usize) -> u32 {
    u32::from_le_bytes(b[o..o + 4].try_into().unwrap())
}

fn u64_at(b: &[u8], o: usize) -> u64 {
    u64::from_le_bytes(b[o..o + 8].try_into().unwrap())
}

impl NtfsFs {
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Self, FsError> {
        let ssz = dev.sector_size();
        let mut boot = vec![0u8; ssz.max(512)];
        dev.read_sectors(0, &mut boot[..ssz])?;
        if &boot[3..11] != b"NTFS    " {
            return Err(FsError::InvalidSuperblock);
        }
        let bytes_per_sector = u16_at(&boot, 11) as usize;
        let sectors_per_cluster = boot[13] as usize;
        if bytes_per_sector < 512 || sectors_per_cluster == 0 {
            return Err(FsError::InvalidSuperblock);
        }
        let mft_lcn = u64_at(&boot, 48);
        // Signed: positive counts clusters, negative is 2^|n| bytes.
        let raw = boot[64] as i8;
        let record_size = if raw >= 0 {
            raw as usize * bytes_per_sector * sectors_per_cluster
        } else {
            1usize << (-raw as u32)
        };
        if record_size == 0 || record_size > 64 * 1024 {
            return Err(FsError::InvalidSuperblock);
        }

        let layout = Layout {
            bytes_per_sector,
            sectors_per_cluster,
            mft_lcn,
            record_size,
        };

        let fs = Self {
            dev,
            inner: SpinLock::new(NtfsInner {
                layout,
                mft_runs: Vec::new(),
            }),
        };
        // Bootstrap: record 0 describes the MFT itself. Until its runs
        // are known, records are read assuming the MFT is contiguous at
        // mft_lcn.
        let mft_record = {
            let inner = fs.inner.lock();
            fs.read_record(&inner, MFT_RECORD_MFT)?
        };
        let runs = Self::find_attr(&mft_record, ATTR_DATA)
            .and_then(|a| match a {
                Attr::NonResident { runs, .. } => Some(runs),
                Attr::Resident(_) => None,
            })
            .unwrap_or_default();
        fs.inner.lock().mft_runs = runs;
        Ok(fs)
    }

    /// Number of records the MFT's data can hold.
    fn mft_record_count(inner: &NtfsInner) -> u64 {
        let cb = inner.layout.cluster_bytes() as u64;
        let total: u64 = inner.mft_runs.iter().map(|r| r.clusters).sum();
        if total == 0 {
            MAX_SCAN_RECORDS
        } else {
            (total * cb / inner.layout.record_size as u64).min(MAX_SCAN_RECORDS)
        }
    }

    fn read_clusters(&self, layout: &Layout, lcn: u64, count: usize) -> Result<Vec<u8>, FsError> {
        let cb = layout.cluster_bytes();
        let ssz = self.dev.sector_size();
        let mut buf = vec![0u8; count * cb];
        let lba = lcn * (cb / ssz) as u64;
        self.dev.read_sectors(lba, &mut buf)?;
        Ok(buf)
    }

    fn write_clusters(&self, layout: &Layout, lcn: u64, buf: &[u8]) -> Result<(), FsError> {
        let cb = layout.cluster_bytes();
        let ssz = self.dev.sector_size();
        let lba = lcn * (cb / ssz) as u64;
        self.dev.write_sectors(lba, buf)?;
        Ok(())
    }

    /// Locate MFT record `n`: its first cluster and the byte offset
    /// within it. Before the MFT's own run list is decoded, the MFT is
    /// assumed contiguous at `mft_lcn`.
    fn record_location(&self, inner: &NtfsInner, n: u64) -> Result<(u64, usize), FsError> {
        let layout = &inner.layout;
        let cb = layout.cluster_bytes() as u64;
        let byte_off = n * layout.record_size as u64;
        if inner.mft_runs.is_empty() {
            return Ok((layout.mft_lcn + byte_off / cb, (byte_off % cb) as usize));
        }
        let mut vcn = byte_off / cb;
        let within = (byte_off % cb) as usize;
        for run in &inner.mft_runs {
            if vcn < run.clusters {
                let lcn = run.lcn.ok_or(FsError::Io)?;
                return Ok((lcn + vcn, within));
            }
            vcn -= run.clusters;
        }
        Err(FsError::Io)
    }

    /// Read MFT record `n`, fixup applied.
    fn read_record(&self, inner: &NtfsInner, n: u64) -> Result<Vec<u8>, FsError> {
        let layout = &inner.layout;
        let cb = layout.cluster_bytes();
        let (lcn, within) = self.record_location(inner, n)?;
        let clusters = (within + layout.record_size).div_ceil(cb);
        let data = self.read_clusters(layout, lcn, clusters)?;
        Self::check_record(&data[within..within + layout.record_size])
    }

    /// Write a fixed-up record image back, re-protecting the sector
    /// ends with the update sequence first.
    fn write_record(&self, inner: &NtfsInner, n: u64, rec: &[u8]) -> Result<(), FsError> {
        let layout = &inner.layout;
        let cb = layout.cluster_bytes();
        if rec.len() != layout.record_size {
            return Err(FsError::Io);
        }
        let (lcn, within) = self.record_location(inner, n)?;
        let clusters = (within + layout.record_size).div_ceil(cb);
        let mut data = self.read_clusters(layout, lcn, clusters)?;
        let protected = Self::protect_record(rec);
        data[within..within + layout.record_size].copy_from_slice(&protected);
        self.write_clusters(layout, lcn, &data)
    }

    /// Validate the FILE signature and apply the update sequence fixup.
    fn check_record(raw: &[u8]) -> Result<Vec<u8>, FsError> {
        if &raw[0..4] != b"FILE" {
            return Err(FsError::Io);
        }
        let mut rec = raw.to_vec();
        let usa_off = u16_at(&rec, 4) as usize;
        let usa_count = u16_at(&rec, 6) as usize;
        if usa_count > 1 && usa_off + usa_count * 2 <= rec.len() {
            let usn = [rec[usa_off], rec[usa_off + 1]];
            for i in 1..usa_count {
                let sector_end = i * 512 - 2;
                if sector_end + 2 > rec.len() {
                    break;
                }
                if rec[sector_end] != usn[0] || rec[sector_end + 1] != usn[1] {
                    return Err(FsError::Io);
                }
                rec[sector_end] = rec[usa_off + i * 2];
                rec[sector_end + 1] = rec[usa_off + i * 2 + 1];
            }
        }
        Ok(rec)
    }

    /// Reverse of `check_record`: stash the true sector-end words in the
    /// update sequence array and plant the USN at every sector end, so
    /// the image is valid on disk again.
    fn protect_record(rec_fixed: &[u8]) -> Vec<u8> {
        let mut rec = rec_fixed.to_vec();
        let usa_off = u16_at(&rec, 4) as usize;
        let usa_count = u16_at(&rec, 6) as usize;
        if usa_count > 1 && usa_off + usa_count * 2 <= rec.len() {
            let usn = [rec[usa_off], rec[usa_off + 1]];
            for i in 1..usa_count {
                let sector_end = i * 512 - 2;
                if sector_end + 2 > rec.len() {
                    break;
                }
                rec[usa_off + i * 2] = rec[sector_end];
                rec[usa_off + i * 2 + 1] = rec[sector_end + 1];
                rec[sector_end] = usn[0];
                rec[sector_end + 1] = usn[1];
            }
        }
        rec
    }

    fn record_in_use(rec: &[u8]) -> bool {
        u16_at(rec, 22) & 0x01 != 0
    }

    fn record_is_dir(rec: &[u8]) -> bool {
        u16_at(rec, 22) & 0x02 != 0
    }

    /// Offset of the first attribute of `wanted` type, bounds-checked.
    fn attr_offset(rec: &[u8], wanted: u32) -> Option<usize> {
        let mut off = u16_at(rec, 20) as usize;
        loop {
            if off + 8 > rec.len() {
                return None;
            }
            let attr_type = u32_at(rec, off);
            if attr_type == ATTR_END {
                return None;
            }
            let attr_len = u32_at(rec, off + 4) as usize;
            if attr_len == 0 || off + attr_len > rec.len() {
                return None;
            }
            if attr_type == wanted {
                return Some(off);
            }
            off += attr_len;
        }
    }

    /// Decode the first attribute of `wanted` type in a record.
    fn find_attr(rec: &[u8], wanted: u32) -> Option<Attr> {
        let off = Self::attr_offset(rec, wanted)?;
        let attr_len = u32_at(rec, off + 4) as usize;
        let non_resident = rec[off + 8] != 0;
        if non_resident {
            let data_size = u64_at(rec, off + 48);
            let runs_off = u16_at(rec, off + 32) as usize;
            if off + runs_off <= rec.len() {
                let runs = decode_runs(&rec[off + runs_off..off + attr_len]);
                return Some(Attr::NonResident {
                    size: data_size,
                    runs,
                });
            }
            return None;
        }
        let content_size = u32_at(rec, off + 16) as usize;
        let content_off = u16_at(rec, off + 20) as usize;
        if off + content_off + content_size <= rec.len() {
            return Some(Attr::Resident(
                rec[off + content_off..off + content_off + content_size].to_vec(),
            ));
        }
        None
    }

    /// Byte range of a resident attribute's content within the record.
    fn resident_range(rec: &[u8], wanted: u32) -> Option<(usize, usize)> {
        let off = Self::attr_offset(rec, wanted)?;
        if rec[off + 8] != 0 {
            return None;
        }
        let content_size = u32_at(rec, off + 16) as usize;
        let content_off = u16_at(rec, off + 20) as usize;
        if off + content_off + content_size <= rec.len() {
            Some((off + content_off, content_size))
        } else {
            None
        }
    }

    /// Absolute cluster behind a file-logical cluster, through a run
    /// list. `Some(None)` is a sparse hole.
    fn lcn_of_vcn(runs: &[DataRun], mut vcn: u64) -> Option<Option<u64>> {
        for run in runs {
            if vcn < run.clusters {
                return Some(run.lcn.map(|l| l + vcn));
            }
            vcn -= run.clusters;
        }
        None
    }

    /// Extract (parent record, name) from a $FILE_NAME attribute.
    fn file_name_of(rec: &[u8]) -> Option<(u64, String)> {
        match Self::find_attr(rec, ATTR_FILE_NAME)? {
            Attr::Resident(content) => {
                if content.len() < 66 {
                    return None;
                }
                let parent = u64_at(&content, 0) & 0x0000_FFFF_FFFF_FFFF;
                let name_len = content[64] as usize;
                if 66 + name_len * 2 > content.len() {
                    return None;
                }
                // UTF-16LE, decoded naively: BMP only.
                let mut name = String::new();
                for i in 0..name_len {
                    let c = u16_at(&content, 66 + i * 2);
                    name.push(char::from_u32(c as u32).unwrap_or('?'));
                }
                Some((parent, name))
            }
            Attr::NonResident { .. } => None,
        }
    }

    /// Scan the MFT for children of directory record `parent`.
    fn children_of(&self, inner: &NtfsInner, parent: u64) -> Result<Vec<Found>, FsError> {
        let mut out = Vec::new();
        for n in 0..Self::mft_record_count(inner) {
            // Unformatted or damaged records are simply not anyone's
            // children.
            let Ok(rec) = self.read_record(inner, n) else {
                continue;
            };
            if !Self::record_in_use(&rec) || n == parent {
                continue;
            }
            if let Some((p, name)) = Self::file_name_of(&rec) {
                if p == parent && !name.starts_with('$') && name != "." {
                    out.push(Found {
                        record: n,
                        name,
                        is_dir: Self::record_is_dir(&rec),
                    });
                }
            }
        }
        Ok(out)
    }

    fn lookup(&self, inner: &NtfsInner, path: &str) -> Result<Found, FsError> {
        let mut cur = Found {
            record: MFT_RECORD_ROOT,
            name: String::from("/"),
            is_dir: true,
        };
        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if !cur.is_dir {
                return Err(FsError::NotADirectory);
            }
            cur = self
                .children_of(inner, cur.record)?
                .into_iter()
                .find(|f| f.name.eq_ignore_ascii_case(comp))
                .ok_or(FsError::NotFound)?;
        }
        Ok(cur)
    }

    /// Read a file's $DATA content.
    fn read_data(&self, inner: &NtfsInner, record: u64) -> Result<Vec<u8>, FsError> {
        let rec = self.read_record(inner, record)?;
        match Self::find_attr(&rec, ATTR_DATA).ok_or(FsError::Io)? {
            Attr::Resident(content) => Ok(content),
            Attr::NonResident { size, runs } => {
                let cb = inner.layout.cluster_bytes();
                let mut out = Vec::with_capacity(size as usize);
                for run in &runs {
                    match run.lcn {
                        Some(lcn) => {
                            let data =
                                self.read_clusters(&inner.layout, lcn, run.clusters as usize)?;
                            out.extend_from_slice(&data);
                        }
                        None => out.extend(core::iter::repeat_n(0u8, run.clusters as usize * cb)),
                    }
                }
                out.truncate(size as usize);
                Ok(out)
            }
        }
    }
}

enum Attr {
    Resident(Vec<u8>),
    NonResident { size: u64, runs: Vec<DataRun> },
}

impl FileSystem for NtfsFs {
    fn fs_name(&self) -> &'static str {
        "ntfs"
    }

    fn read(&self, path: &str, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let inner = self.inner.lock();
        let found = self.lookup(&inner, path)?;
        if found.is_dir {
            return Err(FsError::IsADirectory);
        }
        let data = self.read_data(&inner, found.record)?;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, path: &str, offset: usize, data: &[u8]) -> Result<usize, FsError> {
        if data.is_empty() {
            return Ok(0);
        }
        let inner = self.inner.lock();
        let found = self.lookup(&inner, path)?;
        if found.is_dir {
            return Err(FsError::IsADirectory);
        }
        let rec = self.read_record(&inner, found.record)?;
        match Self::find_attr(&rec, ATTR_DATA).ok_or(FsError::Io)? {
            Attr::Resident(content) => {
                // Overwrite-in-place: no attribute growth in this driver.
                if offset + data.len() > content.len() {
                    return Err(FsError::Full);
                }
                let (start, _) = Self::resident_range(&rec, ATTR_DATA).ok_or(FsError::Io)?;
                let mut updated = rec.clone();
                updated[start + offset..start + offset + data.len()].copy_from_slice(data);
                self.write_record(&inner, found.record, &updated)?;
            }
            Attr::NonResident { size, runs } => {
                if offset as u64 + data.len() as u64 > size {
                    return Err(FsError::Full);
                }
                let cb = inner.layout.cluster_bytes();
                let mut done = 0usize;
                while done < data.len() {
                    let pos = offset + done;
                    let lcn = match Self::lcn_of_vcn(&runs, (pos / cb) as u64) {
                        Some(Some(l)) => l,
                        // Filling a sparse hole would need allocation.
                        Some(None) => return Err(FsError::Full),
                        None => return Err(FsError::Io),
                    };
                    let within = pos % cb;
                    let n = (cb - within).min(data.len() - done);
                    let mut cluster = self.read_clusters(&inner.layout, lcn, 1)?;
                    cluster[within..within + n].copy_from_slice(&data[done..done + n]);
                    self.write_clusters(&inner.layout, lcn, &cluster)?;
                    done += n;
                }
            }
        }
        Ok(data.len())
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let inner = self.inner.lock();
        let found = self.lookup(&inner, path)?;
        if !found.is_dir {
            return Err(FsError::NotADirectory);
        }
        let mut out = Vec::new();
        for child in self.children_of(&inner, found.record)? {
            let size = if child.is_dir {
                0
            } else {
                self.read_data(&inner, child.record)
                    .map(|d| d.len())
                    .unwrap_or(0)
            };
            out.push(DirEntry {
                name: child.name,
                kind: if child.is_dir {
                    NodeKind::Directory
                } else {
                    NodeKind::File
                },
                size,
            });
        }
        Ok(out)
    }

    fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        let inner = self.inner.lock();
        Ok(self.lookup(&inner, path)?.is_dir)
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
        let inner = self.inner.lock();
        let found = self.lookup(&inner, path)?;
        if found.is_dir {
            return Err(FsError::IsADirectory);
        }
        Ok(self.read_data(&inner, found.record)?.len())
    }
}
