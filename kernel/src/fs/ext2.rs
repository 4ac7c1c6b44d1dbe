//! ext2 filesystem driver.
//!
//! Reads the superblock, group descriptors, and inode tables; file data
//! resolves through the 12 direct pointers plus single and double
//! indirection. Writes are overwrite-in-place only: the driver will
//! rewrite bytes inside a file's existing extent but does not allocate
//! blocks, so growth reports `Full` and namespace changes report
//! `ReadOnly`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::FsError;
use crate::sync::SpinLock;

use super::blockdev::BlockDevice;
use super::{DirEntry, FileSystem, NodeKind};

const EXT2_MAGIC: u16 = 0xEF53;
const ROOT_INO: u32 = 2;

const MODE_DIR: u16 = 0x4000;
const MODE_REG: u16 = 0x8000;

#[derive(Debug, Clone, Copy)]
struct Superblock {
    inodes_count: u32,
    blocks_count: u32,
    first_data_block: u32,
    block_size: usize,
    blocks_per_group: u32,
    inodes_per_group: u32,
    inode_size: usize,
}

#[derive(Debug, Clone, Copy)]
struct Inode {
    mode: u16,
    size: u32,
    block: [u32; 15],
}

impl Inode {
    fn is_dir(&self) -> bool {
        self.mode & 0xF000 == MODE_DIR
    }

    fn is_file(&self) -> bool {
        self.mode & 0xF000 == MODE_REG
    }
}

struct Ext2Inner {
    sb: Superblock,
}

pub struct Ext2Fs {
    dev: Arc<dyn BlockDevice>,
    inner: SpinLock<Ext2Inner>,
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

impl Ext2Fs {
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Self, FsError> {
        // The superblock always lives at byte offset 1024.
        let ssz = dev.sector_size();
        let sectors = 1024usize.div_ceil(ssz).max(1);
        let mut buf = vec![0u8; sectors.max(2) * ssz];
        let start_sector = (1024 / ssz) as u64;
        let in_sector = 1024 % ssz;
        dev.read_sectors(start_sector, &mut buf)?;
        let sb_raw = &buf[in_sector..];
        if sb_raw.len() < 128 {
            return Err(FsError::InvalidSuperblock);
        }

        if u16_at(sb_raw, 56) != EXT2_MAGIC {
            return Err(FsError::InvalidSuperblock);
        }
        let log_block_size = u32_at(sb_raw, 24);
        if log_block_size > 6 {
            return Err(FsError::InvalidSuperblock);
        }
        let rev = u32_at(sb_raw, 76);
        let sb = Superblock {
            inodes_count: u32_at(sb_raw, 0),
            blocks_count: u32_at(sb_raw, 4),
            first_data_block: u32_at(sb_raw, 20),
            block_size: 1024usize << log_block_size,
            blocks_per_group: u32_at(sb_raw, 32),
            inodes_per_group: u32_at(sb_raw, 40),
            inode_size: if rev >= 1 { u16_at(sb_raw, 88) as usize } else { 128 },
        };
        if sb.inodes_per_group == 0 || sb.blocks_per_group == 0 || sb.inode_size < 128 {
            return Err(FsError::InvalidSuperblock);
        }

        Ok(Self {
            dev,
            inner: SpinLock::new(Ext2Inner { sb }),
        })
    }

    fn read_block(&self, sb: &Superblock, block: u32) -> Result<Vec<u8>, FsError> {
        if block >= sb.blocks_count {
            return Err(FsError::Io);
        }
        let ssz = self.dev.sector_size();
        let mut buf = vec![0u8; sb.block_size];
        let lba = (block as u64 * sb.block_size as u64) / ssz as u64;
        self.dev.read_sectors(lba, &mut buf)?;
        Ok(buf)
    }

    fn write_block(&self, sb: &Superblock, block: u32, data: &[u8]) -> Result<(), FsError> {
        if block >= sb.blocks_count || data.len() != sb.block_size {
            return Err(FsError::Io);
        }
        let ssz = self.dev.sector_size();
        let lba = (block as u64 * sb.block_size as u64) / ssz as u64;
        self.dev.write_sectors(lba, data)?;
        Ok(())
    }

    /// Locate and decode inode `ino` (1-based).
    fn inode(&self, sb: &Superblock, ino: u32) -> Result<Inode, FsError> {
        if ino == 0 || ino > sb.inodes_count {
            return Err(FsError::NotFound);
        }
        let index = ino - 1;
        let group = index / sb.inodes_per_group;
        let within = (index % sb.inodes_per_group) as usize;

        // Group descriptor table starts in the block after the
        // superblock's block.
        let gdt_block = sb.first_data_block + 1;
        let gdt = self.read_block(sb, gdt_block + (group * 32 / sb.block_size as u32))?;
        let desc_off = (group as usize * 32) % sb.block_size;
        let inode_table = u32_at(&gdt, desc_off + 8);

        let byte_off = within * sb.inode_size;
        let block = inode_table + (byte_off / sb.block_size) as u32;
        let data = self.read_block(sb, block)?;
        let off = byte_off % sb.block_size;
        if off + 128 > data.len() {
            return Err(FsError::Io);
        }

        let mut blocks = [0u32; 15];
        for (i, b) in blocks.iter_mut().enumerate() {
            *b = u32_at(&data, off + 40 + i * 4);
        }
        Ok(Inode {
            mode: u16_at(&data, off),
            size: u32_at(&data, off + 4),
            block: blocks,
        })
    }

    /// Resolve logical block `idx` of a file through direct, single,
    /// and double indirect pointers.
    fn file_block(&self, sb: &Superblock, inode: &Inode, idx: usize) -> Result<u32, FsError> {
        let per_block = sb.block_size / 4;
        if idx < 12 {
            return Ok(inode.block[idx]);
        }
        let idx = idx - 12;
        if idx < per_block {
            let ind = self.read_block(sb, inode.block[12])?;
            return Ok(u32_at(&ind, idx * 4));
        }
        let idx = idx - per_block;
        if idx < per_block * per_block {
            let dbl = self.read_block(sb, inode.block[13])?;
            let ind_block = u32_at(&dbl, (idx / per_block) * 4);
            let ind = self.read_block(sb, ind_block)?;
            return Ok(u32_at(&ind, (idx % per_block) * 4));
        }
        // Triple indirection is beyond this driver.
        Err(FsError::NotSupported)
    }

    /// Iterate a directory inode's entries as (ino, kind hint, name).
    fn dir_entries(&self, sb: &Superblock, inode: &Inode) -> Result<Vec<(u32, String)>, FsError> {
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let mut out = Vec::new();
        let blocks = (inode.size as usize).div_ceil(sb.block_size);
        for b in 0..blocks {
            let block = self.file_block(sb, inode, b)?;
            if block == 0 {
                continue;
            }
            let data = self.read_block(sb, block)?;
            let mut off = 0usize;
            while off + 8 <= data.len() {
                let ino = u32_at(&data, off);
                let rec_len = u16_at(&data, off + 2) as usize;
                let name_len = data[off + 4] as usize;
                if rec_len < 8 || off + rec_len > data.len() {
                    break;
                }
                if ino != 0 && name_len > 0 && off + 8 + name_len <= data.len() {
                    let name = core::str::from_utf8(&data[off + 8..off + 8 + name_len])
                        .unwrap_or("")
                        .into();
                    out.push((ino, name));
                }
                off += rec_len;
            }
        }
        Ok(out)
    }

    /// Walk `path` to its inode number.
    fn lookup(&self, sb: &Superblock, path: &str) -> Result<u32, FsError> {
        let mut ino = ROOT_INO;
        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            let node = self.inode(sb, ino)?;
            let entries = self.dir_entries(sb, &node)?;
            ino = entries
                .iter()
                .find(|(_, name)| name == comp)
                .map(|(i, _)| *i)
                .ok_or(FsError::NotFound)?;
        }
        Ok(ino)
    }
}

impl FileSystem for Ext2Fs {
    fn fs_name(&self) -> &'static str {
        "ext2"
    }

    fn read(&self, path: &str, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let inner = self.inner.lock();
        let sb = inner.sb;
        let inode = self.inode(&sb, self.lookup(&sb, path)?)?;
        if !inode.is_file() {
            return Err(FsError::IsADirectory);
        }
        let size = inode.size as usize;
        if offset >= size {
            return Ok(0);
        }
        let want = buf.len().min(size - offset);
        let mut done = 0usize;
        while done < want {
            let pos = offset + done;
            let block = self.file_block(&sb, &inode, pos / sb.block_size)?;
            let within = pos % sb.block_size;
            let n = (sb.block_size - within).min(want - done);
            if block == 0 {
                // Sparse hole.
                buf[done..done + n].fill(0);
            } else {
                let data = self.read_block(&sb, block)?;
                buf[done..done + n].copy_from_slice(&data[within..within + n]);
            }
            done += n;
        }
        Ok(done)
    }

    fn write(&self, path: &str, offset: usize, data: &[u8]) -> Result<usize, FsError> {
        let inner = self.inner.lock();
        let sb = inner.sb;
        let inode = self.inode(&sb, self.lookup(&sb, path)?)?;
        if !inode.is_file() {
            return Err(FsError::IsADirectory);
        }
        // Overwrite-in-place only: no block allocation in this driver.
        if offset + data.len() > inode.size as usize {
            return Err(FsError::Full);
        }
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done;
            let block = self.file_block(&sb, &inode, pos / sb.block_size)?;
            if block == 0 {
                return Err(FsError::Full);
            }
            let within = pos % sb.block_size;
            let n = (sb.block_size - within).min(data.len() - done);
            let mut page = self.read_block(&sb, block)?;
            page[within..within + n].copy_from_slice(&data[done..done + n]);
            self.write_block(&sb, block, &page)?;
            done += n;
        }
        Ok(done)
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let inner = self.inner.lock();
        let sb = inner.sb;
        let dir = self.inode(&sb, self.lookup(&sb, path)?)?;
        let mut out = Vec::new();
        for (ino, name) in self.dir_entries(&sb, &dir)? {
            if name == "." || name == ".." {
                continue;
            }
            let node = self.inode(&sb, ino)?;
            out.push(DirEntry {
                name,
                kind: if node.is_dir() {
                    NodeKind::Directory
                } else {
                    NodeKind::File
                },
                size: node.size as usize,
            });
        }
        Ok(out)
    }

    fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        let inner = self.inner.lock();
        let sb = inner.sb;
        Ok(self.inode(&sb, self.lookup(&sb, path)?)?.is_dir())
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
        let sb = inner.sb;
        let inode = self.inode(&sb, self.lookup(&sb, path)?)?;
        if !inode.is_file() {
            return Err(FsError::IsADirectory);
        }
        Ok(inode.size as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::super::blockdev::RamDisk;
    use super::*;

    /// Hand-built miniature ext2 volume: 1 KiB blocks, one group.
    ///
    /// Block map: 0 boot, 1 superblock, 2 group descriptors, 3 block
    /// bitmap, 4 inode bitmap, 5..6 inode table (16 inodes x 128 B),
    /// 7 root dir, 8 file data, 9 single-indirect table, 10.. big file.
    fn build_image() -> RamDisk {
        const BLOCKS: u32 = 32;
        let disk = RamDisk::new("ext0", (BLOCKS as u64) * 2, 512);

        let mut sb = vec![0u8; 1024];
        sb[0..4].copy_from_slice(&16u32.to_le_bytes()); // inodes
        sb[4..8].copy_from_slice(&BLOCKS.to_le_bytes()); // blocks
        sb[20..24].copy_from_slice(&1u32.to_le_bytes()); // first data block
        sb[24..28].copy_from_slice(&0u32.to_le_bytes()); // log block size
        sb[32..36].copy_from_slice(&BLOCKS.to_le_bytes()); // blocks/group
        sb[40..44].copy_from_slice(&16u32.to_le_bytes()); // inodes/group
        sb[56..58].copy_from_slice(&EXT2_MAGIC.to_le_bytes());
        sb[76..80].copy_from_slice(&1u32.to_le_bytes()); // rev
        sb[88..90].copy_from_slice(&128u16.to_le_bytes()); // inode size
        disk.write_sectors(2, &sb).unwrap();

        // Group descriptor: inode table at block 5.
        let mut gdt = vec![0u8; 1024];
        gdt[8..12].copy_from_slice(&5u32.to_le_bytes());
        disk.write_sectors(4, &gdt).unwrap();

        let mut itable = vec![0u8; 2048];
        let mut put_inode = |slot: usize, mode: u16, size: u32, blocks: &[u32]| {
            let off = slot * 128;
            itable[off..off + 2].copy_from_slice(&mode.to_le_bytes());
            itable[off + 4..off + 8].copy_from_slice(&size.to_le_bytes());
            for (i, &b) in blocks.iter().enumerate() {
                itable[off + 40 + i * 4..off + 44 + i * 4].copy_from_slice(&b.to_le_bytes());
            }
        };
        // Root (ino 2, slot 1): dir, one data block at 7.
        put_inode(1, MODE_DIR | 0o755, 1024, &[7]);
        // hello.txt (ino 12, slot 11): 13 bytes in block 8.
        put_inode(11, MODE_REG | 0o644, 13, &[8]);
        // big.bin (ino 13, slot 12): 13 KiB -> 12 direct + 1 indirect.
        let mut big_blocks = [0u32; 13];
        for (i, b) in big_blocks.iter_mut().enumerate().take(12) {
            *b = 10 + i as u32;
        }
        big_blocks[12] = 9; // single-indirect table
        put_inode(12, MODE_REG | 0o644, 13 * 1024, &big_blocks);
        // subdir (ino 14, slot 13): dir with data block 22.
        put_inode(13, MODE_DIR | 0o755, 1024, &[22]);
        disk.write_sectors(10, &itable).unwrap();

        // Root directory entries.
        let mut dir = vec![0u8; 1024];
        let mut off = 0usize;
        let mut put_entry = |buf: &mut [u8], off: &mut usize, ino: u32, name: &str, last: bool| {
            let rec = if last {
                1024 - *off
            } else {
                8 + name.len().div_ceil(4) * 4
            };
            buf[*off..*off + 4].copy_from_slice(&ino.to_le_bytes());
            buf[*off + 4..*off + 6].copy_from_slice(&(rec as u16).to_le_bytes());
            buf[*off + 6] = name.len() as u8;
            buf[*off + 7] = 0;
            buf[*off + 8..*off + 8 + name.len()].copy_from_slice(name.as_bytes());
            *off += rec;
        };
        put_entry(&mut dir, &mut off, 2, ".", false);
        put_entry(&mut dir, &mut off, 2, "..", false);
        put_entry(&mut dir, &mut off, 12, "hello.txt", false);
        put_entry(&mut dir, &mut off, 13, "big.bin", false);
        put_entry(&mut dir, &mut off, 14, "subdir", true);
        disk.write_sectors(14, &dir).unwrap();

        // hello.txt data.
        let mut data = vec![0u8; 1024];
        data[..13].copy_from_slice(b"hello, ext2!\n");
        disk.write_sectors(16, &data).unwrap();

        // Indirect table for big.bin: block 23 as its 13th block.
        let mut ind = vec![0u8; 1024];
        ind[0..4].copy_from_slice(&23u32.to_le_bytes());
        disk.write_sectors(18, &ind).unwrap();

        // big.bin contents: block index stamped in each block.
        for i in 0..12u32 {
            let mut blk = vec![(i + 1) as u8; 1024];
            blk[0] = 0xB0;
            disk.write_sectors(((10 + i) * 2) as u64, &blk).unwrap();
        }
        let mut last = vec![13u8; 1024];
        last[0] = 0xB0;
        disk.write_sectors(46, &last).unwrap();

        // subdir entries: one file "inner" -> reuse hello's inode.
        let mut sdir = vec![0u8; 1024];
        let mut soff = 0usize;
        put_entry(&mut sdir, &mut soff, 14, ".", false);
        put_entry(&mut sdir, &mut soff, 2, "..", false);
        put_entry(&mut sdir, &mut soff, 12, "inner", true);
        disk.write_sectors(44, &sdir).unwrap();

        disk
    }

    fn mounted() -> Ext2Fs {
        Ext2Fs::mount(Arc::new(build_image())).unwrap()
    }

    #[test]
    fn test_mount_validates_magic() {
        let junk = Arc::new(RamDisk::new("junk", 64, 512));
        assert!(Ext2Fs::mount(junk).is_err());
        assert!(Ext2Fs::mount(Arc::new(build_image())).is_ok());
    }

    #[test]
    fn test_read_file() {
        let fs = mounted();
        let mut buf = [0u8; 32];
        let n = fs.read("/hello.txt", 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello, ext2!\n");
        assert_eq!(fs.size("/hello.txt").unwrap(), 13);
    }

    #[test]
    fn test_read_at_offset() {
        let fs = mounted();
        let mut buf = [0u8; 5];
        let n = fs.read("/hello.txt", 7, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ext2!");
    }

    #[test]
    fn test_list_root() {
        let fs = mounted();
        let entries = fs.list_dir("/").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"hello.txt"));
        assert!(names.contains(&"big.bin"));
        assert!(names.contains(&"subdir"));
        let sub = entries.iter().find(|e| e.name == "subdir").unwrap();
        assert_eq!(sub.kind, NodeKind::Directory);
    }

    #[test]
    fn test_subdirectory_walk() {
        let fs = mounted();
        assert!(fs.is_dir("/subdir").unwrap());
        let mut buf = [0u8; 13];
        let n = fs.read("/subdir/inner", 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello, ext2!\n");
    }

    #[test]
    fn test_single_indirect_blocks() {
        let fs = mounted();
        assert_eq!(fs.size("/big.bin").unwrap(), 13 * 1024);
        // The 13th kilobyte resolves through the indirect table.
        let mut buf = [0u8; 16];
        let n = fs.read("/big.bin", 12 * 1024 + 1, &mut buf).unwrap();
        assert_eq!(n, 16);
        assert!(buf.iter().all(|&b| b == 13));
        // And the marker byte at the block boundary.
        let mut marker = [0u8; 1];
        fs.read("/big.bin", 12 * 1024, &mut marker).unwrap();
        assert_eq!(marker[0], 0xB0);
    }

    #[test]
    fn test_overwrite_in_place() {
        let fs = mounted();
        fs.write("/hello.txt", 0, b"HELLO").unwrap();
        let mut buf = [0u8; 13];
        fs.read("/hello.txt", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"HELLO, ext2!\n");
    }

    #[test]
    fn test_growth_rejected() {
        let fs = mounted();
        assert_eq!(fs.write("/hello.txt", 10, b"too long"), Err(FsError::Full));
    }

    #[test]
    fn test_namespace_changes_rejected() {
        let fs = mounted();
        assert_eq!(fs.create_file("/new"), Err(FsError::ReadOnly));
        assert_eq!(fs.create_dir("/newdir"), Err(FsError::ReadOnly));
        assert_eq!(fs.delete("/hello.txt", false), Err(FsError::ReadOnly));
    }

    #[test]
    fn test_missing_file() {
        let fs = mounted();
        assert_eq!(fs.size("/absent"), Err(FsError::NotFound));
    }
}
