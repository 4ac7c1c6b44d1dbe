//! Virtual filesystem layer.
//!
//! The VFS binds path prefixes to filesystem drivers through a mount
//! table with longest-prefix matching, and forwards each operation with
//! the driver-local remainder of the path. Drivers are trait objects;
//! each backend is a concrete type with its own interior locking.

pub mod blockdev;
pub mod devfs;
pub mod ext2;
pub mod fat;
pub mod file;
pub mod iso9660;
pub mod ntfs;
pub mod procfs;
pub mod ramfs;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::FsError;
use crate::sync::SpinLock;

/// Maximum accepted path length.
pub const PATH_MAX: usize = 1024;

/// What a directory entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub size: usize,
}

/// The filesystem driver interface. Paths are absolute within the
/// mount (`/` is the mount root). Implementations must be callable
/// concurrently; per-device serialization is theirs to provide.
pub trait FileSystem: Send + Sync {
    fn fs_name(&self) -> &'static str;

    fn read_only(&self) -> bool {
        false
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns bytes read;
    /// 0 at or past end of file.
    fn read(&self, path: &str, offset: usize, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Write at `offset`, growing the file if the backend supports it.
    fn write(&self, path: &str, offset: usize, data: &[u8]) -> Result<usize, FsError>;

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError>;

    fn is_dir(&self, path: &str) -> Result<bool, FsError>;

    fn create_file(&self, path: &str) -> Result<(), FsError>;

    fn create_dir(&self, path: &str) -> Result<(), FsError>;

    /// Delete a file or directory. Non-empty directories require
    /// `recursive`.
    fn delete(&self, path: &str, recursive: bool) -> Result<(), FsError>;

    fn size(&self, path: &str) -> Result<usize, FsError>;

    fn sync(&self) -> Result<(), FsError> {
        Ok(())
    }
}

struct Mount {
    prefix: String,
    fs: Arc<dyn FileSystem>,
}

/// The mount table.
pub struct Vfs {
    mounts: Vec<Mount>,
}

fn normalize_prefix(prefix: &str) -> Result<String, FsError> {
    if !prefix.starts_with('/') || prefix.len() > PATH_MAX {
        return Err(FsError::InvalidPath);
    }
    if prefix == "/" {
        return Ok(String::from("/"));
    }
    Ok(prefix.trim_end_matches('/').to_string())
}

fn check_path(path: &str) -> Result<(), FsError> {
    if !path.starts_with('/') || path.len() > PATH_MAX {
        return Err(FsError::InvalidPath);
    }
    Ok(())
}

impl Vfs {
    pub const fn new() -> Self {
        Self { mounts: Vec::new() }
    }

    /// Bind `fs` at `prefix`.
    pub fn mount(&mut self, prefix: &str, fs: Arc<dyn FileSystem>) -> Result<(), FsError> {
        let prefix = normalize_prefix(prefix)?;
        if self.mounts.iter().any(|m| m.prefix == prefix) {
            return Err(FsError::AlreadyExists);
        }
        self.mounts.push(Mount { prefix, fs });
        Ok(())
    }

    pub fn unmount(&mut self, prefix: &str) -> Result<(), FsError> {
        let prefix = normalize_prefix(prefix)?;
        let before = self.mounts.len();
        self.mounts.retain(|m| m.prefix != prefix);
        if self.mounts.len() == before {
            return Err(FsError::NotMounted);
        }
        Ok(())
    }

    /// Longest-prefix match: returns the driver and the local path it
    /// should see.
    pub fn resolve(&self, path: &str) -> Result<(Arc<dyn FileSystem>, String), FsError> {
        check_path(path)?;
        let mut best: Option<&Mount> = None;
        for m in &self.mounts {
            let matches = if m.prefix == "/" {
                true
            } else {
                path == m.prefix || path.starts_with(&alloc::format!("{}/", m.prefix))
            };
            if matches && best.is_none_or(|b| m.prefix.len() > b.prefix.len()) {
                best = Some(m);
            }
        }
        let m = best.ok_or(FsError::NotMounted)?;
        let local = if m.prefix == "/" {
            path.to_string()
        } else {
            let rest = &path[m.prefix.len()..];
            if rest.is_empty() {
                String::from("/")
            } else {
                rest.to_string()
            }
        };
        Ok((m.fs.clone(), local))
    }

    pub fn mount_points(&self) -> Vec<(String, &'static str)> {
        self.mounts
            .iter()
            .map(|m| (m.prefix.clone(), m.fs.fs_name()))
            .collect()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

/// Global mount table. Fifth in the kernel lock order; driver-internal
/// locks and the block registry nest inside it.
pub static VFS: SpinLock<Vfs> = SpinLock::new(Vfs::new());

fn with_fs<T>(
    path: &str,
    op: impl FnOnce(Arc<dyn FileSystem>, &str) -> Result<T, FsError>,
) -> Result<T, FsError> {
    let (fs, local) = VFS.lock().resolve(path)?;
    // The mount-table lock is released before the driver runs; drivers
    // may block on device I/O.
    op(fs, &local)
}

/// Mount into the global table.
pub fn mount(prefix: &str, fs: Arc<dyn FileSystem>) -> Result<(), FsError> {
    VFS.lock().mount(prefix, fs)
}

pub fn unmount(prefix: &str) -> Result<(), FsError> {
    VFS.lock().unmount(prefix)
}

pub fn read(path: &str, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
    with_fs(path, |fs, local| fs.read(local, offset, buf))
}

pub fn write(path: &str, offset: usize, data: &[u8]) -> Result<usize, FsError> {
    with_fs(path, |fs, local| {
        if fs.read_only() {
            return Err(FsError::ReadOnly);
        }
        fs.write(local, offset, data)
    })
}

pub fn list_dir(path: &str) -> Result<Vec<DirEntry>, FsError> {
    with_fs(path, |fs, local| fs.list_dir(local))
}

pub fn is_dir(path: &str) -> Result<bool, FsError> {
    with_fs(path, |fs, local| fs.is_dir(local))
}

pub fn create_file(path: &str) -> Result<(), FsError> {
    with_fs(path, |fs, local| fs.create_file(local))
}

pub fn create_dir(path: &str) -> Result<(), FsError> {
    with_fs(path, |fs, local| fs.create_dir(local))
}

pub fn delete(path: &str, recursive: bool) -> Result<(), FsError> {
    with_fs(path, |fs, local| fs.delete(local, recursive))
}

pub fn size(path: &str) -> Result<usize, FsError> {
    with_fs(path, |fs, local| fs.size(local))
}

pub fn exists(path: &str) -> bool {
    size(path).is_ok() || is_dir(path).is_ok()
}

/// Read a whole file.
pub fn read_file(path: &str) -> Result<Vec<u8>, FsError> {
    let len = size(path)?;
    let mut buf = alloc::vec![0u8; len];
    let n = read(path, 0, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

/// Mount the standard boot filesystems: ramfs root, devfs, procfs.
pub fn init() {
    let root = Arc::new(ramfs::RamFs::new());
    mount("/", root).expect("mount root");
    for dir in ["/bin", "/dev", "/proc", "/tmp", "/mnt"] {
        let _ = create_dir(dir);
    }
    mount("/dev", Arc::new(devfs::DevFs::new())).expect("mount devfs");
    mount("/proc", Arc::new(procfs::ProcFs::new())).expect("mount procfs");
    log::info!("vfs online: ramfs root, /dev, /proc");
}
