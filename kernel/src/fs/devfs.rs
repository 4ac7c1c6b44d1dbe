//! Device filesystem: exposes registered character devices as files.
//!
//! Reads and writes route straight to the device's ops; the listing is
//! synthesized from the registry. `null` and `zero` are registered at
//! init so the mount is never empty.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::FsError;
use crate::sync::SpinLock;

use super::{DirEntry, FileSystem, NodeKind};

/// A character device.
pub trait CharDevice: Send + Sync {
    fn name(&self) -> &str;
    fn read(&self, buf: &mut [u8]) -> usize;
    fn write(&self, data: &[u8]) -> usize;
}

/// `/dev/null`: reads nothing, swallows everything.
pub struct NullDevice;

impl CharDevice for NullDevice {
    fn name(&self) -> &str {
        "null"
    }

    fn read(&self, _buf: &mut [u8]) -> usize {
        0
    }

    fn write(&self, data: &[u8]) -> usize {
        data.len()
    }
}

/// `/dev/zero`: endless zeroes.
pub struct ZeroDevice;

impl CharDevice for ZeroDevice {
    fn name(&self) -> &str {
        "zero"
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        buf.fill(0);
        buf.len()
    }

    fn write(&self, data: &[u8]) -> usize {
        data.len()
    }
}

/// Global character device registry.
static CHAR_DEVICES: SpinLock<Vec<Arc<dyn CharDevice>>> = SpinLock::new(Vec::new());

/// Register a character device. Duplicate names are rejected.
pub fn register_char_device(dev: Arc<dyn CharDevice>) -> Result<(), FsError> {
    let mut devs = CHAR_DEVICES.lock();
    if devs.iter().any(|d| d.name() == dev.name()) {
        return Err(FsError::AlreadyExists);
    }
    devs.push(dev);
    Ok(())
}

fn find_device(name: &str) -> Option<Arc<dyn CharDevice>> {
    CHAR_DEVICES.lock().iter().find(|d| d.name() == name).cloned()
}

/// The /dev filesystem.
pub struct DevFs;

impl DevFs {
    pub fn new() -> Self {
        // The standard pair is always present; re-registration after a
        // remount is harmless.
        let _ = register_char_device(Arc::new(NullDevice));
        let _ = register_char_device(Arc::new(ZeroDevice));
        Self
    }

    fn device_of(path: &str) -> Result<Arc<dyn CharDevice>, FsError> {
        let name = path.trim_start_matches('/');
        if name.is_empty() || name.contains('/') {
            return Err(FsError::NotFound);
        }
        find_device(name).ok_or(FsError::NotFound)
    }
}

impl Default for DevFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for DevFs {
    fn fs_name(&self) -> &'static str {
        "devfs"
    }

    fn read(&self, path: &str, _offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        Ok(Self::device_of(path)?.read(buf))
    }

    fn write(&self, path: &str, _offset: usize, data: &[u8]) -> Result<usize, FsError> {
        Ok(Self::device_of(path)?.write(data))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        if path.trim_matches('/') != "" {
            return Err(FsError::NotADirectory);
        }
        Ok(CHAR_DEVICES
            .lock()
            .iter()
            .map(|d| DirEntry {
                name: d.name().to_string(),
                kind: NodeKind::File,
                size: 0,
            })
            .collect())
    }

    fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        if path.trim_matches('/') == "" {
            return Ok(true);
        }
        Self::device_of(path).map(|_| false)
    }

    fn create_file(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn create_dir(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn delete(&self, _path: &str, _recursive: bool) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn size(&self, path: &str) -> Result<usize, FsError> {
        Self::device_of(path).map(|_| 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoDevice {
        last: SpinLock<Vec<u8>>,
    }

    impl CharDevice for EchoDevice {
        fn name(&self) -> &str {
            "echo"
        }

        fn read(&self, buf: &mut [u8]) -> usize {
            let last = self.last.lock();
            let n = buf.len().min(last.len());
            buf[..n].copy_from_slice(&last[..n]);
            n
        }

        fn write(&self, data: &[u8]) -> usize {
            *self.last.lock() = data.to_vec();
            data.len()
        }
    }

    #[test]
    fn test_null_and_zero() {
        let fs = DevFs::new();
        let mut buf = [0xFFu8; 8];
        assert_eq!(fs.read("/null", 0, &mut buf).unwrap(), 0);
        assert_eq!(fs.write("/null", 0, b"discard").unwrap(), 7);
        assert_eq!(fs.read("/zero", 0, &mut buf).unwrap(), 8);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_listing_contains_standard_devices() {
        let fs = DevFs::new();
        let names: Vec<String> = fs
            .list_dir("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(names.contains(&"null".to_string()));
        assert!(names.contains(&"zero".to_string()));
    }

    #[test]
    fn test_custom_device_round_trip() {
        let fs = DevFs::new();
        let _ = register_char_device(Arc::new(EchoDevice {
            last: SpinLock::new(Vec::new()),
        }));
        fs.write("/echo", 0, b"ping").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read("/echo", 0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_unknown_device() {
        let fs = DevFs::new();
        let mut buf = [0u8; 1];
        assert_eq!(fs.read("/nosuch", 0, &mut buf), Err(FsError::NotFound));
    }

    #[test]
    fn test_namespace_is_flat() {
        let fs = DevFs::new();
        assert!(fs.is_dir("/").unwrap());
        assert!(!fs.is_dir("/null").unwrap());
        assert_eq!(fs.create_file("/x"), Err(FsError::NotSupported));
        let mut buf = [0u8; 1];
        assert_eq!(fs.read("/a/b", 0, &mut buf), Err(FsError::NotFound));
    }
}
