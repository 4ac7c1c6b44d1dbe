//! Per-process file descriptors.
//!
//! A descriptor is a small integer naming an open (path, position)
//! pair. Descriptors 0/1/2 are reserved for the console; the table
//! holds 256 entries per process.

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::FsError;

/// Descriptor table size.
pub const MAX_DESCRIPTORS: usize = 256;

/// First descriptor available to `open` (0/1/2 are console).
pub const FIRST_FREE_FD: usize = 3;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
        const CREATE = 1 << 3;
    }
}

/// One open file.
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub path: String,
    pub position: usize,
    pub flags: OpenFlags,
}

/// A process's descriptor table.
pub struct FileTable {
    slots: Vec<Option<OpenFile>>,
}

impl FileTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_DESCRIPTORS);
        slots.resize_with(MAX_DESCRIPTORS, || None);
        Self { slots }
    }

    /// Allocate the lowest free descriptor at or above `FIRST_FREE_FD`.
    pub fn open(&mut self, path: String, flags: OpenFlags) -> Result<usize, FsError> {
        let fd = (FIRST_FREE_FD..MAX_DESCRIPTORS)
            .find(|&i| self.slots[i].is_none())
            .ok_or(FsError::TooManyOpenFiles)?;
        self.slots[fd] = Some(OpenFile {
            path,
            position: 0,
            flags,
        });
        Ok(fd)
    }

    pub fn get(&self, fd: usize) -> Result<&OpenFile, FsError> {
        self.slots
            .get(fd)
            .and_then(|s| s.as_ref())
            .ok_or(FsError::BadDescriptor)
    }

    pub fn get_mut(&mut self, fd: usize) -> Result<&mut OpenFile, FsError> {
        self.slots
            .get_mut(fd)
            .and_then(|s| s.as_mut())
            .ok_or(FsError::BadDescriptor)
    }

    pub fn close(&mut self, fd: usize) -> Result<(), FsError> {
        if fd < FIRST_FREE_FD || fd >= MAX_DESCRIPTORS {
            return Err(FsError::BadDescriptor);
        }
        self.slots[fd].take().map(|_| ()).ok_or(FsError::BadDescriptor)
    }

    /// Close everything; part of process teardown.
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut().skip(FIRST_FREE_FD) {
            *slot = None;
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().skip(FIRST_FREE_FD).flatten().count()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;

    #[test]
    fn test_descriptors_start_at_three() {
        let mut t = FileTable::new();
        let fd = t.open("/a".to_string(), OpenFlags::READ).unwrap();
        assert_eq!(fd, 3);
        let fd2 = t.open("/b".to_string(), OpenFlags::READ).unwrap();
        assert_eq!(fd2, 4);
    }

    #[test]
    fn test_close_recycles_lowest() {
        let mut t = FileTable::new();
        let a = t.open("/a".to_string(), OpenFlags::READ).unwrap();
        let _b = t.open("/b".to_string(), OpenFlags::READ).unwrap();
        t.close(a).unwrap();
        let c = t.open("/c".to_string(), OpenFlags::READ).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_reserved_descriptors_rejected() {
        let mut t = FileTable::new();
        assert_eq!(t.close(0), Err(FsError::BadDescriptor));
        assert_eq!(t.close(2), Err(FsError::BadDescriptor));
        assert!(t.get(1).is_err());
    }

    #[test]
    fn test_position_tracking() {
        let mut t = FileTable::new();
        let fd = t.open("/f".to_string(), OpenFlags::READ).unwrap();
        t.get_mut(fd).unwrap().position = 17;
        assert_eq!(t.get(fd).unwrap().position, 17);
    }

    #[test]
    fn test_exhaustion() {
        let mut t = FileTable::new();
        for _ in FIRST_FREE_FD..MAX_DESCRIPTORS {
            t.open("/x".to_string(), OpenFlags::READ).unwrap();
        }
        assert_eq!(
            t.open("/y".to_string(), OpenFlags::READ),
            Err(FsError::TooManyOpenFiles)
        );
    }

    #[test]
    fn test_close_all() {
        let mut t = FileTable::new();
        t.open("/a".to_string(), OpenFlags::READ).unwrap();
        t.open("/b".to_string(), OpenFlags::WRITE).unwrap();
        assert_eq!(t.open_count(), 2);
        t.close_all();
        assert_eq!(t.open_count(), 0);
    }
}
