//! Process filesystem: per-PID `info` files synthesized from the PCB
//! table on every read.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::FsError;
use crate::process::{Pid, ProcState, PROCESS_TABLE};

use super::{DirEntry, FileSystem, NodeKind};

pub struct ProcFs;

impl ProcFs {
    pub fn new() -> Self {
        Self
    }

    fn parse(path: &str) -> Result<ProcPath, FsError> {
        let mut comps = path.split('/').filter(|c| !c.is_empty());
        match (comps.next(), comps.next(), comps.next()) {
            (None, _, _) => Ok(ProcPath::Root),
            (Some(pid), None, None) => {
                let pid: Pid = pid.parse().map_err(|_| FsError::NotFound)?;
                Ok(ProcPath::ProcessDir(pid))
            }
            (Some(pid), Some("info"), None) => {
                let pid: Pid = pid.parse().map_err(|_| FsError::NotFound)?;
                Ok(ProcPath::InfoFile(pid))
            }
            _ => Err(FsError::NotFound),
        }
    }

    fn render_info(pid: Pid) -> Result<String, FsError> {
        let table = PROCESS_TABLE.lock();
        let p = table.get(pid).ok_or(FsError::NotFound)?;
        Ok(format!(
            "pid:\t{}\nname:\t{}\nparent:\t{}\nstate:\t{:?}\npriv:\t{:?}\nflags:\t{:?}\nlevel:\t{}\ncpu_ticks:\t{}\ncreated:\t{}\n",
            p.pid, p.name, p.parent, p.state, p.privilege, p.flags, p.level, p.cpu_ticks, p.created_tick
        ))
    }
}

enum ProcPath {
    Root,
    ProcessDir(Pid),
    InfoFile(Pid),
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for ProcFs {
    fn fs_name(&self) -> &'static str {
        "procfs"
    }

    fn read_only(&self) -> bool {
        true
    }

    fn read(&self, path: &str, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        match Self::parse(path)? {
            ProcPath::InfoFile(pid) => {
                let text = Self::render_info(pid)?;
                let bytes = text.as_bytes();
                if offset >= bytes.len() {
                    return Ok(0);
                }
                let n = buf.len().min(bytes.len() - offset);
                buf[..n].copy_from_slice(&bytes[offset..offset + n]);
                Ok(n)
            }
            _ => Err(FsError::IsADirectory),
        }
    }

    fn write(&self, _path: &str, _offset: usize, _data: &[u8]) -> Result<usize, FsError> {
        Err(FsError::ReadOnly)
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        match Self::parse(path)? {
            ProcPath::Root => {
                let table = PROCESS_TABLE.lock();
                Ok(table
                    .iter()
                    .filter(|p| p.state != ProcState::Terminated)
                    .map(|p| DirEntry {
                        name: p.pid.to_string(),
                        kind: NodeKind::Directory,
                        size: 0,
                    })
                    .collect())
            }
            ProcPath::ProcessDir(pid) => {
                if PROCESS_TABLE.lock().get(pid).is_none() {
                    return Err(FsError::NotFound);
                }
                Ok(alloc::vec![DirEntry {
                    name: String::from("info"),
                    kind: NodeKind::File,
                    size: 0,
                }])
            }
            ProcPath::InfoFile(_) => Err(FsError::NotADirectory),
        }
    }

    fn is_dir(&self, path: &str) -> Result<bool, FsError> {
        match Self::parse(path)? {
            ProcPath::Root => Ok(true),
            ProcPath::ProcessDir(pid) => {
                if PROCESS_TABLE.lock().get(pid).is_none() {
                    return Err(FsError::NotFound);
                }
                Ok(true)
            }
            ProcPath::InfoFile(pid) => {
                if PROCESS_TABLE.lock().get(pid).is_none() {
                    return Err(FsError::NotFound);
                }
                Ok(false)
            }
        }
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
        match Self::parse(path)? {
            ProcPath::InfoFile(pid) => Ok(Self::render_info(pid)?.len()),
            _ => Err(FsError::IsADirectory),
        }
    }
}
