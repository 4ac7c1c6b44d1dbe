//! Typed error values for the VoidFrame kernel.
//!
//! Every fallible kernel primitive returns one of these instead of an
//! integer code. Panic is reserved for broken invariants; anything a caller
//! can reasonably handle comes back as a `KernelError`.

use core::fmt;

/// Top-level kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    Mem(MemError),
    Vm(VmError),
    Heap(HeapError),
    Sched(SchedError),
    Ipc(IpcError),
    Fs(FsError),
    Block(BlockError),
    Loader(LoaderError),
    Syscall(SyscallError),
    /// Privilege check failed for the named operation.
    PermissionDenied { operation: &'static str },
    /// Subsystem used before its ordered init ran.
    NotInitialized { subsystem: &'static str },
}

/// Physical memory manager errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// No free frame (or no contiguous run of the requested length).
    OutOfFrames,
    /// Frame index outside the managed range.
    InvalidFrame,
    /// The frame was already free.
    DoubleFree,
}

/// Virtual memory manager errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Address not page aligned.
    Align,
    /// Address outside the allowed window (non-canonical or reserved).
    InvalidAddr,
    /// A present entry already covers this page.
    AlreadyMapped,
    /// No mapping exists where one was required.
    NotMapped,
    /// Backing allocation (frame or table) failed.
    NoMem,
    /// The virtual-address allocator has no block of the requested size.
    AddressSpaceExhausted,
}

/// Kernel heap errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// Allocation could not be satisfied.
    OutOfMemory,
    /// A header check failed; the payload address is included.
    Corruption { addr: usize },
    /// The same block was freed twice.
    DoubleFree { addr: usize },
}

/// Scheduler and process errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// PCB table is full.
    TooManyProcesses,
    /// No process with that PID.
    NoSuchProcess,
    /// Target process state does not permit the operation.
    InvalidState,
    /// The calling process was killed while blocked in the kernel.
    Killed,
}

/// IPC mailbox errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Destination mailbox is at capacity.
    QueueFull,
    /// Non-blocking receive found nothing.
    QueueEmpty,
    /// Message exceeds the fixed payload size.
    MessageTooLarge,
    /// Destination process does not exist.
    NoSuchProcess,
}

/// Filesystem errors, shared by the VFS and every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    /// Filesystem (or this operation on it) is read-only.
    ReadOnly,
    /// No free space on the backing store.
    Full,
    /// Path is malformed (not absolute, empty component, too long).
    InvalidPath,
    /// No mount covers the path.
    NotMounted,
    /// Descriptor table exhausted.
    TooManyOpenFiles,
    /// Descriptor is not open or is reserved.
    BadDescriptor,
    /// Backend could not parse its on-disk structures.
    InvalidSuperblock,
    /// Error from the block layer.
    Io,
    /// Operation not supported by this backend.
    NotSupported,
}

/// Block device errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// LBA or LBA+count beyond the device.
    OutOfRange,
    /// Buffer length is not a multiple of the sector size.
    BadBuffer,
    /// Device rejected or failed the transfer.
    Io,
    /// A device with that name is already registered.
    DuplicateName,
}

/// Executable loader errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderError {
    /// No known magic at the start of the image.
    UnknownFormat,
    /// Header, segment, or section extends past the file.
    Truncated,
    /// Not x86-64 little-endian, or not an executable image.
    WrongArch,
    /// File or image exceeds the configured limits.
    TooLarge,
    /// Image declares no loadable content or no entry point.
    NoEntry,
}

/// Syscall boundary errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Unknown syscall number.
    BadNumber { nr: u64 },
    /// User pointer failed validation.
    BadPointer { addr: u64 },
    /// Length argument overflows or exceeds the bounce limit.
    BadLength,
}

/// Result alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mem(e) => write!(f, "memory error: {:?}", e),
            Self::Vm(e) => write!(f, "vm error: {:?}", e),
            Self::Heap(e) => write!(f, "heap error: {:?}", e),
            Self::Sched(e) => write!(f, "scheduler error: {:?}", e),
            Self::Ipc(e) => write!(f, "ipc error: {:?}", e),
            Self::Fs(e) => write!(f, "fs error: {:?}", e),
            Self::Block(e) => write!(f, "block error: {:?}", e),
            Self::Loader(e) => write!(f, "loader error: {:?}", e),
            Self::Syscall(e) => write!(f, "syscall error: {:?}", e),
            Self::PermissionDenied { operation } => {
                write!(f, "permission denied: {}", operation)
            }
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl From<MemError> for KernelError {
    fn from(e: MemError) -> Self {
        Self::Mem(e)
    }
}

impl From<VmError> for KernelError {
    fn from(e: VmError) -> Self {
        Self::Vm(e)
    }
}

impl From<HeapError> for KernelError {
    fn from(e: HeapError) -> Self {
        Self::Heap(e)
    }
}

impl From<SchedError> for KernelError {
    fn from(e: SchedError) -> Self {
        Self::Sched(e)
    }
}

impl From<IpcError> for KernelError {
    fn from(e: IpcError) -> Self {
        Self::Ipc(e)
    }
}

impl From<FsError> for KernelError {
    fn from(e: FsError) -> Self {
        Self::Fs(e)
    }
}

impl From<BlockError> for KernelError {
    fn from(e: BlockError) -> Self {
        Self::Block(e)
    }
}

impl From<LoaderError> for KernelError {
    fn from(e: LoaderError) -> Self {
        Self::Loader(e)
    }
}

impl From<SyscallError> for KernelError {
    fn from(e: SyscallError) -> Self {
        Self::Syscall(e)
    }
}

impl From<BlockError> for FsError {
    fn from(_: BlockError) -> Self {
        FsError::Io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let e: KernelError = MemError::OutOfFrames.into();
        assert_eq!(e, KernelError::Mem(MemError::OutOfFrames));

        let e: KernelError = FsError::NotFound.into();
        assert_eq!(e, KernelError::Fs(FsError::NotFound));
    }

    #[test]
    fn test_block_error_surfaces_as_fs_io() {
        let e: FsError = BlockError::OutOfRange.into();
        assert_eq!(e, FsError::Io);
    }
}
