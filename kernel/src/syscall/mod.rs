//! The syscall boundary (`int 0x80`).
//!
//! Register convention: number in RAX, up to three arguments in RDI,
//! RSI, RDX; the result returns in RAX. Negative results are errors.
//! Every user pointer is validated (canonical, below the kernel base,
//! length does not overflow) and copied through a bounded bounce
//! buffer inside a marked copy window, so a fault during the copy
//! surfaces as an error instead of a kernel panic.
//!
//! Blocking receive uses restart semantics: the saved RIP is backed up
//! over the `int 0x80` before the caller parks, so the syscall re-runs
//! when the process wakes.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::Registers;
use crate::error::{FsError, IpcError, KernelError, SyscallError};
use crate::fs::file::OpenFlags;
use crate::irq::UserCopyWindow;
use crate::mm::USER_SPACE_END;
use crate::process::{BlockReason, Pid, PROCESS_TABLE};

/// Stable syscall numbers.
pub mod numbers {
    pub const READ: u64 = 0;
    pub const WRITE: u64 = 1;
    pub const OPEN: u64 = 2;
    pub const CLOSE: u64 = 3;
    pub const CREATE_FILE: u64 = 4;
    pub const CREATE_DIR: u64 = 5;
    pub const DELETE: u64 = 6;
    pub const LIST_DIR: u64 = 7;
    pub const CREATE_PROCESS: u64 = 8;
    pub const KILL_PROCESS: u64 = 9;
    pub const GET_PID: u64 = 10;
    pub const YIELD: u64 = 11;
    pub const IPC_SEND: u64 = 12;
    pub const IPC_RECV: u64 = 13;
    pub const EXIT: u64 = 60;
}

/// Error returns, errno-flavored.
pub mod errno {
    pub const EPERM: i64 = -1;
    pub const ENOENT: i64 = -2;
    pub const ESRCH: i64 = -3;
    pub const EIO: i64 = -5;
    pub const EBADF: i64 = -9;
    pub const EAGAIN: i64 = -11;
    pub const ENOMEM: i64 = -12;
    pub const EFAULT: i64 = -14;
    pub const EEXIST: i64 = -17;
    pub const ENOTDIR: i64 = -20;
    pub const EISDIR: i64 = -21;
    pub const EINVAL: i64 = -22;
    pub const ENOSPC: i64 = -28;
    pub const EROFS: i64 = -30;
    pub const ENOSYS: i64 = -38;
    pub const ENOTEMPTY: i64 = -39;
}

/// Bounce buffer size: user copies move through chunks of this size.
pub const BOUNCE_SIZE: usize = 4096;

/// Longest accepted path argument.
pub const MAX_PATH_ARG: usize = 512;

/// Size of the `int 0x80` instruction, for syscall restart.
const INT80_LEN: u64 = 2;

/// Map a kernel error to its errno.
pub fn errno_of(e: &KernelError) -> i64 {
    match e {
        KernelError::Fs(fs) => match fs {
            FsError::NotFound => errno::ENOENT,
            FsError::AlreadyExists => errno::EEXIST,
            FsError::NotADirectory => errno::ENOTDIR,
            FsError::IsADirectory => errno::EISDIR,
            FsError::DirectoryNotEmpty => errno::ENOTEMPTY,
            FsError::ReadOnly => errno::EROFS,
            FsError::Full => errno::ENOSPC,
            FsError::InvalidPath => errno::EINVAL,
            FsError::NotMounted => errno::ENOENT,
            FsError::TooManyOpenFiles => errno::EBADF,
            FsError::BadDescriptor => errno::EBADF,
            FsError::InvalidSuperblock => errno::EIO,
            FsError::Io => errno::EIO,
            FsError::NotSupported => errno::ENOSYS,
        },
        KernelError::Ipc(ipc) => match ipc {
            IpcError::QueueFull => errno::EAGAIN,
            IpcError::QueueEmpty => errno::EAGAIN,
            IpcError::MessageTooLarge => errno::EINVAL,
            IpcError::NoSuchProcess => errno::ESRCH,
        },
        KernelError::Syscall(s) => match s {
            SyscallError::BadNumber { .. } => errno::ENOSYS,
            SyscallError::BadPointer { .. } => errno::EFAULT,
            SyscallError::BadLength => errno::EINVAL,
        },
        KernelError::Sched(_) => errno::ESRCH,
        KernelError::PermissionDenied { .. } => errno::EPERM,
        KernelError::Mem(_) | KernelError::Vm(_) | KernelError::Heap(_) => errno::ENOMEM,
        _ => errno::EIO,
    }
}

/// Validate a user buffer: non-null, canonical, below the kernel base,
/// and length that neither overflows nor crosses into kernel space.
pub fn validate_user_buffer(addr: u64, len: u64) -> Result<(), SyscallError> {
    if addr == 0 {
        return Err(SyscallError::BadPointer { addr });
    }
    let end = addr
        .checked_add(len)
        .ok_or(SyscallError::BadLength)?;
    if addr >= USER_SPACE_END || end > USER_SPACE_END {
        return Err(SyscallError::BadPointer { addr });
    }
    Ok(())
}

/// Copy user memory into a kernel buffer, bounce-chunked, inside a
/// marked copy window.
pub fn copy_from_user(addr: u64, len: usize) -> Result<Vec<u8>, SyscallError> {
    validate_user_buffer(addr, len as u64)?;
    let _window = UserCopyWindow::enter();
    let mut out = Vec::with_capacity(len);
    let mut bounce = [0u8; BOUNCE_SIZE];
    let mut done = 0usize;
    while done < len {
        let n = BOUNCE_SIZE.min(len - done);
        // SAFETY: the range was validated against the user window; a
        // fault here is caught by the copy-window marker and ends the
        // process rather than the kernel.
        unsafe {
            core::ptr::copy_nonoverlapping(
                (addr as usize + done) as *const u8,
                bounce.as_mut_ptr(),
                n,
            );
        }
        out.extend_from_slice(&bounce[..n]);
        done += n;
    }
    Ok(out)
}

/// Copy a kernel buffer out to user memory.
pub fn copy_to_user(addr: u64, data: &[u8]) -> Result<(), SyscallError> {
    validate_user_buffer(addr, data.len() as u64)?;
    let _window = UserCopyWindow::enter();
    let mut done = 0usize;
    while done < data.len() {
        let n = BOUNCE_SIZE.min(data.len() - done);
        // SAFETY: as in copy_from_user.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(done),
                (addr as usize + done) as *mut u8,
                n,
            );
        }
        done += n;
    }
    Ok(())
}

/// Read a path argument: pointer + length, UTF-8, bounded.
fn read_user_path(addr: u64, len: u64) -> Result<String, KernelError> {
    if len == 0 || len > MAX_PATH_ARG as u64 {
        return Err(SyscallError::BadLength.into());
    }
    let bytes = copy_from_user(addr, len as usize).map_err(KernelError::Syscall)?;
    String::from_utf8(bytes).map_err(|_| FsError::InvalidPath.into())
}

fn current_pid() -> Pid {
    crate::sched::current_pid()
}

/// The dispatcher. Writes the result into the frame's RAX; yield, exit
/// and a parked receive leave through the scheduler instead.
pub fn handle(frame: &mut Registers) {
    let nr = frame.rax;
    let (a1, a2, a3) = (frame.rdi, frame.rsi, frame.rdx);

    match nr {
        numbers::YIELD => {
            frame.rax = 0;
            crate::sched::yield_now(frame);
        }
        numbers::EXIT => {
            crate::sched::exit_current(frame, a1 as i32);
        }
        numbers::IPC_RECV => {
            let pid = current_pid();
            match crate::ipc::try_receive(pid) {
                Ok(Some(msg)) => {
                    frame.rax = deliver_message(&msg, a1, a2) as u64;
                }
                Ok(None) => {
                    // Nothing yet: restart the syscall when woken.
                    frame.rax = nr;
                    frame.rip -= INT80_LEN;
                    crate::sched::block_current(frame, BlockReason::IpcReceive);
                }
                Err(e) => {
                    frame.rax = errno_of(&e) as u64;
                }
            }
        }
        _ => {
            frame.rax = dispatch(nr, a1, a2, a3) as u64;
        }
    }
}

fn deliver_message(msg: &crate::ipc::Message, buf: u64, cap: u64) -> i64 {
    let payload = msg.payload();
    let n = payload.len().min(cap as usize);
    match copy_to_user(buf, &payload[..n]) {
        Ok(()) => n as i64,
        Err(e) => errno_of(&e.into()),
    }
}

/// Non-scheduling syscalls, as a plain value-returning function.
pub fn dispatch(nr: u64, a1: u64, a2: u64, a3: u64) -> i64 {
    let result = match nr {
        numbers::READ => sys_read(a1, a2, a3),
        numbers::WRITE => sys_write(a1, a2, a3),
        numbers::OPEN => sys_open(a1, a2, a3),
        numbers::CLOSE => sys_close(a1),
        numbers::CREATE_FILE => {
            read_user_path(a1, a2).and_then(|p| {
                crate::fs::create_file(&p).map_err(KernelError::Fs)?;
                Ok(0)
            })
        }
        numbers::CREATE_DIR => {
            read_user_path(a1, a2).and_then(|p| {
                crate::fs::create_dir(&p).map_err(KernelError::Fs)?;
                Ok(0)
            })
        }
        numbers::DELETE => {
            read_user_path(a1, a2).and_then(|p| {
                crate::fs::delete(&p, a3 != 0).map_err(KernelError::Fs)?;
                Ok(0)
            })
        }
        numbers::LIST_DIR => sys_list_dir(a1, a2, a3),
        numbers::CREATE_PROCESS => {
            // ABI rule of the loader: PID on success, 0 on any failure.
            return match read_user_path(a1, a2)
                .and_then(|p| sys_create_process(&p, a3))
            {
                Ok(pid) => pid as i64,
                Err(_) => 0,
            };
        }
        numbers::KILL_PROCESS => crate::sched::kill(a1 as Pid).map(|_| 0),
        numbers::GET_PID => Ok(current_pid() as i64),
        numbers::IPC_SEND => sys_ipc_send(a1, a2, a3),
        _ => Err(SyscallError::BadNumber { nr }.into()),
    };
    match result {
        Ok(v) => v,
        Err(e) => errno_of(&e),
    }
}

fn sys_read(fd: u64, buf: u64, len: u64) -> Result<i64, KernelError> {
    let fd = fd as usize;
    if fd <= 2 {
        // No console input path in the core.
        return Ok(0);
    }
    let pid = current_pid();
    let (path, position) = {
        let mut table = PROCESS_TABLE.lock();
        let p = table
            .get_mut(pid)
            .ok_or(crate::error::SchedError::NoSuchProcess)?;
        let of = p.files.get(fd).map_err(KernelError::Fs)?;
        (of.path.clone(), of.position)
    };

    let len = len as usize;
    let mut data = alloc::vec![0u8; len.min(BOUNCE_SIZE * 16)];
    let n = crate::fs::read(&path, position, &mut data).map_err(KernelError::Fs)?;
    copy_to_user(buf, &data[..n]).map_err(KernelError::Syscall)?;

    let mut table = PROCESS_TABLE.lock();
    if let Some(p) = table.get_mut(pid) {
        if let Ok(of) = p.files.get_mut(fd) {
            of.position += n;
        }
    }
    Ok(n as i64)
}

fn sys_write(fd: u64, buf: u64, len: u64) -> Result<i64, KernelError> {
    let fd = fd as usize;
    let data = copy_from_user(buf, len as usize).map_err(KernelError::Syscall)?;

    // Descriptors 1 and 2 are the console.
    if fd == 1 || fd == 2 {
        if let Ok(text) = core::str::from_utf8(&data) {
            crate::print!("{}", text);
        } else {
            for b in &data {
                crate::print!("{}", *b as char);
            }
        }
        return Ok(data.len() as i64);
    }
    if fd == 0 {
        return Err(FsError::BadDescriptor.into());
    }

    let pid = current_pid();
    let (path, position, flags) = {
        let mut table = PROCESS_TABLE.lock();
        let p = table
            .get_mut(pid)
            .ok_or(crate::error::SchedError::NoSuchProcess)?;
        let of = p.files.get(fd).map_err(KernelError::Fs)?;
        (of.path.clone(), of.position, of.flags)
    };
    if !flags.contains(OpenFlags::WRITE) {
        return Err(KernelError::PermissionDenied {
            operation: "write to read-only descriptor",
        });
    }

    let position = if flags.contains(OpenFlags::APPEND) {
        crate::fs::size(&path).unwrap_or(position)
    } else {
        position
    };
    let n = crate::fs::write(&path, position, &data).map_err(KernelError::Fs)?;

    let mut table = PROCESS_TABLE.lock();
    if let Some(p) = table.get_mut(pid) {
        if let Ok(of) = p.files.get_mut(fd) {
            of.position = position + n;
        }
    }
    Ok(n as i64)
}

fn sys_open(path_ptr: u64, path_len: u64, flags: u64) -> Result<i64, KernelError> {
    let path = read_user_path(path_ptr, path_len)?;
    let flags = OpenFlags::from_bits_truncate(flags as u32);

    if flags.contains(OpenFlags::CREATE) && !crate::fs::exists(&path) {
        crate::fs::create_file(&path).map_err(KernelError::Fs)?;
    } else if crate::fs::size(&path).is_err() && crate::fs::is_dir(&path).is_err() {
        return Err(FsError::NotFound.into());
    }

    let pid = current_pid();
    let mut table = PROCESS_TABLE.lock();
    let p = table
        .get_mut(pid)
        .ok_or(crate::error::SchedError::NoSuchProcess)?;
    let fd = p.files.open(path, flags).map_err(KernelError::Fs)?;
    Ok(fd as i64)
}

fn sys_close(fd: u64) -> Result<i64, KernelError> {
    let pid = current_pid();
    let mut table = PROCESS_TABLE.lock();
    let p = table
        .get_mut(pid)
        .ok_or(crate::error::SchedError::NoSuchProcess)?;
    p.files.close(fd as usize).map_err(KernelError::Fs)?;
    Ok(0)
}

/// Write directory entries into the user buffer as `name\n` lines,
/// directories suffixed with `/`. Returns bytes written.
fn sys_list_dir(path_ptr: u64, path_len: u64, out_ptr: u64) -> Result<i64, KernelError> {
    let path = read_user_path(path_ptr, path_len)?;
    let entries = crate::fs::list_dir(&path).map_err(KernelError::Fs)?;
    let mut text = String::new();
    for e in entries {
        text.push_str(&e.name);
        if e.kind == crate::fs::NodeKind::Directory {
            text.push('/');
        }
        text.push('\n');
        if text.len() > BOUNCE_SIZE {
            break;
        }
    }
    let bytes = text.as_bytes();
    let n = bytes.len().min(BOUNCE_SIZE);
    copy_to_user(out_ptr, &bytes[..n]).map_err(KernelError::Syscall)?;
    Ok(n as i64)
}

fn sys_create_process(path: &str, privilege: u64) -> Result<Pid, KernelError> {
    use crate::process::Privilege;
    let privilege = match privilege {
        0 => Privilege::User,
        2 => Privilege::System,
        _ => Privilege::Normal,
    };
    let opts = crate::loader::LoadOptions {
        privilege,
        ..Default::default()
    };
    crate::loader::spawn_from_file(path, &opts)
}

fn sys_ipc_send(dest: u64, buf: u64, len: u64) -> Result<i64, KernelError> {
    if len > crate::ipc::MAX_MSG_SIZE as u64 {
        return Err(IpcError::MessageTooLarge.into());
    }
    let payload = copy_from_user(buf, len as usize).map_err(KernelError::Syscall)?;
    crate::ipc::send(current_pid(), dest as Pid, &payload)?;
    Ok(0)
}
