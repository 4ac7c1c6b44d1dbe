//! The Process Control Block.

use alloc::string::String;

use crate::arch::Registers;
use crate::fs::file::FileTable;
use crate::ipc::Mailbox;
use crate::mm::VirtualAddress;

use super::{Pid, Privilege, ProcFlags, ProcState};

/// Why a process is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Waiting in `ipc_recv` for a message.
    IpcReceive,
    /// Cerberus refused to schedule it.
    Compromised,
}

/// One process.
///
/// While a process is Running its saved `context` is stale — the live
/// registers are authoritative. The scheduler refreshes the context on
/// the way out and reloads it on the way back in.
pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub parent: Pid,
    pub state: ProcState,
    pub privilege: Privilege,
    pub flags: ProcFlags,
    /// Saved register frame, rewritten at context switch.
    pub context: Registers,
    /// Top of the guarded kernel stack (initial RSP).
    pub kernel_stack_top: VirtualAddress,
    pub kernel_stack_size: usize,
    /// Current MLFQ level, 0 = highest priority.
    pub level: usize,
    /// Ticks of CPU consumed.
    pub cpu_ticks: u64,
    /// Tick at creation.
    pub created_tick: u64,
    /// Tick at which the process became a zombie.
    pub zombie_tick: u64,
    pub exit_code: i32,
    pub blocked_on: Option<BlockReason>,
    /// Marked by kill; safe points in long kernel paths poll this.
    pub kill_pending: bool,
    /// Loaded executable image (base, size), freed at termination.
    pub image: Option<(VirtualAddress, usize)>,
    pub mailbox: Mailbox,
    pub files: FileTable,
}

impl Process {
    pub fn new(
        pid: Pid,
        parent: Pid,
        name: String,
        entry: u64,
        stack_top: VirtualAddress,
        stack_size: usize,
        privilege: Privilege,
        flags: ProcFlags,
        created_tick: u64,
    ) -> Self {
        Self {
            pid,
            name,
            parent,
            state: ProcState::Ready,
            privilege,
            flags,
            context: Registers::new_kernel(entry, stack_top.as_u64()),
            kernel_stack_top: stack_top,
            kernel_stack_size: stack_size,
            level: 0,
            cpu_ticks: 0,
            created_tick,
            zombie_tick: 0,
            exit_code: 0,
            blocked_on: None,
            kill_pending: false,
            image: None,
            mailbox: Mailbox::new(),
            files: FileTable::new(),
        }
    }

    /// Guard range below the stack, for the page-fault analyzer.
    pub fn stack_guard_range(&self) -> (u64, u64) {
        let bottom = self.kernel_stack_top.as_u64() - self.kernel_stack_size as u64;
        (bottom - crate::mm::FRAME_SIZE as u64, bottom)
    }

    pub fn is_schedulable(&self) -> bool {
        self.state == ProcState::Ready
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;

    fn sample() -> Process {
        Process::new(
            7,
            1,
            "worker".to_string(),
            0x1000,
            VirtualAddress::new(0xFFFF_8000_0010_0000),
            16 * 1024,
            Privilege::Normal,
            ProcFlags::empty(),
            42,
        )
    }

    #[test]
    fn test_new_process_is_ready_at_top_level() {
        let p = sample();
        assert_eq!(p.state, ProcState::Ready);
        assert_eq!(p.level, 0);
        assert_eq!(p.context.rip, 0x1000);
        assert_eq!(p.created_tick, 42);
    }

    #[test]
    fn test_stack_guard_range() {
        let p = sample();
        let (lo, hi) = p.stack_guard_range();
        assert_eq!(hi, 0xFFFF_8000_0010_0000 - 16 * 1024);
        assert_eq!(hi - lo, crate::mm::FRAME_SIZE as u64);
    }
}
