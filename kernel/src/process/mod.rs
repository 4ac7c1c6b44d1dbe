//! Process model: PCBs and the process table.

pub mod pcb;
pub mod table;

pub use pcb::{BlockReason, Process};
pub use table::{ProcessTable, PROCESS_TABLE};

use bitflags::bitflags;

/// Process identifier. Monotonic; PID 0 is the idle task.
pub type Pid = u32;

/// The idle task's PID.
pub const IDLE_PID: Pid = 0;

/// Size of the PCB slot table.
pub const MAX_PROCESSES: usize = 64;

/// Default kernel stack size per process (usable bytes, guard excluded).
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Process lifecycle states.
///
/// ```text
/// (create) -> Ready -> Running -> (timeslice) -> Ready
///                   \-> Blocked -> (wake) -> Ready
///                   \-> Zombie -> (reap) -> Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Ready,
    Running,
    Blocked,
    /// Exited; PCB held until reaped or the grace period passes.
    Zombie,
    /// Reaped; the slot is free for reuse.
    Terminated,
}

/// Privilege level, ordered: User < Normal < System.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privilege {
    User = 0,
    Normal = 1,
    System = 2,
}

bitflags! {
    /// Scheduler-visible process flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcFlags: u8 {
        /// Never demoted, never boost-promoted: keeps its level.
        const IMMUNE = 1 << 0;
        /// Bypasses demotion; killing it requires SUPERVISOR.
        const CRITICAL = 1 << 1;
        /// Access-control bit honored by syscalls.
        const SUPERVISOR = 1 << 3;
    }
}
