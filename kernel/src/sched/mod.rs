//! Scheduling front-end: the global scheduler instance, process
//! creation, and the entry points the interrupt dispatcher and syscall
//! layer call into.
//!
//! Lock order: the scheduler lock is taken before the process table,
//! always. Code that only needs the table may take it alone.

pub mod mlfq;

pub use mlfq::{Mlfq, SchedStats, DEFAULT_BOOST_INTERVAL, NUM_LEVELS, QUANTA};

use alloc::string::String;

use crate::arch::Registers;
use crate::error::{KernelError, KernelResult};
use crate::mm::VirtualAddress;
use crate::process::{
    Pid, Privilege, ProcFlags, ProcState, Process, ProcessTable, IDLE_PID, KERNEL_STACK_SIZE,
    PROCESS_TABLE,
};
use crate::sync::SpinLock;

/// Gate consulted before every dispatch; wired to Cerberus.
fn cerberus_gate(pid: Pid) -> bool {
    crate::security::cerberus::pre_schedule_check(pid)
}

/// Global scheduler. Fourth in the kernel lock order.
pub static SCHEDULER: SpinLock<Mlfq> = SpinLock::new(Mlfq::with_gate(cerberus_gate));

/// Entry point of the idle task: halt until the next interrupt.
pub extern "C" fn idle_entry() {
    loop {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        x86_64::instructions::hlt();
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        core::hint::spin_loop();
    }
}

/// Allocate a guarded kernel stack: VMM-backed on metal, leaked heap
/// memory under the host test harness.
fn alloc_kernel_stack(size: usize) -> KernelResult<VirtualAddress> {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        crate::mm::vmm::KERNEL_VMM
            .lock()
            .alloc_stack(size)
            .map_err(KernelError::Vm)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let buf = alloc::vec![0u8; size].leak();
        Ok(VirtualAddress::new(buf.as_ptr() as u64 + size as u64))
    }
}

/// Create the idle task (PID 0) and mark it running. Must be the first
/// process ever created.
pub fn init() {
    let _sched = SCHEDULER.lock();
    let mut table = PROCESS_TABLE.lock();
    let stack_top = alloc_kernel_stack(KERNEL_STACK_SIZE).expect("idle stack");
    let pid = table
        .insert(|pid| {
            Process::new(
                pid,
                0,
                String::from("idle"),
                idle_entry as usize as u64,
                stack_top,
                KERNEL_STACK_SIZE,
                Privilege::System,
                ProcFlags::IMMUNE,
                0,
            )
        })
        .expect("empty table at init");
    assert_eq!(pid, IDLE_PID, "idle task must be PID 0");
    if let Some(p) = table.get_mut(IDLE_PID) {
        p.state = ProcState::Running;
    }
    drop(table);
    log::info!("scheduler online: {} levels, quanta {:?}", NUM_LEVELS, QUANTA);
}

/// Create a kernel process at default privilege, entering at `entry`.
pub fn create_process(name: &str, entry: extern "C" fn()) -> KernelResult<Pid> {
    spawn(name, entry as usize as u64, Privilege::Normal, ProcFlags::empty(), None)
}

/// Create a process with explicit privilege and flags. Requesting
/// SYSTEM from a non-SYSTEM caller is refused.
pub fn create_secure_process(
    name: &str,
    entry: extern "C" fn(),
    privilege: Privilege,
    flags: ProcFlags,
) -> KernelResult<Pid> {
    if privilege == Privilege::System && current_privilege() != Privilege::System {
        return Err(KernelError::PermissionDenied {
            operation: "create SYSTEM process",
        });
    }
    spawn(name, entry as usize as u64, privilege, flags, None)
}

/// Shared creation path; `image` records a loaded executable allocation
/// so termination can release it.
pub fn spawn(
    name: &str,
    entry: u64,
    privilege: Privilege,
    flags: ProcFlags,
    image: Option<(VirtualAddress, usize)>,
) -> KernelResult<Pid> {
    let stack_top = alloc_kernel_stack(KERNEL_STACK_SIZE)?;

    let mut sched = SCHEDULER.lock();
    let mut table = PROCESS_TABLE.lock();
    let created_tick = sched.ticks();
    let pid = table.insert(|pid| {
        let mut p = Process::new(
            pid,
            sched_current(&sched),
            String::from(name),
            entry,
            stack_top,
            KERNEL_STACK_SIZE,
            privilege,
            flags,
            created_tick,
        );
        p.image = image;
        p
    })?;
    sched.admit(&mut table, pid);
    drop(table);
    drop(sched);

    crate::security::cerberus::register_process(pid, stack_top.as_u64(), KERNEL_STACK_SIZE as u64);
    log::debug!("created process {} '{}'", pid, name);
    Ok(pid)
}

fn sched_current(sched: &Mlfq) -> Pid {
    sched.current()
}

/// PID of the running process.
pub fn current_pid() -> Pid {
    SCHEDULER.lock().current()
}

/// Privilege of the running process.
pub fn current_privilege() -> Privilege {
    let pid = current_pid();
    PROCESS_TABLE
        .lock()
        .get(pid)
        .map(|p| p.privilege)
        .unwrap_or(Privilege::System) // boot context, before PID 0 exists
}

/// Whether the running process has been marked for death; long kernel
/// loops poll this at their safe points.
pub fn current_killed() -> bool {
    let pid = current_pid();
    PROCESS_TABLE
        .lock()
        .get(pid)
        .map(|p| p.kill_pending)
        .unwrap_or(false)
}

/// Timer-driven entry, from the interrupt dispatcher.
pub fn on_tick(frame: &mut Registers) {
    let mut sched = SCHEDULER.lock();
    let mut table = PROCESS_TABLE.lock();
    sched.on_tick(&mut table, frame);
}

/// Voluntary yield, from the syscall layer.
pub fn yield_now(frame: &mut Registers) {
    let mut sched = SCHEDULER.lock();
    let mut table = PROCESS_TABLE.lock();
    sched.yield_now(&mut table, frame);
}

/// Block the current process and switch away.
pub fn block_current(frame: &mut Registers, reason: crate::process::BlockReason) {
    let mut sched = SCHEDULER.lock();
    let mut table = PROCESS_TABLE.lock();
    sched.block_current(&mut table, frame, reason);
}

/// Wake a blocked process.
pub fn wake(pid: Pid) {
    let mut sched = SCHEDULER.lock();
    let mut table = PROCESS_TABLE.lock();
    sched.wake(&mut table, pid);
}

/// Kill `target` on behalf of the current process.
pub fn kill(target: Pid) -> KernelResult<()> {
    let mut sched = SCHEDULER.lock();
    let mut table = PROCESS_TABLE.lock();
    let killer = sched.current();
    sched.kill(&mut table, killer, target)
}

/// Exit the current process.
pub fn exit_current(frame: &mut Registers, code: i32) {
    let mut sched = SCHEDULER.lock();
    let mut table = PROCESS_TABLE.lock();
    sched.exit_current(&mut table, frame, code);
}

/// Reap a zombie child, returning its exit code.
pub fn reap(pid: Pid) -> KernelResult<i32> {
    PROCESS_TABLE
        .lock()
        .reap(pid)
        .map_err(KernelError::Sched)
}

/// Exit code of a zombie without reaping it.
pub fn exit_code_of(pid: Pid) -> Option<i32> {
    let table = PROCESS_TABLE.lock();
    table
        .get(pid)
        .filter(|p| p.state == ProcState::Zombie)
        .map(|p| p.exit_code)
}

/// Resource strip at termination: Cerberus monitoring and the loaded
/// image go now; the kernel stack waits for reap.
pub(crate) fn release_process_resources(pid: Pid, table: &mut ProcessTable) {
    crate::security::cerberus::unregister_process(pid);
    if let Some(p) = table.get_mut(pid) {
        if let Some((_base, _size)) = p.image.take() {
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            {
                let _ = crate::mm::vmm::KERNEL_VMM
                    .lock()
                    .free_with_guards(_base, _size);
            }
        }
    }
}

/// Log the scheduler and process-table state.
pub fn dump_state() {
    let sched = SCHEDULER.lock();
    let stats = sched.stats();
    drop(sched);
    log::info!(
        "sched: tick={} current={} switches={} boosts={} depths={:?}",
        stats.ticks,
        stats.current,
        stats.context_switches,
        stats.boosts,
        stats.queue_depths
    );
    let table = PROCESS_TABLE.lock();
    for p in table.iter() {
        log::info!(
            "  pid={} '{}' state={:?} priv={:?} level={} cpu={}t",
            p.pid,
            p.name,
            p.state,
            p.privilege,
            p.level,
            p.cpu_ticks
        );
    }
}
