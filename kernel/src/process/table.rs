//! The PCB slot table.
//!
//! Fixed-size array of slots; PIDs are monotonic and never reused, so a
//! stale PID can only miss, never alias a new process.

use crate::error::SchedError;
use crate::sync::SpinLock;

use super::{Pid, ProcState, Process, MAX_PROCESSES};

pub struct ProcessTable {
    slots: [Option<Process>; MAX_PROCESSES],
    next_pid: Pid,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PROCESSES],
            next_pid: 0,
        }
    }

    /// Allocate a PID and a slot, building the PCB with the new PID.
    pub fn insert(
        &mut self,
        build: impl FnOnce(Pid) -> Process,
    ) -> Result<Pid, SchedError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(SchedError::TooManyProcesses)?;
        let pid = self.next_pid;
        self.next_pid += 1;
        self.slots[slot] = Some(build(pid));
        Ok(pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots
            .iter()
            .flatten()
            .find(|p| p.pid == pid && p.state != ProcState::Terminated)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|p| p.pid == pid && p.state != ProcState::Terminated)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots
            .iter()
            .flatten()
            .filter(|p| p.state != ProcState::Terminated)
    }

    /// Reap a zombie: record Terminated and free the slot. Returns the
    /// exit code.
    pub fn reap(&mut self, pid: Pid) -> Result<i32, SchedError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|p| p.pid == pid))
            .ok_or(SchedError::NoSuchProcess)?;
        let p = self.slots[slot].as_ref().unwrap();
        if p.state != ProcState::Zombie {
            return Err(SchedError::InvalidState);
        }
        let code = p.exit_code;
        // The kernel stack outlives the zombie (the kill path may have
        // run on it); it is only returned to the VMM here.
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            let p = self.slots[slot].as_ref().unwrap();
            let _ = crate::mm::vmm::KERNEL_VMM
                .lock()
                .free_stack(p.kernel_stack_top, p.kernel_stack_size);
        }
        self.slots[slot] = None;
        Ok(code)
    }

    pub fn live_count(&self) -> usize {
        self.iter().count()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Global process table. Take the scheduler lock first when both are
/// needed.
pub static PROCESS_TABLE: SpinLock<ProcessTable> = SpinLock::new(ProcessTable::new());

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use crate::mm::VirtualAddress;
    use crate::process::{Privilege, ProcFlags};

    use super::*;

    fn mkproc(pid: Pid) -> Process {
        Process::new(
            pid,
            0,
            "t".to_string(),
            0,
            VirtualAddress::new(0xFFFF_8000_0001_0000),
            4096,
            Privilege::Normal,
            ProcFlags::empty(),
            0,
        )
    }

    #[test]
    fn test_pids_are_monotonic() {
        let mut t = ProcessTable::new();
        let a = t.insert(mkproc).unwrap();
        let b = t.insert(mkproc).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn test_table_fills_up() {
        let mut t = ProcessTable::new();
        for _ in 0..MAX_PROCESSES {
            t.insert(mkproc).unwrap();
        }
        assert_eq!(t.insert(mkproc), Err(SchedError::TooManyProcesses));
    }

    #[test]
    fn test_reap_frees_slot_and_keeps_pid_unique() {
        let mut t = ProcessTable::new();
        for _ in 0..MAX_PROCESSES {
            t.insert(mkproc).unwrap();
        }
        // Zombify and reap PID 3.
        {
            let p = t.get_mut(3).unwrap();
            p.state = ProcState::Zombie;
            p.exit_code = 9;
        }
        assert_eq!(t.reap(3), Ok(9));
        assert!(t.get(3).is_none());
        // The slot is reusable, and the PID advances monotonically.
        let fresh = t.insert(mkproc).unwrap();
        assert_eq!(fresh, MAX_PROCESSES as Pid);
    }

    #[test]
    fn test_reap_requires_zombie() {
        let mut t = ProcessTable::new();
        let pid = t.insert(mkproc).unwrap();
        assert_eq!(t.reap(pid), Err(SchedError::InvalidState));
        assert_eq!(t.reap(999), Err(SchedError::NoSuchProcess));
    }
}
