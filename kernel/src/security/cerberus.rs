//! Cerberus, the security monitor.
//!
//! Watches processes and heap regions for memory-safety violations:
//! plants a canary word near each monitored stack top, verifies it
//! before every dispatch, tracks allocations for double-free and
//! use-after-free detection, and classifies faults. Violations are
//! counted per process; past the threshold the process is marked
//! compromised and becomes permanently unschedulable until a
//! supervisor clears it.

use crate::process::Pid;
use crate::sync::SpinLock;

/// The canary sentinel planted near monitored stack tops.
pub const CANARY_VALUE: u64 = 0xDEAD_C0DE_CAFE_BABE;

/// Canary offset below the stack top.
const CANARY_OFFSET: u64 = 0x100;

/// Minimum stack size worth planting a canary in.
const MIN_STACK_FOR_CANARY: u64 = 0x2000;

/// Monitored process table size.
pub const MAX_MONITORED: usize = 64;

/// Watch region table size.
pub const MAX_WATCH_REGIONS: usize = 256;

/// Violations before a process is marked compromised.
pub const VIOLATION_THRESHOLD: u32 = 5;

/// Periodic sweep interval, in ticks.
pub const CHECK_INTERVAL: u64 = 100;

/// Violation classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    NullDeref,
    BufferOverflow,
    StackCorruption,
    BoundsCheck,
    UseAfterFree,
    DoubleFree,
    CanaryCorrupt,
}

/// One logged violation.
#[derive(Debug, Clone, Copy)]
pub struct ViolationReport {
    pub kind: ViolationKind,
    pub addr: u64,
    pub pid: Pid,
    pub rip: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionState {
    Empty,
    /// Live allocation.
    Active,
    /// Freed but remembered, for use-after-free classification.
    Freed,
}

#[derive(Clone, Copy)]
struct WatchRegion {
    base: u64,
    size: u64,
    pid: Pid,
    alloc_tick: u64,
    refs: u32,
    state: RegionState,
}

const EMPTY_REGION: WatchRegion = WatchRegion {
    base: 0,
    size: 0,
    pid: 0,
    alloc_tick: 0,
    refs: 0,
    state: RegionState::Empty,
};

#[derive(Clone, Copy)]
struct ProcInfo {
    monitored: bool,
    compromised: bool,
    violations: u32,
    last_violation_tick: u64,
    canary_addr: u64,
}

const EMPTY_PROC: ProcInfo = ProcInfo {
    monitored: false,
    compromised: false,
    violations: 0,
    last_violation_tick: 0,
    canary_addr: 0,
};

/// Monitor statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct CerberusStats {
    pub monitored_processes: usize,
    pub active_regions: usize,
    pub total_violations: u64,
    pub double_free_count: u64,
    pub canary_corrupt_count: u64,
}

/// The monitor. Indexed by PID modulo nothing: PIDs above the table
/// size are simply not monitored.
pub struct Cerberus {
    procs: [ProcInfo; MAX_MONITORED],
    regions: [WatchRegion; MAX_WATCH_REGIONS],
    ticks: u64,
    total_violations: u64,
    double_free_count: u64,
    canary_corrupt_count: u64,
    monitored: usize,
    active_regions: usize,
    /// Threat-reporting collaborator; violations are posted to its
    /// mailbox when set.
    threat_sink: Option<Pid>,
    /// Reports awaiting delivery. Posting takes scheduler locks, which
    /// must never happen under the Cerberus lock; callers drain this
    /// after unlocking.
    pending: [Option<ViolationReport>; PENDING_CAPACITY],
    pending_len: usize,
}

const PENDING_CAPACITY: usize = 8;

impl Cerberus {
    pub const fn new() -> Self {
        Self {
            procs: [EMPTY_PROC; MAX_MONITORED],
            regions: [EMPTY_REGION; MAX_WATCH_REGIONS],
            ticks: 0,
            total_violations: 0,
            double_free_count: 0,
            canary_corrupt_count: 0,
            monitored: 0,
            active_regions: 0,
            threat_sink: None,
            pending: [None; PENDING_CAPACITY],
            pending_len: 0,
        }
    }

    fn slot(&self, pid: Pid) -> Option<usize> {
        let idx = pid as usize;
        (idx < MAX_MONITORED).then_some(idx)
    }

    /// Whether the canary address is safe to touch.
    fn canary_accessible(addr: u64) -> bool {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            crate::mm::vmm::KERNEL_VMM
                .lock()
                .is_mapped(crate::mm::VirtualAddress::new(addr))
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            // Host harness: stacks are real heap buffers.
            addr != 0
        }
    }

    /// Start monitoring `pid` and plant its stack canary.
    pub fn register_process(&mut self, pid: Pid, stack_top: u64, stack_size: u64) {
        let Some(idx) = self.slot(pid) else { return };
        if self.procs[idx].monitored {
            return;
        }
        self.procs[idx] = ProcInfo {
            monitored: true,
            ..EMPTY_PROC
        };
        self.monitored += 1;

        if stack_top != 0 && stack_size >= MIN_STACK_FOR_CANARY {
            let canary_addr = stack_top - CANARY_OFFSET;
            if Self::canary_accessible(canary_addr) {
                // SAFETY: inside the process's freshly allocated stack,
                // confirmed mapped above.
                unsafe {
                    core::ptr::write_volatile(canary_addr as *mut u64, CANARY_VALUE);
                }
                self.procs[idx].canary_addr = canary_addr;
            }
        }
    }

    /// Drop monitoring state and this PID's watch regions.
    pub fn unregister_process(&mut self, pid: Pid) {
        let Some(idx) = self.slot(pid) else { return };
        if !self.procs[idx].monitored {
            return;
        }
        self.procs[idx] = EMPTY_PROC;
        self.monitored -= 1;
        for r in self.regions.iter_mut() {
            if r.state != RegionState::Empty && r.pid == pid {
                if r.state == RegionState::Active {
                    self.active_regions -= 1;
                }
                *r = EMPTY_REGION;
            }
        }
    }

    /// Record a heap allocation for `pid`. Reference-counted: tracking
    /// the same region again just bumps the count.
    pub fn track_alloc(&mut self, addr: u64, size: u64, pid: Pid) {
        // Re-tracking an existing active region?
        for r in self.regions.iter_mut() {
            if r.state == RegionState::Active && r.base == addr && r.pid == pid {
                r.refs += 1;
                return;
            }
        }
        // Reuse a freed-marker slot for the same base, else any free
        // slot, else recycle the oldest freed marker.
        let slot = self
            .regions
            .iter()
            .position(|r| r.state == RegionState::Freed && r.base == addr)
            .or_else(|| self.regions.iter().position(|r| r.state == RegionState::Empty))
            .or_else(|| {
                self.regions
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.state == RegionState::Freed)
                    .min_by_key(|(_, r)| r.alloc_tick)
                    .map(|(i, _)| i)
            });
        let Some(slot) = slot else {
            log::warn!("cerberus: watch table full, not tracking {:#x}", addr);
            return;
        };
        self.regions[slot] = WatchRegion {
            base: addr,
            size,
            pid,
            alloc_tick: self.ticks,
            refs: 1,
            state: RegionState::Active,
        };
        self.active_regions += 1;
    }

    /// Record a free. Freeing an untracked address is a DOUBLE_FREE
    /// violation.
    pub fn track_free(&mut self, addr: u64, pid: Pid) {
        for r in self.regions.iter_mut() {
            if r.state == RegionState::Active && r.base == addr {
                r.refs -= 1;
                if r.refs == 0 {
                    r.state = RegionState::Freed;
                    r.alloc_tick = self.ticks;
                    self.active_regions -= 1;
                }
                return;
            }
        }
        self.double_free_count += 1;
        self.record_violation(ViolationReport {
            kind: ViolationKind::DoubleFree,
            addr,
            pid,
            rip: 0,
        });
    }

    /// Verify the canary word of `pid`. A mismatch marks the process
    /// compromised.
    pub fn check_stack_canary(&mut self, pid: Pid) -> bool {
        let Some(idx) = self.slot(pid) else { return true };
        let info = self.procs[idx];
        if !info.monitored || info.canary_addr == 0 {
            return true;
        }
        if !Self::canary_accessible(info.canary_addr) {
            return true;
        }
        // SAFETY: confirmed mapped; planted by register_process.
        let value = unsafe { core::ptr::read_volatile(info.canary_addr as *const u64) };
        if value == CANARY_VALUE {
            return true;
        }
        self.canary_corrupt_count += 1;
        self.procs[idx].compromised = true;
        self.record_violation(ViolationReport {
            kind: ViolationKind::CanaryCorrupt,
            addr: info.canary_addr,
            pid,
            rip: 0,
        });
        false
    }

    /// Gate consulted by the scheduler before dispatching `pid`.
    /// Returns false for processes that must not run.
    pub fn pre_schedule_check(&mut self, pid: Pid) -> bool {
        let Some(idx) = self.slot(pid) else { return true };
        if !self.procs[idx].monitored {
            return true;
        }
        if self.procs[idx].compromised {
            return false;
        }
        if !self.check_stack_canary(pid) {
            return false;
        }
        if self.procs[idx].violations >= VIOLATION_THRESHOLD {
            self.procs[idx].compromised = true;
            return false;
        }
        true
    }

    /// Classify a fault and log it as a violation.
    pub fn analyze_fault(&mut self, addr: u64, _error_code: u64, pid: Pid, rip: u64) -> ViolationKind {
        let kind = if addr < crate::mm::FRAME_SIZE as u64 {
            ViolationKind::NullDeref
        } else if let Some(region) = self.region_containing(addr) {
            match region {
                RegionState::Freed => ViolationKind::UseAfterFree,
                _ => ViolationKind::BoundsCheck,
            }
        } else if self.just_past_active_region(addr) {
            ViolationKind::BufferOverflow
        } else if self.in_guard_of(pid, addr) {
            ViolationKind::StackCorruption
        } else {
            ViolationKind::BoundsCheck
        };

        self.record_violation(ViolationReport {
            kind,
            addr,
            pid,
            rip,
        });
        kind
    }

    fn region_containing(&self, addr: u64) -> Option<RegionState> {
        self.regions
            .iter()
            .find(|r| {
                r.state != RegionState::Empty && addr >= r.base && addr < r.base + r.size
            })
            .map(|r| r.state)
    }

    /// Within 64 bytes past the end of a live region: an overrun.
    fn just_past_active_region(&self, addr: u64) -> bool {
        self.regions.iter().any(|r| {
            r.state == RegionState::Active
                && addr >= r.base + r.size
                && addr < r.base + r.size + 64
        })
    }

    fn in_guard_of(&self, pid: Pid, addr: u64) -> bool {
        let guard = crate::process::PROCESS_TABLE
            .try_lock()
            .and_then(|t| t.get(pid).map(|p| p.stack_guard_range()));
        matches!(guard, Some((lo, hi)) if addr >= lo && addr < hi)
    }

    fn record_violation(&mut self, report: ViolationReport) {
        self.total_violations += 1;
        if let Some(idx) = self.slot(report.pid) {
            if self.procs[idx].monitored {
                self.procs[idx].violations += 1;
                self.procs[idx].last_violation_tick = self.ticks;
                if self.procs[idx].violations >= VIOLATION_THRESHOLD {
                    self.procs[idx].compromised = true;
                }
            }
        }
        log::error!(
            "cerberus: {:?} pid={} addr={:#x} rip={:#x}",
            report.kind,
            report.pid,
            report.addr,
            report.rip
        );
        if self.threat_sink.is_some() && self.pending_len < PENDING_CAPACITY {
            self.pending[self.pending_len] = Some(report);
            self.pending_len += 1;
        }
    }

    /// Take one queued threat report, with its destination.
    pub fn pop_pending(&mut self) -> Option<(Pid, ViolationReport)> {
        let sink = self.threat_sink?;
        if self.pending_len == 0 {
            return None;
        }
        self.pending_len -= 1;
        self.pending[self.pending_len].take().map(|r| (sink, r))
    }

    /// Periodic sweep: re-verify every monitored canary.
    pub fn tick(&mut self) {
        self.ticks += 1;
        if self.ticks % CHECK_INTERVAL != 0 {
            return;
        }
        for pid in 0..MAX_MONITORED as Pid {
            if self.procs[pid as usize].monitored {
                self.check_stack_canary(pid);
            }
        }
    }

    /// Supervisor action: clear compromised state and the violation
    /// counter.
    pub fn clear_compromised(&mut self, pid: Pid) {
        if let Some(idx) = self.slot(pid) {
            self.procs[idx].compromised = false;
            self.procs[idx].violations = 0;
        }
    }

    pub fn is_compromised(&self, pid: Pid) -> bool {
        self.slot(pid)
            .map(|i| self.procs[i].compromised)
            .unwrap_or(false)
    }

    pub fn set_threat_sink(&mut self, pid: Option<Pid>) {
        self.threat_sink = pid;
    }

    pub fn stats(&self) -> CerberusStats {
        CerberusStats {
            monitored_processes: self.monitored,
            active_regions: self.active_regions,
            total_violations: self.total_violations,
            double_free_count: self.double_free_count,
            canary_corrupt_count: self.canary_corrupt_count,
        }
    }
}

impl Default for Cerberus {
    fn default() -> Self {
        Self::new()
    }
}

/// Global monitor. Last in the kernel lock order.
pub static CERBERUS: SpinLock<Cerberus> = SpinLock::new(Cerberus::new());

pub fn register_process(pid: Pid, stack_top: u64, stack_size: u64) {
    CERBERUS.lock().register_process(pid, stack_top, stack_size);
}

pub fn unregister_process(pid: Pid) {
    CERBERUS.lock().unregister_process(pid);
}

pub fn track_alloc(addr: u64, size: u64, pid: Pid) {
    CERBERUS.lock().track_alloc(addr, size, pid);
}

pub fn track_free(addr: u64, pid: Pid) {
    CERBERUS.lock().track_free(addr, pid);
    drain_threat_reports();
}

/// Scheduler gate. Runs under the scheduler lock, so it must not post
/// reports; they drain on the next timer tick.
pub fn pre_schedule_check(pid: Pid) -> bool {
    CERBERUS.lock().pre_schedule_check(pid)
}

pub fn analyze_fault(addr: u64, error_code: u64, pid: Pid, rip: u64) -> ViolationKind {
    let kind = CERBERUS.lock().analyze_fault(addr, error_code, pid, rip);
    drain_threat_reports();
    kind
}

pub fn tick() {
    CERBERUS.lock().tick();
    drain_threat_reports();
}

/// Post queued violation reports to the threat sink's mailbox. Called
/// with no scheduler or table locks held.
fn drain_threat_reports() {
    loop {
        let Some((sink, report)) = CERBERUS.lock().pop_pending() else {
            return;
        };
        let mut msg = [0u8; 24];
        msg[0..4].copy_from_slice(&(report.kind as u32).to_le_bytes());
        msg[4..8].copy_from_slice(&report.pid.to_le_bytes());
        msg[8..16].copy_from_slice(&report.addr.to_le_bytes());
        msg[16..24].copy_from_slice(&report.rip.to_le_bytes());
        if crate::ipc::send(report.pid, sink, &msg).is_err() {
            return;
        }
    }
}

pub fn stats() -> CerberusStats {
    CERBERUS.lock().stats()
}

/// Route future violation reports to `pid`'s mailbox (None disables).
pub fn set_threat_sink(pid: Option<Pid>) {
    CERBERUS.lock().set_threat_sink(pid);
}

/// Supervisor action: make a compromised process schedulable again.
pub fn clear_compromised(pid: Pid) {
    CERBERUS.lock().clear_compromised(pid);
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    /// A monitored "stack": a real buffer whose top the canary goes
    /// under.
    fn fake_stack() -> (&'static mut [u8], u64) {
        let buf = vec![0u8; 0x4000].leak();
        let top = buf.as_ptr() as u64 + 0x4000;
        (buf, top)
    }

    #[test]
    fn test_register_plants_canary() {
        let mut c = Cerberus::new();
        let (_buf, top) = fake_stack();
        c.register_process(5, top, 0x4000);
        // The sentinel sits CANARY_OFFSET below the top.
        // SAFETY: inside the leaked buffer.
        let v = unsafe { core::ptr::read_volatile((top - 0x100) as *const u64) };
        assert_eq!(v, CANARY_VALUE);
        assert_eq!(c.stats().monitored_processes, 1);
    }

    #[test]
    fn test_canary_corruption_detected_and_blocks_scheduling() {
        let mut c = Cerberus::new();
        let (_buf, top) = fake_stack();
        c.register_process(5, top, 0x4000);
        assert!(c.pre_schedule_check(5));

        // Smash the canary.
        // SAFETY: inside the leaked buffer.
        unsafe {
            core::ptr::write_volatile((top - 0x100) as *mut u64, 0x4141_4141_4141_4141);
        }
        assert!(!c.pre_schedule_check(5));
        assert!(c.is_compromised(5));
        assert_eq!(c.stats().canary_corrupt_count, 1);
        // Permanently unschedulable.
        assert!(!c.pre_schedule_check(5));
    }

    #[test]
    fn test_unmonitored_pid_passes() {
        let mut c = Cerberus::new();
        assert!(c.pre_schedule_check(3));
        assert!(c.pre_schedule_check(9999));
    }

    #[test]
    fn test_track_alloc_free_cycle() {
        let mut c = Cerberus::new();
        c.register_process(2, 0, 0);
        c.track_alloc(0x1000_0000, 64, 2);
        assert_eq!(c.stats().active_regions, 1);
        c.track_free(0x1000_0000, 2);
        assert_eq!(c.stats().active_regions, 0);
        assert_eq!(c.stats().double_free_count, 0);
    }

    #[test]
    fn test_double_free_raises_violation() {
        let mut c = Cerberus::new();
        c.register_process(2, 0, 0);
        c.track_alloc(0x1000_0000, 64, 2);
        c.track_free(0x1000_0000, 2);
        // Second free: the region is no longer active.
        c.track_free(0x1000_0000, 2);
        assert_eq!(c.stats().double_free_count, 1);
        assert_eq!(c.stats().total_violations, 1);
    }

    #[test]
    fn test_refcounted_regions() {
        let mut c = Cerberus::new();
        c.track_alloc(0x2000_0000, 128, 1);
        c.track_alloc(0x2000_0000, 128, 1);
        c.track_free(0x2000_0000, 1);
        // Still one live reference.
        assert_eq!(c.stats().active_regions, 1);
        c.track_free(0x2000_0000, 1);
        assert_eq!(c.stats().active_regions, 0);
    }

    #[test]
    fn test_fault_classification() {
        let mut c = Cerberus::new();
        c.register_process(2, 0, 0);
        assert_eq!(c.analyze_fault(0x10, 0, 2, 0), ViolationKind::NullDeref);

        c.track_alloc(0x3000_0000, 0x100, 2);
        c.track_free(0x3000_0000, 2);
        assert_eq!(
            c.analyze_fault(0x3000_0010, 0, 2, 0),
            ViolationKind::UseAfterFree
        );

        c.track_alloc(0x4000_0000, 0x100, 2);
        assert_eq!(
            c.analyze_fault(0x4000_0100 + 8, 0, 2, 0),
            ViolationKind::BufferOverflow
        );

        assert_eq!(
            c.analyze_fault(0x7777_0000, 0, 2, 0),
            ViolationKind::BoundsCheck
        );
    }

    #[test]
    fn test_violation_threshold_compromises() {
        let mut c = Cerberus::new();
        c.register_process(4, 0, 0);
        for _ in 0..VIOLATION_THRESHOLD {
            c.analyze_fault(0x6666_0000, 0, 4, 0);
        }
        assert!(c.is_compromised(4));
        assert!(!c.pre_schedule_check(4));
        // Supervisor clearance restores schedulability.
        c.clear_compromised(4);
        assert!(c.pre_schedule_check(4));
    }

    #[test]
    fn test_unregister_clears_regions() {
        let mut c = Cerberus::new();
        c.register_process(3, 0, 0);
        c.track_alloc(0x5000_0000, 64, 3);
        c.track_alloc(0x5000_1000, 64, 3);
        c.unregister_process(3);
        assert_eq!(c.stats().active_regions, 0);
        assert_eq!(c.stats().monitored_processes, 0);
    }

    #[test]
    fn test_periodic_tick_checks_canaries() {
        let mut c = Cerberus::new();
        let (_buf, top) = fake_stack();
        c.register_process(1, top, 0x4000);
        // SAFETY: inside the leaked buffer.
        unsafe {
            core::ptr::write_volatile((top - 0x100) as *mut u64, 0);
        }
        for _ in 0..CHECK_INTERVAL {
            c.tick();
        }
        assert!(c.is_compromised(1));
    }
}
