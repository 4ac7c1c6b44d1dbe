//! The multilevel feedback queue.
//!
//! Eight levels, level 0 highest. Quanta double per level; quantum
//! expiry demotes (unless IMMUNE or CRITICAL), voluntary blocking keeps
//! the level, and a periodic boost lifts everything back to the top so
//! nothing starves. Selection is round-robin within a level with FIFO
//! tie-break by enqueue order.
//!
//! The scheduler mutates only PCB state and the saved register frame;
//! the actual context switch is the interrupt return path resuming
//! whatever frame this code left behind.

use alloc::collections::VecDeque;

use crate::arch::Registers;
use crate::error::{KernelError, KernelResult, SchedError};
use crate::process::{
    BlockReason, Pid, ProcFlags, ProcState, ProcessTable, IDLE_PID,
};

/// Number of priority levels.
pub const NUM_LEVELS: usize = 8;

/// Time-slice quantum per level, in ticks. Higher priority runs shorter.
pub const QUANTA: [u32; NUM_LEVELS] = [1, 2, 4, 8, 16, 32, 64, 128];

/// Default interval between starvation boosts, in ticks.
pub const DEFAULT_BOOST_INTERVAL: u64 = 200;

/// Level a blocked-then-woken process re-enters at.
pub const WAKE_LEVEL: usize = 1;

/// Ticks a zombie may linger unreaped before the sweeper reclaims it.
pub const ZOMBIE_GRACE_TICKS: u64 = 1000;

/// How often the zombie sweeper runs.
const SWEEP_INTERVAL: u64 = 256;

fn allow_all(_: Pid) -> bool {
    true
}

/// Per-level queue lengths, for the state dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedStats {
    pub ticks: u64,
    pub queue_depths: [usize; NUM_LEVELS],
    pub current: Pid,
    pub context_switches: u64,
    pub boosts: u64,
}

pub struct Mlfq {
    queues: [VecDeque<Pid>; NUM_LEVELS],
    current: Pid,
    quantum_left: u32,
    ticks: u64,
    boost_interval: u64,
    context_switches: u64,
    boosts: u64,
    /// Pre-schedule gate; the kernel wires this to Cerberus.
    security_gate: fn(Pid) -> bool,
}

impl Mlfq {
    pub const fn new() -> Self {
        Self::with_gate(allow_all)
    }

    pub const fn with_gate(gate: fn(Pid) -> bool) -> Self {
        Self {
            queues: [const { VecDeque::new() }; NUM_LEVELS],
            current: IDLE_PID,
            quantum_left: QUANTA[0],
            ticks: 0,
            boost_interval: DEFAULT_BOOST_INTERVAL,
            context_switches: 0,
            boosts: 0,
            security_gate: gate,
        }
    }

    pub fn set_boost_interval(&mut self, ticks: u64) {
        self.boost_interval = ticks.max(1);
    }

    pub fn current(&self) -> Pid {
        self.current
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn stats(&self) -> SchedStats {
        let mut depths = [0; NUM_LEVELS];
        for (i, q) in self.queues.iter().enumerate() {
            depths[i] = q.len();
        }
        SchedStats {
            ticks: self.ticks,
            queue_depths: depths,
            current: self.current,
            context_switches: self.context_switches,
            boosts: self.boosts,
        }
    }

    /// Put `pid` at the back of the ready queue of `level`; queue order
    /// is the FIFO tie-break between equals.
    pub fn enqueue(&mut self, table: &mut ProcessTable, pid: Pid, level: usize) {
        let level = level.min(NUM_LEVELS - 1);
        let Some(p) = table.get_mut(pid) else { return };
        p.state = ProcState::Ready;
        p.level = level;
        p.blocked_on = None;
        self.queues[level].push_back(pid);
    }

    /// Admit a freshly created process at the top level.
    pub fn admit(&mut self, table: &mut ProcessTable, pid: Pid) {
        self.enqueue(table, pid, 0);
    }

    /// Pop the next runnable PID, honoring the security gate. Stale
    /// queue entries (killed or re-blocked processes) are discarded.
    fn pick_next(&mut self, table: &mut ProcessTable) -> Option<Pid> {
        for level in 0..NUM_LEVELS {
            while let Some(pid) = self.queues[level].pop_front() {
                let Some(p) = table.get_mut(pid) else { continue };
                if p.state != ProcState::Ready {
                    continue;
                }
                if !(self.security_gate)(pid) {
                    // Refused: park it out of every queue until a
                    // supervisor clears it.
                    p.state = ProcState::Blocked;
                    p.blocked_on = Some(BlockReason::Compromised);
                    continue;
                }
                return Some(pid);
            }
        }
        None
    }

    fn switch_in(&mut self, table: &mut ProcessTable, frame: &mut Registers, next: Pid) {
        let Some(p) = table.get_mut(next) else { return };
        p.state = ProcState::Running;
        *frame = p.context;
        self.quantum_left = QUANTA[p.level.min(NUM_LEVELS - 1)];
        if next != self.current {
            self.context_switches += 1;
        }
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        crate::arch::x86_64::gdt::set_kernel_stack(p.kernel_stack_top.as_u64());
        self.current = next;
    }

    /// Save the outgoing frame, requeue the outgoing process if it is
    /// still runnable, and resume the best ready process (or idle).
    pub fn schedule(&mut self, table: &mut ProcessTable, frame: &mut Registers) {
        let cur = self.current;
        if let Some(p) = table.get_mut(cur) {
            p.context = *frame;
            if p.state == ProcState::Running {
                p.state = ProcState::Ready;
                if cur != IDLE_PID {
                    let level = p.level;
                    self.queues[level].push_back(cur);
                }
            }
        }
        let next = self.pick_next(table).unwrap_or(IDLE_PID);
        self.switch_in(table, frame, next);
    }

    /// Timer tick: account, boost, sweep, and preempt on quantum expiry.
    pub fn on_tick(&mut self, table: &mut ProcessTable, frame: &mut Registers) {
        self.ticks += 1;

        if let Some(p) = table.get_mut(self.current) {
            p.cpu_ticks += 1;
        }

        if self.ticks % self.boost_interval == 0 {
            self.boost(table);
        }
        if self.ticks % SWEEP_INTERVAL == 0 {
            self.sweep_zombies(table);
        }

        // A killed or blocked current must not keep the CPU.
        let current_runnable = table
            .get(self.current)
            .is_some_and(|p| p.state == ProcState::Running);
        if !current_runnable {
            self.schedule(table, frame);
            return;
        }

        self.quantum_left = self.quantum_left.saturating_sub(1);
        if self.quantum_left == 0 {
            // Quantum expired: demote one level unless exempt.
            if let Some(p) = table.get_mut(self.current) {
                let exempt = p.flags.intersects(ProcFlags::IMMUNE | ProcFlags::CRITICAL);
                if !exempt && p.level < NUM_LEVELS - 1 && self.current != IDLE_PID {
                    p.level += 1;
                }
            }
            self.schedule(table, frame);
        }
    }

    /// Voluntary yield: no quantum charge, level kept, back of the line.
    pub fn yield_now(&mut self, table: &mut ProcessTable, frame: &mut Registers) {
        self.schedule(table, frame);
    }

    /// Block the current process and schedule away.
    pub fn block_current(
        &mut self,
        table: &mut ProcessTable,
        frame: &mut Registers,
        reason: BlockReason,
    ) {
        if let Some(p) = table.get_mut(self.current) {
            p.state = ProcState::Blocked;
            p.blocked_on = Some(reason);
        }
        self.schedule(table, frame);
    }

    /// Wake a blocked process. It re-enters near the top: blocking was
    /// voluntary, and responsiveness after a wait is the MLFQ bet.
    pub fn wake(&mut self, table: &mut ProcessTable, pid: Pid) {
        let Some(p) = table.get_mut(pid) else { return };
        if p.state != ProcState::Blocked {
            return;
        }
        let level = if p.flags.contains(ProcFlags::IMMUNE) {
            p.level
        } else {
            WAKE_LEVEL.min(p.level)
        };
        self.enqueue(table, pid, level);
    }

    /// Lift every ready process back to the top level. IMMUNE processes
    /// keep their level.
    fn boost(&mut self, table: &mut ProcessTable) {
        self.boosts += 1;
        for level in 1..NUM_LEVELS {
            let mut keep = VecDeque::new();
            while let Some(pid) = self.queues[level].pop_front() {
                let immune = table
                    .get(pid)
                    .is_some_and(|p| p.flags.contains(ProcFlags::IMMUNE));
                if immune {
                    keep.push_back(pid);
                } else {
                    if let Some(p) = table.get_mut(pid) {
                        p.level = 0;
                    }
                    self.queues[0].push_back(pid);
                }
            }
            self.queues[level] = keep;
        }
    }

    /// Mark a process dead and strip its resources. The caller has
    /// already decided it may.
    fn terminate(&mut self, table: &mut ProcessTable, pid: Pid, code: i32) {
        let ticks = self.ticks;
        let Some(p) = table.get_mut(pid) else { return };
        p.state = ProcState::Zombie;
        p.exit_code = code;
        p.zombie_tick = ticks;
        p.kill_pending = true;
        p.blocked_on = None;
        p.mailbox.clear();
        p.files.close_all();
        for q in self.queues.iter_mut() {
            q.retain(|&q_pid| q_pid != pid);
        }
        super::release_process_resources(pid, table);
    }

    /// Kill `target` on behalf of `killer`, enforcing the privilege
    /// rules: equal-or-lower privilege only, CRITICAL needs SUPERVISOR.
    pub fn kill(
        &mut self,
        table: &mut ProcessTable,
        killer: Pid,
        target: Pid,
    ) -> KernelResult<()> {
        if target == IDLE_PID {
            return Err(KernelError::PermissionDenied {
                operation: "kill idle task",
            });
        }
        let (killer_priv, killer_flags) = match table.get(killer) {
            Some(k) => (k.privilege, k.flags),
            None => return Err(SchedError::NoSuchProcess.into()),
        };
        let t = table.get(target).ok_or(SchedError::NoSuchProcess)?;
        if t.state == ProcState::Zombie {
            return Err(SchedError::InvalidState.into());
        }
        if t.privilege > killer_priv {
            return Err(KernelError::PermissionDenied {
                operation: "kill higher-privileged process",
            });
        }
        if t.flags.contains(ProcFlags::CRITICAL) && !killer_flags.contains(ProcFlags::SUPERVISOR) {
            return Err(KernelError::PermissionDenied {
                operation: "kill critical process",
            });
        }
        self.terminate(table, target, -1);
        Ok(())
    }

    /// Exit the current process with `code` and schedule away.
    pub fn exit_current(
        &mut self,
        table: &mut ProcessTable,
        frame: &mut Registers,
        code: i32,
    ) {
        let cur = self.current;
        self.terminate(table, cur, code);
        self.schedule(table, frame);
    }

    /// Kill everything killable (idle, IMMUNE, and CRITICAL survive).
    pub fn kill_all(&mut self, table: &mut ProcessTable) -> usize {
        let victims: alloc::vec::Vec<Pid> = table
            .iter()
            .filter(|p| {
                p.pid != IDLE_PID
                    && p.state != ProcState::Zombie
                    && !p.flags.intersects(ProcFlags::IMMUNE | ProcFlags::CRITICAL)
            })
            .map(|p| p.pid)
            .collect();
        let count = victims.len();
        for pid in victims {
            self.terminate(table, pid, -1);
        }
        count
    }

    /// Auto-reap zombies whose grace period expired.
    fn sweep_zombies(&mut self, table: &mut ProcessTable) {
        let now = self.ticks;
        let expired: alloc::vec::Vec<Pid> = table
            .iter()
            .filter(|p| {
                p.state == ProcState::Zombie && now.saturating_sub(p.zombie_tick) > ZOMBIE_GRACE_TICKS
            })
            .map(|p| p.pid)
            .collect();
        for pid in expired {
            let _ = table.reap(pid);
        }
    }
}

impl Default for Mlfq {
    fn default() -> Self {
        Self::new()
    }
}
