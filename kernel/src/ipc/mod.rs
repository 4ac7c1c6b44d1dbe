//! Inter-process communication: per-process bounded mailboxes.
//!
//! `send` is non-blocking and fails fast when the destination queue is
//! full. `receive` blocks in the syscall layer by parking the caller in
//! the scheduler; the loop there re-checks the mailbox each time the
//! process is rescheduled and bails out if the process was killed while
//! waiting. Delivery to one destination is FIFO.

use alloc::collections::VecDeque;

use crate::error::{IpcError, KernelResult, SchedError};
use crate::process::{Pid, ProcState, PROCESS_TABLE};

/// Fixed message payload size.
pub const MAX_MSG_SIZE: usize = 64;

/// Mailbox depth per process.
pub const MAILBOX_CAPACITY: usize = 16;

/// One fixed-size message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub from: Pid,
    pub len: u8,
    pub data: [u8; MAX_MSG_SIZE],
}

impl Message {
    /// Build a message from a byte slice.
    pub fn new(from: Pid, payload: &[u8]) -> Result<Self, IpcError> {
        if payload.len() > MAX_MSG_SIZE {
            return Err(IpcError::MessageTooLarge);
        }
        let mut data = [0u8; MAX_MSG_SIZE];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            from,
            len: payload.len() as u8,
            data,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Bounded FIFO of messages, owned by one process.
pub struct Mailbox {
    queue: VecDeque<Message>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, msg: Message) -> Result<(), IpcError> {
        if self.queue.len() >= MAILBOX_CAPACITY {
            return Err(IpcError::QueueFull);
        }
        self.queue.push_back(msg);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliver `payload` to `to`'s mailbox. Non-blocking; wakes the
/// destination if it was parked in receive.
pub fn send(from: Pid, to: Pid, payload: &[u8]) -> KernelResult<()> {
    let msg = Message::new(from, payload)?;
    let needs_wake;
    {
        let mut table = PROCESS_TABLE.lock();
        let dest = table.get_mut(to).ok_or(IpcError::NoSuchProcess)?;
        if dest.state == ProcState::Zombie || dest.state == ProcState::Terminated {
            return Err(IpcError::NoSuchProcess.into());
        }
        dest.mailbox.push(msg)?;
        needs_wake = dest.state == ProcState::Blocked
            && dest.blocked_on == Some(crate::process::BlockReason::IpcReceive);
    }
    // Wake outside the table lock: the scheduler takes its own lock
    // first, then the table.
    if needs_wake {
        crate::sched::wake(to);
    }
    Ok(())
}

/// Non-blocking receive.
pub fn try_receive(pid: Pid) -> KernelResult<Option<Message>> {
    let mut table = PROCESS_TABLE.lock();
    let p = table.get_mut(pid).ok_or(SchedError::NoSuchProcess)?;
    if p.kill_pending {
        return Err(SchedError::Killed.into());
    }
    Ok(p.mailbox.pop())
}
