//! Synchronization primitives.
//!
//! Two things live here: the IRQ-safe spinlock every shared kernel
//! structure hides behind, and the init-once cell used for the
//! boot-ordered singletons. Lock nesting across subsystems is fixed:
//! outer subsystem locks (scheduler, VFS, block registry, Cerberus) may
//! take allocator locks, and allocators nest heap -> VMM -> PMM. The
//! reverse direction is a bug.

pub mod atomic;
pub mod once_lock;
pub mod spinlock;

pub use once_lock::OnceLock;
pub use spinlock::{IrqGuard, SpinLock, SpinLockGuard};
