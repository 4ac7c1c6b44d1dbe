//! Init-once cell for boot-ordered singletons.
//!
//! The PMM, VMM, heap, scheduler, VFS, block registry, and Cerberus are
//! all populated exactly once during the strictly ordered boot sequence
//! and read-only (as cells) afterwards. `OnceLock` gives that pattern a
//! safe shape without `static mut`.

use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A cell that can be written exactly once and read forever after.
pub struct OnceLock<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the state machine guarantees the value is written once, before
// any shared read, and never mutated afterwards.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}
// SAFETY: moving the cell moves its (at most one) value with it; no
// thread can hold a reference across the move.
unsafe impl<T: Send> Send for OnceLock<T> {}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Initialize the cell. Returns `Err(value)` if already initialized
    /// (or racing with another initializer).
    pub fn set(&self, value: T) -> Result<(), T> {
        match self.state.compare_exchange(
            UNINIT,
            INITIALIZING,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: the CAS above grants exclusive write access; no
                // reader observes the value until READY is published.
                unsafe {
                    (*self.value.get()).write(value);
                }
                self.state.store(READY, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(value),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY is only published after the write completes,
            // and the value is never written again.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Whether `set` has completed.
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY implies the value was written; we have &mut.
            unsafe {
                (*self.value.get()).assume_init_drop();
            }
        }
    }
}
