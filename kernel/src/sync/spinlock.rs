//! IRQ-safe spinlock.
//!
//! A thin wrapper over `spin::Mutex` that disables interrupts for the
//! lifetime of the guard and restores the previous interrupt state on
//! drop — the `SpinLockIrqSave` / `SpinUnlockIrqRestore` pairing, expressed
//! as an RAII guard. On a single CPU this is also what makes the lock safe
//! to take from interrupt context.
//!
//! Holding a guard across anything that may sleep is forbidden; no core
//! code path needs it.

use core::ops::{Deref, DerefMut};

/// Saved interrupt state, restored when dropped.
pub struct IrqGuard {
    was_enabled: bool,
}

impl IrqGuard {
    /// Disable interrupts, remembering whether they were enabled.
    pub fn save() -> Self {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            let was_enabled = x86_64::instructions::interrupts::are_enabled();
            if was_enabled {
                x86_64::instructions::interrupts::disable();
            }
            Self { was_enabled }
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            Self { was_enabled: false }
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        if self.was_enabled {
            x86_64::instructions::interrupts::enable();
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = self.was_enabled;
    }
}

/// Spinlock whose guard holds interrupts disabled.
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

/// Guard for [`SpinLock`]. Interrupt state is restored after the lock is
/// released (fields drop in declaration order).
pub struct SpinLockGuard<'a, T> {
    inner: spin::MutexGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquire the lock with interrupts disabled.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irq = IrqGuard::save();
        SpinLockGuard {
            inner: self.inner.lock(),
            _irq: irq,
        }
    }

    /// Try to acquire without spinning. Interrupts are only held disabled
    /// if the attempt succeeds.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq = IrqGuard::save();
        self.inner
            .try_lock()
            .map(|inner| SpinLockGuard { inner, _irq: irq })
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_round_trip() {
        let lock = SpinLock::new(5u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_try_lock_contended() {
        let lock = SpinLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }
}
