//! Atomic bit operations.
//!
//! Plain loads, stores, arithmetic, and CAS come straight from
//! `core::sync::atomic`; the scheduler and per-CPU caches use those
//! directly with explicit orderings. What core does not spell out are
//! the bit-test-and-modify forms, so they live here as fetch-or /
//! fetch-and wrappers that report the prior state of the bit.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Atomically set `bit`; returns whether it was already set.
pub fn bit_test_and_set64(word: &AtomicU64, bit: u32) -> bool {
    let mask = 1u64 << bit;
    word.fetch_or(mask, Ordering::SeqCst) & mask != 0
}

/// Atomically clear `bit`; returns whether it was set before.
pub fn bit_test_and_clear64(word: &AtomicU64, bit: u32) -> bool {
    let mask = 1u64 << bit;
    word.fetch_and(!mask, Ordering::SeqCst) & mask != 0
}

/// 32-bit variant of [`bit_test_and_set64`].
pub fn bit_test_and_set32(word: &AtomicU32, bit: u32) -> bool {
    let mask = 1u32 << bit;
    word.fetch_or(mask, Ordering::SeqCst) & mask != 0
}

/// 32-bit variant of [`bit_test_and_clear64`].
pub fn bit_test_and_clear32(word: &AtomicU32, bit: u32) -> bool {
    let mask = 1u32 << bit;
    word.fetch_and(!mask, Ordering::SeqCst) & mask != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_set_and_clear() {
        let w = AtomicU64::new(0);
        assert!(!bit_test_and_set64(&w, 5));
        assert!(bit_test_and_set64(&w, 5));
        assert_eq!(w.load(Ordering::SeqCst), 1 << 5);
        assert!(bit_test_and_clear64(&w, 5));
        assert!(!bit_test_and_clear64(&w, 5));
        assert_eq!(w.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bits_are_independent() {
        let w = AtomicU32::new(0);
        bit_test_and_set32(&w, 0);
        bit_test_and_set32(&w, 31);
        assert!(bit_test_and_clear32(&w, 0));
        assert_eq!(w.load(Ordering::SeqCst), 1 << 31);
    }
}
