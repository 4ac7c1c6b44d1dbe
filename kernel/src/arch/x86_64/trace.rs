//! RBP-chain stack unwinder.
//!
//! Walks saved-frame-pointer links up to sixteen frames for the panic
//! report. Every load goes through a caller-supplied reader that checks
//! the address is mapped first, so tracing a corrupt stack never faults
//! inside the fault path.

/// Upper bound on reported frames.
pub const MAX_FRAMES: usize = 16;

/// One resolved frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackFrame {
    pub rip: u64,
    pub rbp: u64,
}

/// Walk an RBP chain.
///
/// `read` returns the word at an address only if it is safely readable;
/// `in_text` says whether a return address lands in kernel code. The
/// walk stops at the first frame that fails either test.
pub fn walk<R, T>(mut rbp: u64, read: R, in_text: T, out: &mut [StackFrame; MAX_FRAMES]) -> usize
where
    R: Fn(u64) -> Option<u64>,
    T: Fn(u64) -> bool,
{
    let mut count = 0;
    while count < MAX_FRAMES {
        if rbp == 0 || rbp % 8 != 0 {
            break;
        }
        let Some(next_rbp) = read(rbp) else { break };
        let Some(ret) = read(rbp.wrapping_add(8)) else {
            break;
        };
        if !in_text(ret) {
            break;
        }
        out[count] = StackFrame { rip: ret, rbp };
        count += 1;
        // Stacks grow down, so saved RBPs must increase strictly; a
        // cycle or a clobbered link ends the walk.
        if next_rbp <= rbp {
            break;
        }
        rbp = next_rbp;
    }
    count
}

/// Capture a trace starting from the current RBP.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn capture(out: &mut [StackFrame; MAX_FRAMES]) -> usize {
    let rbp: u64;
    // SAFETY: reading the frame pointer register has no side effects.
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack));
    }
    capture_from(rbp, out)
}

/// Capture a trace from a known RBP (e.g. a saved fault frame).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn capture_from(rbp: u64, out: &mut [StackFrame; MAX_FRAMES]) -> usize {
    extern "C" {
        static __text_start: u8;
        static __text_end: u8;
    }
    // SAFETY: linker symbols, addresses only.
    let (text_lo, text_hi) = unsafe {
        (
            &__text_start as *const u8 as u64,
            &__text_end as *const u8 as u64,
        )
    };

    let read = |addr: u64| -> Option<u64> {
        let vmm = crate::mm::vmm::KERNEL_VMM.try_lock()?;
        if !vmm.is_mapped(crate::mm::VirtualAddress::new(addr)) {
            return None;
        }
        drop(vmm);
        // SAFETY: just confirmed mapped; alignment checked by walk().
        Some(unsafe { core::ptr::read_volatile(addr as *const u64) })
    };
    walk(rbp, read, |rip| rip >= text_lo && rip < text_hi, out)
}

#[cfg(test)]
mod tests {
    use alloc::collections::BTreeMap;

    use super::*;

    const TEXT_LO: u64 = 0x10_0000;
    const TEXT_HI: u64 = 0x20_0000;

    struct FakeStack {
        words: BTreeMap<u64, u64>,
    }

    impl FakeStack {
        fn new() -> Self {
            Self {
                words: BTreeMap::new(),
            }
        }

        /// Lay out a chain of frames: each entry is (rbp, return addr).
        fn chain(&mut self, frames: &[(u64, u64)]) {
            for (i, &(rbp, ret)) in frames.iter().enumerate() {
                let next = frames.get(i + 1).map(|f| f.0).unwrap_or(0);
                self.words.insert(rbp, next);
                self.words.insert(rbp + 8, ret);
            }
        }

        fn reader(&self) -> impl Fn(u64) -> Option<u64> + '_ {
            move |addr| self.words.get(&addr).copied()
        }
    }

    fn in_text(rip: u64) -> bool {
        (TEXT_LO..TEXT_HI).contains(&rip)
    }

    #[test]
    fn test_walks_well_formed_chain() {
        let mut stack = FakeStack::new();
        stack.chain(&[
            (0x7000_0000, 0x10_1000),
            (0x7000_0040, 0x10_2000),
            (0x7000_0080, 0x10_3000),
        ]);
        let mut out = [StackFrame::default(); MAX_FRAMES];
        let n = walk(0x7000_0000, stack.reader(), in_text, &mut out);
        assert_eq!(n, 3);
        assert_eq!(out[0].rip, 0x10_1000);
        assert_eq!(out[2].rip, 0x10_3000);
        assert_eq!(out[1].rbp, 0x7000_0040);
    }

    #[test]
    fn test_stops_at_unmapped_frame() {
        let mut stack = FakeStack::new();
        // Second frame's memory is absent entirely.
        stack.chain(&[(0x7000_0000, 0x10_1000)]);
        stack.words.insert(0x7000_0000, 0x7000_0040); // link to nowhere
        let mut out = [StackFrame::default(); MAX_FRAMES];
        let n = walk(0x7000_0000, stack.reader(), in_text, &mut out);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_stops_at_non_text_return() {
        let mut stack = FakeStack::new();
        stack.chain(&[
            (0x7000_0000, 0x10_1000),
            (0x7000_0040, 0xDEAD_BEEF_0000), // outside text
        ]);
        let mut out = [StackFrame::default(); MAX_FRAMES];
        let n = walk(0x7000_0000, stack.reader(), in_text, &mut out);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_cycle_terminates() {
        let mut stack = FakeStack::new();
        // Frame points at itself.
        stack.words.insert(0x7000_0000, 0x7000_0000);
        stack.words.insert(0x7000_0008, 0x10_1000);
        let mut out = [StackFrame::default(); MAX_FRAMES];
        let n = walk(0x7000_0000, stack.reader(), in_text, &mut out);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_depth_capped_at_sixteen() {
        let mut stack = FakeStack::new();
        let frames: alloc::vec::Vec<(u64, u64)> = (0..32)
            .map(|i| (0x7000_0000 + i * 0x40, 0x10_1000 + i))
            .collect();
        stack.chain(&frames);
        let mut out = [StackFrame::default(); MAX_FRAMES];
        let n = walk(0x7000_0000, stack.reader(), in_text, &mut out);
        assert_eq!(n, MAX_FRAMES);
    }

    #[test]
    fn test_null_and_misaligned_rbp() {
        let stack = FakeStack::new();
        let mut out = [StackFrame::default(); MAX_FRAMES];
        assert_eq!(walk(0, stack.reader(), in_text, &mut out), 0);
        assert_eq!(walk(0x7000_0003, stack.reader(), in_text, &mut out), 0);
    }
}
