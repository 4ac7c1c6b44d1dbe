//! Page-fault classification.
//!
//! Decides, from (error code, faulting address, privilege), whether a
//! fault is a demand-allocation opportunity, a process-killing offence,
//! or a kernel panic. The interrupt dispatcher supplies the raw facts
//! and acts on the verdict; Cerberus gets told about anything hostile.

use core::sync::atomic::{AtomicU64, Ordering};

use super::VirtualAddress;

/// Page-fault error code bits, as pushed by the CPU.
pub mod error_code {
    /// 0 = non-present page, 1 = protection violation.
    pub const PRESENT: u64 = 1 << 0;
    /// 0 = read, 1 = write.
    pub const WRITE: u64 = 1 << 1;
    /// 0 = kernel mode, 1 = user mode.
    pub const USER: u64 = 1 << 2;
    /// Reserved bit set in a paging structure.
    pub const RESERVED: u64 = 1 << 3;
    /// Instruction fetch.
    pub const INSTRUCTION: u64 = 1 << 4;
}

/// What kind of fault this was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Lazily backed kernel heap page; resolved transparently.
    DemandPaged,
    /// Access in the first page: null pointer dereference.
    NullDeref,
    /// User-mode access to a kernel address.
    KernelSpaceViolation,
    /// Write to a present, non-writable page.
    ProtectionViolation,
    /// Access inside the current process's stack guard range.
    StackOverflow,
    /// Non-present page with no recovery story.
    Unmapped,
}

/// What the dispatcher should do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Resume the faulting instruction.
    Handled,
    /// Kill the offending process.
    KillProcess,
    /// The kernel itself is broken.
    Panic,
}

/// Facts about the faulting context the analyzer needs.
#[derive(Debug, Clone, Copy)]
pub struct FaultEnv {
    /// CPL at fault time (from the error code, but callers may refine).
    pub user_mode: bool,
    /// Guard range `[lo, hi)` of the current process stack, if known.
    pub stack_guard: Option<(u64, u64)>,
    /// Whether the kernel heap window demand-allocates.
    pub demand_paging: bool,
}

/// Per-class fault counters.
#[derive(Debug, Default)]
pub struct PageFaultStats {
    pub total: AtomicU64,
    pub handled: AtomicU64,
    pub null_deref: AtomicU64,
    pub kernel_space: AtomicU64,
    pub protection: AtomicU64,
    pub stack_overflow: AtomicU64,
    pub unmapped: AtomicU64,
}

pub static PAGE_FAULT_STATS: PageFaultStats = PageFaultStats {
    total: AtomicU64::new(0),
    handled: AtomicU64::new(0),
    null_deref: AtomicU64::new(0),
    kernel_space: AtomicU64::new(0),
    protection: AtomicU64::new(0),
    stack_overflow: AtomicU64::new(0),
    unmapped: AtomicU64::new(0),
};

/// Classify one fault. Pure; the caller performs whatever the action
/// demands (demand mapping, kill, panic).
pub fn classify(addr: VirtualAddress, code: u64, env: &FaultEnv) -> (FaultClass, FaultAction) {
    let stats = &PAGE_FAULT_STATS;
    stats.total.fetch_add(1, Ordering::Relaxed);

    let present = code & error_code::PRESENT != 0;
    let write = code & error_code::WRITE != 0;
    let user = env.user_mode || code & error_code::USER != 0;

    // Non-present kernel-heap-window access in kernel mode: the one
    // recoverable case.
    if !present && !user && addr.in_heap_window() && env.demand_paging {
        stats.handled.fetch_add(1, Ordering::Relaxed);
        return (FaultClass::DemandPaged, FaultAction::Handled);
    }

    // First page is never mapped: null dereference.
    if addr.as_u64() < super::FRAME_SIZE as u64 {
        stats.null_deref.fetch_add(1, Ordering::Relaxed);
        let action = if user {
            FaultAction::KillProcess
        } else {
            FaultAction::Panic
        };
        return (FaultClass::NullDeref, action);
    }

    // User mode touching kernel space is a security violation.
    if user && !addr.is_user() {
        stats.kernel_space.fetch_add(1, Ordering::Relaxed);
        return (FaultClass::KernelSpaceViolation, FaultAction::KillProcess);
    }

    // Stack guard range: overflow.
    if let Some((lo, hi)) = env.stack_guard {
        if addr.as_u64() >= lo && addr.as_u64() < hi {
            stats.stack_overflow.fetch_add(1, Ordering::Relaxed);
            return (FaultClass::StackOverflow, FaultAction::KillProcess);
        }
    }

    // Write to a present page: protection violation.
    if present && write {
        stats.protection.fetch_add(1, Ordering::Relaxed);
        let action = if user {
            FaultAction::KillProcess
        } else {
            FaultAction::Panic
        };
        return (FaultClass::ProtectionViolation, action);
    }

    stats.unmapped.fetch_add(1, Ordering::Relaxed);
    let action = if user {
        FaultAction::KillProcess
    } else {
        FaultAction::Panic
    };
    (FaultClass::Unmapped, action)
}

/// Demand-allocate the faulting heap page. Called by the dispatcher when
/// `classify` returned `DemandPaged`.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn demand_map(addr: VirtualAddress) -> bool {
    use super::frame_allocator;
    use super::vmm::KERNEL_VMM;
    use super::PageEntryFlags;

    let page = addr.align_down();
    let Ok(frame) = frame_allocator::alloc_frame() else {
        return false;
    };
    let mut vmm = KERNEL_VMM.lock();
    match vmm.map(page, frame, PageEntryFlags::kernel_rw()) {
        Ok(()) => true,
        Err(_) => {
            let _ = frame_allocator::free_frame(frame);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::HEAP_WINDOW_START;
    use super::*;

    fn env() -> FaultEnv {
        FaultEnv {
            user_mode: false,
            stack_guard: None,
            demand_paging: false,
        }
    }

    #[test]
    fn test_null_deref_user_kills() {
        let mut e = env();
        e.user_mode = true;
        let (class, action) = classify(VirtualAddress::new(0x10), error_code::USER, &e);
        assert_eq!(class, FaultClass::NullDeref);
        assert_eq!(action, FaultAction::KillProcess);
    }

    #[test]
    fn test_null_deref_kernel_panics() {
        let (class, action) = classify(VirtualAddress::new(0x0), 0, &env());
        assert_eq!(class, FaultClass::NullDeref);
        assert_eq!(action, FaultAction::Panic);
    }

    #[test]
    fn test_user_into_kernel_is_violation() {
        let (class, action) = classify(
            VirtualAddress::new(0xFFFF_8000_1234_5000),
            error_code::USER,
            &env(),
        );
        assert_eq!(class, FaultClass::KernelSpaceViolation);
        assert_eq!(action, FaultAction::KillProcess);
    }

    #[test]
    fn test_demand_paging_handles_heap_window() {
        let mut e = env();
        e.demand_paging = true;
        let (class, action) = classify(VirtualAddress::new(HEAP_WINDOW_START + 0x5000), 0, &e);
        assert_eq!(class, FaultClass::DemandPaged);
        assert_eq!(action, FaultAction::Handled);
    }

    #[test]
    fn test_heap_window_without_demand_paging_panics() {
        let (class, action) = classify(VirtualAddress::new(HEAP_WINDOW_START + 0x5000), 0, &env());
        assert_eq!(class, FaultClass::Unmapped);
        assert_eq!(action, FaultAction::Panic);
    }

    #[test]
    fn test_write_protect_kernel_panics() {
        let code = error_code::PRESENT | error_code::WRITE;
        let (class, action) = classify(VirtualAddress::new(0x40_0000), code, &env());
        assert_eq!(class, FaultClass::ProtectionViolation);
        assert_eq!(action, FaultAction::Panic);
    }

    #[test]
    fn test_write_protect_user_kills() {
        let code = error_code::PRESENT | error_code::WRITE | error_code::USER;
        let (class, action) = classify(VirtualAddress::new(0x40_0000), code, &env());
        assert_eq!(class, FaultClass::ProtectionViolation);
        assert_eq!(action, FaultAction::KillProcess);
    }

    #[test]
    fn test_stack_guard_hit_is_overflow() {
        let mut e = env();
        e.user_mode = true;
        e.stack_guard = Some((0x7000_0000, 0x7000_1000));
        let (class, action) = classify(VirtualAddress::new(0x7000_0F00), error_code::USER, &e);
        assert_eq!(class, FaultClass::StackOverflow);
        assert_eq!(action, FaultAction::KillProcess);
    }

    #[test]
    fn test_unknown_user_fault_kills() {
        let (class, action) =
            classify(VirtualAddress::new(0x5000_0000), error_code::USER, &env());
        assert_eq!(class, FaultClass::Unmapped);
        assert_eq!(action, FaultAction::KillProcess);
    }
}
