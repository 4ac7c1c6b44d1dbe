//! The interrupt dispatcher.
//!
//! Every gate's stub lands here with a full `Registers` frame. The
//! dispatcher routes: timer to the scheduler (which may rewrite the
//! frame to context-switch), hardware IRQs to registered handlers,
//! `int 0x80` to the syscall layer, page faults to the analyzer, and
//! everything else to the fault path, which kills the offending
//! process or panics depending on mode and vector.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::Registers;
use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

/// Timer tick vector (PIC IRQ 0).
pub const VECTOR_TIMER: u8 = 32;
/// First and last remapped hardware IRQ vectors.
pub const VECTOR_IRQ_BASE: u8 = 32;
pub const VECTOR_IRQ_LAST: u8 = 47;
/// Software interrupt used by the syscall ABI.
pub const VECTOR_SYSCALL: u8 = 0x80;
/// Page fault.
pub const VECTOR_PAGE_FAULT: u8 = 14;

/// Handler for a hardware IRQ line (0..16).
pub type IrqHandler = fn(u8);

static IRQ_HANDLERS: SpinLock<[Option<IrqHandler>; 16]> = SpinLock::new([None; 16]);

/// Set while the kernel is copying to or from user memory on behalf of
/// a syscall; a fault in that window becomes an error return instead of
/// a kernel panic.
static IN_USER_COPY: AtomicBool = AtomicBool::new(false);

/// RAII marker for user copy-in/copy-out windows.
pub struct UserCopyWindow;

impl UserCopyWindow {
    pub fn enter() -> Self {
        IN_USER_COPY.store(true, Ordering::Release);
        Self
    }
}

impl Drop for UserCopyWindow {
    fn drop(&mut self) {
        IN_USER_COPY.store(false, Ordering::Release);
    }
}

pub fn in_user_copy() -> bool {
    IN_USER_COPY.load(Ordering::Acquire)
}

/// Register a handler for hardware IRQ line `line` (0..16).
pub fn register_irq_handler(line: u8, handler: IrqHandler) -> KernelResult<()> {
    if line >= 16 {
        return Err(KernelError::NotInitialized { subsystem: "irq" });
    }
    IRQ_HANDLERS.lock()[line as usize] = Some(handler);
    Ok(())
}

/// Vectors that are fatal no matter what: invalid opcode, double
/// fault, general protection.
fn always_fatal(vector: u8) -> bool {
    matches!(vector, 6 | 8 | 13)
}

fn exception_name(vector: u8) -> &'static str {
    match vector {
        0 => "divide error",
        1 => "debug",
        2 => "non-maskable interrupt",
        3 => "breakpoint",
        4 => "overflow",
        5 => "bound range exceeded",
        6 => "invalid opcode",
        7 => "device not available",
        8 => "double fault",
        10 => "invalid TSS",
        11 => "segment not present",
        12 => "stack-segment fault",
        13 => "general protection fault",
        14 => "page fault",
        16 => "x87 floating point",
        17 => "alignment check",
        18 => "machine check",
        19 => "SIMD floating point",
        _ => "exception",
    }
}

/// The single entry point the naked stubs call.
#[no_mangle]
pub extern "C" fn interrupt_dispatch(frame: &mut Registers) {
    let vector = frame.vector as u8;
    match vector {
        VECTOR_TIMER => {
            crate::arch::x86_64::timer::on_tick();
            crate::security::cerberus::tick();
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            crate::arch::x86_64::pic::end_of_interrupt(VECTOR_TIMER);
            crate::sched::on_tick(frame);
        }
        33..=VECTOR_IRQ_LAST => {
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            crate::arch::x86_64::pic::end_of_interrupt(vector);
            let line = vector - VECTOR_IRQ_BASE;
            let handler = IRQ_HANDLERS.lock()[line as usize];
            if let Some(h) = handler {
                h(line);
            }
        }
        VECTOR_SYSCALL => {
            crate::syscall::handle(frame);
        }
        VECTOR_PAGE_FAULT => {
            handle_page_fault(frame);
        }
        0..=31 => {
            handle_exception(frame);
        }
        _ => {
            // Spurious or unclaimed vector.
            log::warn!("spurious interrupt, vector {}", vector);
        }
    }
}

fn handle_page_fault(frame: &mut Registers) {
    use crate::mm::page_fault::{self, FaultAction, FaultEnv};
    use crate::mm::VirtualAddress;

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    let addr = x86_64::registers::control::Cr2::read_raw();
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let addr = 0u64;

    let pid = crate::sched::current_pid();
    let user_mode = frame.cs & 0x3 == 0x3;
    let stack_guard = crate::process::PROCESS_TABLE
        .lock()
        .get(pid)
        .map(|p| p.stack_guard_range());

    let env = FaultEnv {
        user_mode,
        stack_guard,
        demand_paging: cfg!(feature = "demand-paging"),
    };
    let (class, action) = page_fault::classify(VirtualAddress::new(addr), frame.error_code, &env);

    match action {
        FaultAction::Handled => {
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            if page_fault::demand_map(VirtualAddress::new(addr)) {
                return;
            }
            // Demand mapping failed after all: treat as fatal.
            panic_fault(frame, addr, "demand allocation failed");
        }
        FaultAction::KillProcess => {
            crate::security::cerberus::analyze_fault(addr, frame.error_code, pid, frame.rip);
            log::warn!(
                "page fault ({:?}) at {:#x} rip={:#x}: killing pid {}",
                class,
                addr,
                frame.rip,
                pid
            );
            crate::sched::exit_current(frame, -1);
        }
        FaultAction::Panic => {
            // A fault inside a user copy window is survivable: the
            // syscall layer sees the flag and returns EFAULT-style.
            if in_user_copy() {
                crate::security::cerberus::analyze_fault(addr, frame.error_code, pid, frame.rip);
                crate::sched::exit_current(frame, -1);
                return;
            }
            panic_fault(frame, addr, "unrecoverable page fault");
        }
    }
}

fn handle_exception(frame: &mut Registers) {
    let vector = frame.vector as u8;
    let user_mode = frame.cs & 0x3 == 0x3;

    if user_mode && !always_fatal(vector) {
        let pid = crate::sched::current_pid();
        log::warn!(
            "{} (vector {}) in pid {} at rip={:#x}: killing",
            exception_name(vector),
            vector,
            pid,
            frame.rip
        );
        crate::sched::exit_current(frame, -1);
        return;
    }

    panic_fault(frame, frame.error_code, exception_name(vector));
}

fn panic_fault(frame: &Registers, addr: u64, reason: &'static str) -> ! {
    crate::panic::panic_with_frame(reason, addr, frame)
}
