//! Kernel panic: the terminal error path.
//!
//! Disables interrupts, dumps the reason, the register state, and an
//! RBP-chain stack trace to the console, then halts. Nothing here
//! allocates; the serial writer is rebuilt from scratch in case the
//! regular one's lock died with its owner.

use crate::arch::Registers;

/// Panic with a captured interrupt frame: the fault path's exit.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn panic_with_frame(reason: &str, addr: u64, frame: &Registers) -> ! {
    use core::fmt::Write;

    x86_64::instructions::interrupts::disable();

    let mut out = crate::serial::panic_writer();
    let _ = writeln!(out, "\n[KERNEL PANIC] {}", reason);
    let _ = writeln!(out, "fault address: {:#018x}", addr);
    let _ = writeln!(
        out,
        "vector={} error_code={:#x} pid={}",
        frame.vector,
        frame.error_code,
        crate::sched::current_pid()
    );
    dump_registers(&mut out, frame);
    dump_trace(&mut out, frame.rbp);
    let _ = writeln!(out, "System halted.");

    crate::arch::halt_forever()
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn dump_registers(out: &mut impl core::fmt::Write, f: &Registers) {
    let _ = writeln!(
        out,
        "rip={:#018x} rsp={:#018x} rflags={:#010x} cs={:#x} ss={:#x}",
        f.rip, f.rsp, f.rflags, f.cs, f.ss
    );
    let _ = writeln!(
        out,
        "rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
        f.rax, f.rbx, f.rcx, f.rdx
    );
    let _ = writeln!(
        out,
        "rsi={:#018x} rdi={:#018x} rbp={:#018x} r8 ={:#018x}",
        f.rsi, f.rdi, f.rbp, f.r8
    );
    let _ = writeln!(
        out,
        "r9 ={:#018x} r10={:#018x} r11={:#018x} r12={:#018x}",
        f.r9, f.r10, f.r11, f.r12
    );
    let _ = writeln!(
        out,
        "r13={:#018x} r14={:#018x} r15={:#018x}",
        f.r13, f.r14, f.r15
    );
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn dump_trace(out: &mut impl core::fmt::Write, rbp: u64) {
    use crate::arch::x86_64::trace::{self, StackFrame};

    let mut frames = [StackFrame::default(); trace::MAX_FRAMES];
    let n = trace::capture_from(rbp, &mut frames);
    let _ = writeln!(out, "stack trace ({} frames):", n);
    for (i, f) in frames[..n].iter().enumerate() {
        let _ = writeln!(out, "  #{:02} rip={:#018x} rbp={:#018x}", i, f.rip, f.rbp);
    }
}

/// Host stand-in so shared code can reference one symbol.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn panic_with_frame(reason: &str, addr: u64, frame: &Registers) -> ! {
    panic!(
        "[KERNEL PANIC] {} (addr {:#x}, rip {:#x})",
        reason, addr, frame.rip
    );
}

/// The language panic handler for the bare-metal kernel image.
#[cfg(all(target_arch = "x86_64", target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use core::fmt::Write;

    x86_64::instructions::interrupts::disable();

    let mut out = crate::serial::panic_writer();
    let _ = writeln!(out, "\n[KERNEL PANIC] {}", info);

    // Best-effort trace from the current frame.
    {
        use crate::arch::x86_64::trace::{self, StackFrame};
        let mut frames = [StackFrame::default(); trace::MAX_FRAMES];
        let n = trace::capture(&mut frames);
        for (i, f) in frames[..n].iter().enumerate() {
            let _ = writeln!(out, "  #{:02} rip={:#018x} rbp={:#018x}", i, f.rip, f.rbp);
        }
    }

    let _ = writeln!(out, "System halted.");
    crate::arch::halt_forever()
}
