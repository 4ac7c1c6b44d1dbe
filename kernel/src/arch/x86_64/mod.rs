//! x86_64 bring-up: GDT/TSS, IDT, PIC remap, PIT, CPU feature probe.
//!
//! `init` runs with interrupts disabled and leaves them disabled; the
//! boot sequence enables them once the scheduler is ready to take timer
//! ticks.

pub mod context;
pub mod cpu;
pub mod entry;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod timer;
pub mod trace;

/// Ordered hardware bring-up.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() {
    // SAFETY: cli only masks interrupts; required before touching the IDT.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }

    cpu::init();
    log::info!("cpu: {}", cpu::vendor_string());

    gdt::init();
    log::info!("gdt and tss loaded");

    idt::init();
    log::info!("idt loaded, 256 gates");

    pic::init();
    log::info!("pic remapped to vectors 32..48");

    timer::init();
    log::info!("pit running at {} Hz", timer::TICK_HZ);
}
