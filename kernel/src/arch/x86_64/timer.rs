//! PIT channel 0: the kernel tick source.

use core::sync::atomic::{AtomicU64, Ordering};

/// Scheduler tick rate.
pub const TICK_HZ: u32 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program PIT channel 0 for periodic interrupts at `TICK_HZ`.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() {
    use x86_64::instructions::port::Port;

    const PIT_FREQUENCY: u32 = 1_193_182;
    let divisor = (PIT_FREQUENCY / TICK_HZ) as u16;

    // SAFETY: PIT command/data ports; mode 3 (square wave), lo/hi byte.
    unsafe {
        let mut cmd: Port<u8> = Port::new(0x43);
        let mut data: Port<u8> = Port::new(0x40);
        cmd.write(0x36u8);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
}

/// Called by the timer interrupt path, exactly once per tick.
pub fn on_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Seconds since boot, for timestamps.
pub fn uptime_secs() -> u64 {
    ticks() / TICK_HZ as u64
}
