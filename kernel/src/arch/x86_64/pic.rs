//! Legacy 8259 PIC pair, remapped so hardware IRQs land on vectors
//! 32..48, clear of the CPU exceptions.

#![cfg(all(target_arch = "x86_64", target_os = "none"))]

use pic8259::ChainedPics;
use spin::Mutex;

/// First vector of the primary PIC.
pub const PIC_1_OFFSET: u8 = 32;
/// First vector of the secondary PIC.
pub const PIC_2_OFFSET: u8 = 40;

static PICS: Mutex<ChainedPics> =
    // SAFETY: the offsets avoid the CPU exception range.
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

pub fn init() {
    // SAFETY: standard ICW sequence on ports 0x20/0xA0; interrupts are
    // still disabled at this point of bring-up.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        // Everything masked; the timer line is opened when the
        // scheduler is ready for ticks.
        pics.write_masks(0xFF, 0xFF);
    }
}

/// Unmask the PIT line (IRQ 0).
pub fn enable_timer() {
    // SAFETY: mask register write on the primary PIC.
    unsafe {
        let mut pics = PICS.lock();
        let (m1, m2) = pics.read_masks();
        pics.write_masks(m1 & !0x01, m2);
    }
}

/// Signal end-of-interrupt for `vector`.
pub fn end_of_interrupt(vector: u8) {
    // SAFETY: EOI writes are the defined completion handshake.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}
