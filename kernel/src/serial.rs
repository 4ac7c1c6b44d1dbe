//! COM1 serial output, the kernel's console sink.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod port {
    use core::fmt::{self, Write};

    use lazy_static::lazy_static;

    use crate::sync::SpinLock;

    lazy_static! {
        static ref SERIAL1: SpinLock<uart_16550::SerialPort> = {
            // SAFETY: 0x3F8 is the standard COM1 base.
            let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
            port.init();
            SpinLock::new(port)
        };
    }

    pub fn _print(args: fmt::Arguments) {
        let _ = SERIAL1.lock().write_fmt(args);
    }

    /// Lock-free writer for the panic path: the regular writer's lock
    /// may be held by the code that just died.
    pub fn panic_writer() -> uart_16550::SerialPort {
        // SAFETY: COM1 again; output may interleave with a writer that
        // was mid-line, which is acceptable while crashing.
        let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
        port.init();
        port
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use port::{_print, panic_writer};

/// Host build: swallow output; tests assert on values, not logs.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn _print(args: core::fmt::Arguments) {
    let _ = args;
}
