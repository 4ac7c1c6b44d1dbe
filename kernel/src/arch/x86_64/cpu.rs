//! CPU identification and early feature enablement.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::sync::OnceLock;

static FEATURES_EDX: AtomicU32 = AtomicU32::new(0);
static FEATURES_ECX: AtomicU32 = AtomicU32::new(0);
static VENDOR: OnceLock<[u8; 12]> = OnceLock::new();

/// Probe CPUID and, on bare metal, enable SSE.
pub fn init() {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: cpuid is unprivileged and side-effect free.
        let id = unsafe { core::arch::x86_64::__cpuid(0) };
        let mut vendor = [0u8; 12];
        vendor[0..4].copy_from_slice(&id.ebx.to_le_bytes());
        vendor[4..8].copy_from_slice(&id.edx.to_le_bytes());
        vendor[8..12].copy_from_slice(&id.ecx.to_le_bytes());
        let _ = VENDOR.set(vendor);

        // SAFETY: as above.
        let feat = unsafe { core::arch::x86_64::__cpuid(1) };
        FEATURES_EDX.store(feat.edx, Ordering::Relaxed);
        FEATURES_ECX.store(feat.ecx, Ordering::Relaxed);
    }

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    enable_sse();
}

/// Clear CR0.EM, set CR0.MP, and set CR4.OSFXSR/OSXMMEXCPT so SSE
/// instructions (which rustc emits freely) do not fault.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn enable_sse() {
    use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};

    // SAFETY: the bit edits below are exactly the SSE-enable sequence;
    // no other semantics change.
    unsafe {
        let mut cr0 = Cr0::read();
        cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
        cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
        Cr0::write(cr0);

        let mut cr4 = Cr4::read();
        cr4.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
        Cr4::write(cr4);
    }
}

/// CPUID vendor string ("GenuineIntel", "AuthenticAMD", ...).
pub fn vendor_string() -> &'static str {
    match VENDOR.get() {
        Some(v) => core::str::from_utf8(v).unwrap_or("unknown"),
        None => "unprobed",
    }
}

pub fn has_sse2() -> bool {
    FEATURES_EDX.load(Ordering::Relaxed) & (1 << 26) != 0
}

pub fn has_apic() -> bool {
    FEATURES_EDX.load(Ordering::Relaxed) & (1 << 9) != 0
}

pub fn has_x2apic() -> bool {
    FEATURES_ECX.load(Ordering::Relaxed) & (1 << 21) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_probe() {
        init();
        let v = vendor_string();
        // Any real or virtual x86_64 reports a 12-byte vendor.
        assert_eq!(v.len(), 12);
        // SSE2 is architectural on x86_64.
        assert!(has_sse2());
    }
}
