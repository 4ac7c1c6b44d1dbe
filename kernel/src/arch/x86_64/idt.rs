//! IDT wiring.
//!
//! All 256 gates point at naked stubs that push a vector number (and a
//! dummy error code when the CPU does not supply one), save every GPR,
//! and call the single dispatcher in `irq` with a pointer to the saved
//! `Registers` frame. That one shape serves exceptions, hardware IRQs,
//! and `int 0x80` alike, and lets the scheduler rewrite the frame to
//! context-switch on the way out.

#![cfg(all(target_arch = "x86_64", target_os = "none"))]

use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use super::gdt;

/// Shared epilogue/prologue of every stub. The push order is pinned by
/// the `Registers` layout assertions in `context`.
macro_rules! common_asm {
    () => {
        "push rax
         push rbx
         push rcx
         push rdx
         push rsi
         push rdi
         push rbp
         push r8
         push r9
         push r10
         push r11
         push r12
         push r13
         push r14
         push r15
         mov rdi, rsp
         call {dispatch}
         pop r15
         pop r14
         pop r13
         pop r12
         pop r11
         pop r10
         pop r9
         pop r8
         pop rbp
         pop rdi
         pop rsi
         pop rdx
         pop rcx
         pop rbx
         pop rax
         add rsp, 16
         iretq"
    };
}

/// Stub for vectors without a CPU error code.
macro_rules! isr_stub {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                concat!("push 0\n", "push {vector}\n", common_asm!()),
                vector = const $vec,
                dispatch = sym crate::irq::interrupt_dispatch,
            )
        }
    };
}

/// Stub for vectors where the CPU pushed an error code.
macro_rules! isr_stub_err {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                concat!("push {vector}\n", common_asm!()),
                vector = const $vec,
                dispatch = sym crate::irq::interrupt_dispatch,
            )
        }
    };
}

// CPU exceptions.
isr_stub!(isr0, 0);
isr_stub!(isr1, 1);
isr_stub!(isr2, 2);
isr_stub!(isr3, 3);
isr_stub!(isr4, 4);
isr_stub!(isr5, 5);
isr_stub!(isr6, 6);
isr_stub!(isr7, 7);
isr_stub_err!(isr8, 8);
isr_stub!(isr9, 9);
isr_stub_err!(isr10, 10);
isr_stub_err!(isr11, 11);
isr_stub_err!(isr12, 12);
isr_stub_err!(isr13, 13);
isr_stub_err!(isr14, 14);
isr_stub!(isr16, 16);
isr_stub_err!(isr17, 17);
isr_stub!(isr18, 18);
isr_stub!(isr19, 19);
isr_stub!(isr20, 20);
isr_stub_err!(isr29, 29);
isr_stub_err!(isr30, 30);

// Remapped PIC IRQs.
isr_stub!(isr32, 32);
isr_stub!(isr33, 33);
isr_stub!(isr34, 34);
isr_stub!(isr35, 35);
isr_stub!(isr36, 36);
isr_stub!(isr37, 37);
isr_stub!(isr38, 38);
isr_stub!(isr39, 39);
isr_stub!(isr40, 40);
isr_stub!(isr41, 41);
isr_stub!(isr42, 42);
isr_stub!(isr43, 43);
isr_stub!(isr44, 44);
isr_stub!(isr45, 45);
isr_stub!(isr46, 46);
isr_stub!(isr47, 47);

// Syscall gate.
isr_stub!(isr128, 128);

// Everything else funnels through one generic stub.
isr_stub!(isr_generic, 255);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        let addr = |f: extern "C" fn()| VirtAddr::new(f as usize as u64);

        // SAFETY: every stub below ends in iretq with the frame layout
        // the dispatcher expects; addresses are valid for 'static.
        unsafe {
            idt.divide_error.set_handler_addr(addr(isr0));
            idt.debug.set_handler_addr(addr(isr1));
            idt.non_maskable_interrupt.set_handler_addr(addr(isr2));
            idt.breakpoint.set_handler_addr(addr(isr3));
            idt.overflow.set_handler_addr(addr(isr4));
            idt.bound_range_exceeded.set_handler_addr(addr(isr5));
            idt.invalid_opcode.set_handler_addr(addr(isr6));
            idt.device_not_available.set_handler_addr(addr(isr7));
            idt.double_fault
                .set_handler_addr(addr(isr8))
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
            idt.coprocessor_segment_overrun.set_handler_addr(addr(isr9));
            idt.invalid_tss.set_handler_addr(addr(isr10));
            idt.segment_not_present.set_handler_addr(addr(isr11));
            idt.stack_segment_fault.set_handler_addr(addr(isr12));
            idt.general_protection_fault.set_handler_addr(addr(isr13));
            idt.page_fault.set_handler_addr(addr(isr14));
            idt.x87_floating_point.set_handler_addr(addr(isr16));
            idt.alignment_check.set_handler_addr(addr(isr17));
            idt.machine_check.set_handler_addr(addr(isr18));
            idt.simd_floating_point.set_handler_addr(addr(isr19));
            idt.virtualization.set_handler_addr(addr(isr20));
            idt.vmm_communication_exception.set_handler_addr(addr(isr29));
            idt.security_exception.set_handler_addr(addr(isr30));

            for vec in 32..=255u8 {
                idt[vec].set_handler_addr(addr(isr_generic));
            }

            let irq_stubs: [extern "C" fn(); 16] = [
                isr32, isr33, isr34, isr35, isr36, isr37, isr38, isr39, isr40, isr41, isr42,
                isr43, isr44, isr45, isr46, isr47,
            ];
            for (i, stub) in irq_stubs.iter().enumerate() {
                idt[32 + i as u8].set_handler_addr(addr(*stub));
            }

            // int 0x80 must be reachable from ring 3.
            idt[0x80]
                .set_handler_addr(addr(isr128))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }

        idt
    };
}

pub fn init() {
    IDT.load();
}
