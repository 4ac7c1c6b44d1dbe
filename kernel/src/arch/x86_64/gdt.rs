//! GDT and TSS.
//!
//! Flat kernel code/data segments plus ring-3 selectors and one TSS. The
//! TSS carries the double-fault IST stack and `rsp0`, which the
//! scheduler rewrites on every context switch so ring transitions land
//! on the incoming process's kernel stack.

#![cfg(all(target_arch = "x86_64", target_os = "none"))]

use core::ptr::addr_of;

use lazy_static::lazy_static;
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::{Segment, SegmentSelector, CS, DS, ES, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// IST slot used by the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const IST_STACK_SIZE: usize = 4096 * 5;

static mut DOUBLE_FAULT_STACK: [u8; IST_STACK_SIZE] = [0; IST_STACK_SIZE];

// The TSS is mutated at runtime (rsp0), so it lives outside the
// lazy_static and is only ever touched with interrupts disabled.
static mut TSS: TaskStateSegment = TaskStateSegment::new();

struct Selectors {
    code: SegmentSelector,
    data: SegmentSelector,
    user_code: SegmentSelector,
    user_data: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        // SAFETY: runs once, before interrupts are enabled, from init().
        unsafe {
            let stack_top = VirtAddr::from_ptr(addr_of!(DOUBLE_FAULT_STACK)) + IST_STACK_SIZE as u64;
            let tss = &mut *core::ptr::addr_of_mut!(TSS);
            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = stack_top;

            let mut gdt = GlobalDescriptorTable::new();
            let code = gdt.append(Descriptor::kernel_code_segment());
            let data = gdt.append(Descriptor::kernel_data_segment());
            let user_data = gdt.append(Descriptor::user_data_segment());
            let user_code = gdt.append(Descriptor::user_code_segment());
            let tss_sel = gdt.append(Descriptor::tss_segment(&*core::ptr::addr_of!(TSS)));
            (
                gdt,
                Selectors {
                    code,
                    data,
                    user_code,
                    user_data,
                    tss: tss_sel,
                },
            )
        }
    };
}

pub fn init() {
    GDT.0.load();
    // SAFETY: the selectors come from the GDT just loaded.
    unsafe {
        CS::set_reg(GDT.1.code);
        DS::set_reg(GDT.1.data);
        ES::set_reg(GDT.1.data);
        SS::set_reg(GDT.1.data);
        load_tss(GDT.1.tss);
    }
}

/// Install the incoming process's kernel stack for ring transitions.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: single CPU, callers run with interrupts disabled (the
    // scheduler holds its spinlock), so no concurrent TSS access.
    unsafe {
        (*core::ptr::addr_of_mut!(TSS)).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

pub fn user_selectors() -> (u16, u16) {
    (GDT.1.user_code.0, GDT.1.user_data.0)
}
