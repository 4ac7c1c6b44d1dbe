//! VoidFrame kernel binary: the ordered boot sequence.
//!
//! `_start32` in `arch::x86_64::entry` climbs from the Multiboot2
//! handoff into long mode and calls `kernel_main` with the boot-info
//! pointer and magic. From there the bring-up order is fixed: CPU
//! structures, physical memory, paging, heap, scheduler, filesystems —
//! leaves first, exactly the dependency order the subsystems assume.
//!
//! On a hosted target this binary is only a stub; the kernel image is
//! produced by building for `x86_64-unknown-none`.

#![cfg_attr(all(target_arch = "x86_64", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "x86_64", target_os = "none"), no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod kernel_entry {
    extern crate alloc;

    use voidframe_kernel::boot::multiboot2::BootInfo;
    use voidframe_kernel::{fs, klog, mm, println, sched, security::cerberus};

    /// Magic value a Multiboot2 bootloader leaves in EAX.
    const MULTIBOOT2_BOOTLOADER_MAGIC: u64 = 0x36D7_6289;

    #[no_mangle]
    pub extern "C" fn kernel_main(mb_info: u64, magic: u64) -> ! {
        println!("VoidFrame v{}", env!("CARGO_PKG_VERSION"));

        if magic != MULTIBOOT2_BOOTLOADER_MAGIC {
            println!("[BOOT] bad multiboot2 magic {:#x}, halting", magic);
            voidframe_kernel::arch::halt_forever();
        }

        // SAFETY: the bootloader handed us this physical pointer and
        // the low window is identity-mapped by the entry stub.
        let boot_info = match unsafe { BootInfo::from_ptr(mb_info) } {
            Ok(info) => info,
            Err(_) => {
                println!("[BOOT] unreadable boot information, halting");
                voidframe_kernel::arch::halt_forever();
            }
        };

        let level = klog::level_from_cmdline(boot_info.cmdline().unwrap_or(""));
        klog::init(level);
        log::info!(
            "multiboot2 info at {:#x}: {} bytes, {} MiB available",
            boot_info.base_addr(),
            boot_info.total_size(),
            boot_info.available_bytes() / (1024 * 1024)
        );

        // L0: GDT, TSS, IDT, PIC, PIT, CPU feature probe.
        voidframe_kernel::arch::x86_64::init();

        // L1-L3: frames, paging, heap.
        mm::init(&boot_info);

        // L6: process table and scheduler (creates the idle task).
        sched::init();

        // L8: VFS with ramfs root, devfs, procfs; boot modules become
        // ramdisk block devices.
        fs::init();
        for (i, module) in boot_info.modules().enumerate() {
            let len = (module.end - module.start) as usize;
            // SAFETY: module ranges come from the bootloader and sit in
            // the identity-mapped low window, reserved by PMM seeding.
            let bytes = unsafe { core::slice::from_raw_parts(module.start as *const u8, len) }
                .to_vec();
            let name = alloc::format!("vblk{}", i);
            let disk = alloc::sync::Arc::new(fs::blockdev::RamDisk::from_bytes(&name, bytes, 512));
            match fs::blockdev::register(disk) {
                Ok(()) => log::info!("module '{}' registered as {}", module.cmdline, name),
                Err(e) => log::warn!("module '{}' not registered: {}", module.cmdline, e),
            }
        }

        // L9: the monitor is static state; report it live.
        let sec = cerberus::stats();
        log::info!(
            "cerberus online: {} monitored, {} regions",
            sec.monitored_processes,
            sec.active_regions
        );

        log::info!("boot complete, enabling interrupts");
        voidframe_kernel::arch::x86_64::pic::enable_timer();
        // SAFETY: every handler the IDT points at is installed and the
        // scheduler owns vector 32 from here on.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }

        // This boot context parks as the idle loop; the first timer
        // tick adopts it as PID 0's running context.
        loop {
            x86_64::instructions::hlt();
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn main() {
    eprintln!("voidframe-kernel is a kernel image; build it for x86_64-unknown-none");
}
