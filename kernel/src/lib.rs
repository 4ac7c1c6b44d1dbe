//! VoidFrame kernel library.
//!
//! The kernel proper: physical and virtual memory, the heap, interrupt
//! dispatch, processes and the MLFQ scheduler, IPC, the executable
//! loaders, the VFS with its backends, and the Cerberus security
//! monitor. The console/VGA pipeline, device drivers, networking, and
//! the shell are external collaborators behind the interfaces exposed
//! here.
//!
//! The library compiles for two worlds: the bare-metal kernel image,
//! and the host, where the unit-test suite drives the same code against
//! in-memory backings under the standard test harness.

#![no_std]

extern crate alloc;

// Host builds (tests, coverage) use the system allocator so Vec/String
// work under the standard harness.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

// On bare metal, the kernel heap of `mm::heap` is the global allocator.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod ipc;
pub mod irq;
pub mod klog;
pub mod loader;
pub mod mm;
pub mod panic;
pub mod process;
pub mod sched;
pub mod security;
pub mod serial;
pub mod sync;
pub mod syscall;
