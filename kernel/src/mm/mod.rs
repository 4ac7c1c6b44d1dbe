//! Memory management: physical frames, paging, virtual address space,
//! and the kernel heap.
//!
//! Init order matters and is enforced by `init()`: the frame allocator is
//! seeded from the Multiboot2 map first, then the VMM takes over the page
//! tables, then the heap switches from its bootstrap region to VMM-backed
//! pages.

pub mod frame_allocator;
pub mod heap;
pub mod page_fault;
pub mod page_table;
pub mod vaddr;
pub mod vmm;

pub use frame_allocator::{FrameAllocator, FrameStats, FRAME_ALLOCATOR};
pub use page_table::{FrameSource, PageTable, PageTableEntry, PhysMapper};

use bitflags::bitflags;

/// Size of a physical frame / virtual page (4 KiB).
pub const FRAME_SIZE: usize = 4096;

/// log2(FRAME_SIZE).
pub const FRAME_SHIFT: u32 = 12;

/// Kernel image virtual base (physical base + this offset).
pub const KERNEL_VIRTUAL_OFFSET: u64 = 0xFFFF_FFFF_8000_0000;

/// Kernel heap window.
pub const HEAP_WINDOW_START: u64 = 0xFFFF_8000_0000_0000;
pub const HEAP_WINDOW_END: u64 = 0xFFFF_FFFF_0000_0000;

/// MMIO window, a reserved sub-range of the heap window mapped NOCACHE.
pub const MMIO_WINDOW_START: u64 = 0xFFFF_FE00_0000_0000;
pub const MMIO_WINDOW_END: u64 = 0xFFFF_FF00_0000_0000;

/// Everything below this is user space.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Physical addresses below this are identity-mapped at boot; above it the
/// fixed physical-to-virtual offset applies.
pub const IDENTITY_MAP_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn as_frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 >> FRAME_SHIFT)
    }

    pub const fn is_frame_aligned(&self) -> bool {
        self.0 & (FRAME_SIZE as u64 - 1) == 0
    }

    /// Wrapping offset, so negative deltas can be applied as two's
    /// complement.
    pub const fn offset(&self, off: u64) -> Self {
        Self(self.0.wrapping_add(off))
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & (FRAME_SIZE as u64 - 1) == 0
    }

    /// Bits 48..64 must be a sign extension of bit 47.
    pub const fn is_canonical(&self) -> bool {
        let top = self.0 >> 47;
        top == 0 || top == 0x1_FFFF
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(FRAME_SIZE as u64 - 1))
    }

    pub const fn align_up(&self) -> Self {
        Self((self.0 + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1))
    }

    /// Wrapping offset, so negative deltas can be applied as two's
    /// complement.
    pub const fn offset(&self, off: u64) -> Self {
        Self(self.0.wrapping_add(off))
    }

    /// True for addresses inside the kernel heap window.
    pub const fn in_heap_window(&self) -> bool {
        self.0 >= HEAP_WINDOW_START && self.0 < HEAP_WINDOW_END
    }

    /// True for addresses inside the MMIO window.
    pub const fn in_mmio_window(&self) -> bool {
        self.0 >= MMIO_WINDOW_START && self.0 < MMIO_WINDOW_END
    }

    /// True for user-space addresses.
    pub const fn is_user(&self) -> bool {
        self.0 < USER_SPACE_END
    }
}

impl core::fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl core::fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Physical frame number (phys_addr >> 12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << FRAME_SHIFT)
    }
}

bitflags! {
    /// x86-64 page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageEntryFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const LARGE         = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageEntryFlags {
    /// Kernel read/write data.
    pub const fn kernel_rw() -> Self {
        Self::PRESENT.union(Self::WRITABLE).union(Self::NO_EXECUTE)
    }

    /// Kernel read-only data.
    pub const fn kernel_ro() -> Self {
        Self::PRESENT.union(Self::NO_EXECUTE)
    }

    /// Kernel executable text.
    pub const fn kernel_text() -> Self {
        Self::PRESENT
    }

    /// Device registers: present, uncached, write-through.
    pub const fn mmio() -> Self {
        Self::PRESENT
            .union(Self::WRITABLE)
            .union(Self::NO_CACHE)
            .union(Self::WRITE_THROUGH)
            .union(Self::NO_EXECUTE)
    }
}

/// Initialize all of memory management from the Multiboot2 boot info.
///
/// Only meaningful on bare metal; the host build seeds subsystems directly
/// in tests.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init(boot_info: &crate::boot::multiboot2::BootInfo) {
    log::info!("initializing physical frame allocator");
    frame_allocator::init(boot_info);

    log::info!("initializing virtual memory manager");
    vmm::init();

    log::info!("switching kernel heap to vmm backing");
    heap::init();

    let stats = FRAME_ALLOCATOR.lock().stats();
    log::info!(
        "memory online: {} MiB total, {} MiB used",
        stats.total_frames * FRAME_SIZE as u64 / (1024 * 1024),
        stats.used_frames * FRAME_SIZE as u64 / (1024 * 1024)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_alignment() {
        let v = VirtualAddress::new(0x1234);
        assert!(!v.is_page_aligned());
        assert_eq!(v.align_down().as_u64(), 0x1000);
        assert_eq!(v.align_up().as_u64(), 0x2000);
        assert!(VirtualAddress::new(0x2000).is_page_aligned());
    }

    #[test]
    fn test_canonical_addresses() {
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_F000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0x0001_0000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0x8000_0000_0000_0000).is_canonical());
    }

    #[test]
    fn test_frame_round_trip() {
        let pa = PhysicalAddress::new(0x7000);
        assert_eq!(pa.as_frame().as_u64(), 7);
        assert_eq!(pa.as_frame().as_addr(), pa);
    }

    #[test]
    fn test_windows_disjoint() {
        // Kernel image window, heap window, and MMIO sub-window must nest
        // the way the layout says they do.
        assert!(MMIO_WINDOW_START >= HEAP_WINDOW_START);
        assert!(MMIO_WINDOW_END <= HEAP_WINDOW_END);
        assert!(HEAP_WINDOW_END <= KERNEL_VIRTUAL_OFFSET);
        assert!(VirtualAddress::new(MMIO_WINDOW_START).in_heap_window());
        assert!(VirtualAddress::new(MMIO_WINDOW_START).in_mmio_window());
        assert!(!VirtualAddress::new(HEAP_WINDOW_START).in_mmio_window());
    }
}
