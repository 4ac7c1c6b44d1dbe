//! Virtual memory manager.
//!
//! Owns the kernel PML4 and layers policy over the page-table walker:
//! window and alignment checks, the buddy-backed virtual address
//! allocator, guarded allocations, MMIO mappings, and TLB invalidation
//! batching. All mutation happens under the global VMM lock, second in
//! the kernel lock order after the PMM.

use crate::error::{MemError, VmError};

use super::frame_allocator::FRAME_ALLOCATOR;
use super::page_table::{FrameSource, Mapper, PageTable, PhysMapper, Resolved};
use super::vaddr::BuddyAllocator;
use super::{
    PageEntryFlags, PhysicalAddress, VirtualAddress, FRAME_SIZE, HEAP_WINDOW_START,
    IDENTITY_MAP_SIZE, KERNEL_VIRTUAL_OFFSET, MMIO_WINDOW_END, MMIO_WINDOW_START,
};
use crate::sync::SpinLock;

/// Pending TLB invalidations, flushed as a batch. Overflow degrades to a
/// full flush. Per-CPU by construction; there is one CPU.
pub struct TlbBatch {
    targets: [u64; Self::CAPACITY],
    len: usize,
    full_flush: bool,
}

impl TlbBatch {
    const CAPACITY: usize = 64;

    pub const fn new() -> Self {
        Self {
            targets: [0; Self::CAPACITY],
            len: 0,
            full_flush: false,
        }
    }

    pub fn queue(&mut self, addr: VirtualAddress) {
        if self.full_flush {
            return;
        }
        if self.len == Self::CAPACITY {
            self.full_flush = true;
            return;
        }
        self.targets[self.len] = addr.as_u64();
        self.len += 1;
    }

    /// Apply and clear the batch.
    pub fn flush(&mut self) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            use x86_64::instructions::tlb;
            if self.full_flush {
                tlb::flush_all();
            } else {
                for &t in &self.targets[..self.len] {
                    tlb::flush(x86_64::VirtAddr::new(t));
                }
            }
        }
        self.len = 0;
        self.full_flush = false;
    }

    pub fn pending(&self) -> usize {
        if self.full_flush {
            Self::CAPACITY + 1
        } else {
            self.len
        }
    }
}

/// Kernel access to physical memory: identity window below 4 GiB, fixed
/// offset above it.
#[derive(Clone, Copy)]
pub struct KernelPhysMapper;

impl PhysMapper for KernelPhysMapper {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        if pa.as_u64() < IDENTITY_MAP_SIZE {
            pa.as_u64() as *mut u8
        } else {
            (pa.as_u64() + KERNEL_VIRTUAL_OFFSET) as *mut u8
        }
    }
}

/// Frame supply from the global PMM.
#[derive(Clone, Copy)]
pub struct PmmFrames;

impl FrameSource for PmmFrames {
    fn alloc_frame(&mut self) -> Result<PhysicalAddress, MemError> {
        FRAME_ALLOCATOR.lock().alloc().map(|f| f.as_addr())
    }

    fn free_frame(&mut self, pa: PhysicalAddress) {
        // A frame the VMM hands back was mapped by the VMM; a double free
        // here is a kernel bug, surfaced loudly.
        if FRAME_ALLOCATOR.lock().free(pa.as_frame()).is_err() {
            panic!("vmm freed frame {} twice", pa);
        }
    }
}

/// Virtual memory statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct VmmStats {
    pub mapped_pages: u64,
    pub huge_pages: u64,
    pub guard_pages: u64,
    pub mmio_pages: u64,
}

/// The virtual memory manager, generic over its backing so the host test
/// harness can drive the real logic against in-memory tables.
pub struct Vmm<M: PhysMapper, F: FrameSource> {
    phys: M,
    frames: F,
    root: PhysicalAddress,
    buddy: BuddyAllocator,
    mmio_cursor: u64,
    tlb: TlbBatch,
    stats: VmmStats,
    ready: bool,
}

pub type KernelVmm = Vmm<KernelPhysMapper, PmmFrames>;

impl<M: PhysMapper, F: FrameSource> Vmm<M, F> {
    pub const fn new(phys: M, frames: F) -> Self {
        Self {
            phys,
            frames,
            root: PhysicalAddress::new(0),
            buddy: BuddyAllocator::new(),
            mmio_cursor: MMIO_WINDOW_START,
            tlb: TlbBatch::new(),
            stats: VmmStats {
                mapped_pages: 0,
                huge_pages: 0,
                guard_pages: 0,
                mmio_pages: 0,
            },
            ready: false,
        }
    }

    /// Allocate and zero the PML4, bind the buddy allocator to the
    /// general part of the heap window.
    pub fn init(&mut self) -> Result<(), VmError> {
        let root = self.frames.alloc_frame().map_err(|_| VmError::NoMem)?;
        // SAFETY: freshly allocated frame, reachable through `phys`.
        unsafe { (*(self.phys.phys_to_ptr(root) as *mut PageTable)).zero() };
        self.root = root;
        self.buddy.init(HEAP_WINDOW_START, MMIO_WINDOW_START);
        self.ready = true;
        Ok(())
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn stats(&self) -> VmmStats {
        self.stats
    }

    fn mapper(&self) -> Mapper<'_, M> {
        // SAFETY: `root` was installed by `init` and all mutation is
        // serialized by our caller holding the VMM lock.
        unsafe { Mapper::new(self.root, &self.phys) }
    }

    /// Split-borrow the walker and the frame source so one call can use
    /// both.
    fn parts(&mut self) -> (Mapper<'_, M>, &mut F) {
        // SAFETY: same contract as `mapper`.
        let mapper = unsafe { Mapper::new(self.root, &self.phys) };
        (mapper, &mut self.frames)
    }

    fn check_kernel_range(vaddr: VirtualAddress) -> Result<(), VmError> {
        if !vaddr.is_canonical() {
            return Err(VmError::InvalidAddr);
        }
        // Kernel mappings live in the heap window (the MMIO window is a
        // sub-range of it); the kernel image window is mapped once at
        // init and never through this path.
        if !vaddr.in_heap_window() && vaddr.as_u64() < KERNEL_VIRTUAL_OFFSET {
            return Err(VmError::InvalidAddr);
        }
        Ok(())
    }

    /// Map one 4 KiB page.
    pub fn map(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageEntryFlags,
    ) -> Result<(), VmError> {
        if !vaddr.is_page_aligned() || !paddr.is_frame_aligned() {
            return Err(VmError::Align);
        }
        Self::check_kernel_range(vaddr)?;
        let (mapper, frames) = self.parts();
        mapper.map(vaddr, paddr, flags, frames)?;
        self.stats.mapped_pages += 1;
        self.tlb.queue(vaddr);
        self.tlb.flush();
        Ok(())
    }

    /// Map one 2 MiB page.
    pub fn map_huge(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageEntryFlags,
    ) -> Result<(), VmError> {
        const HUGE_MASK: u64 = (1 << 21) - 1;
        if vaddr.as_u64() & HUGE_MASK != 0 || paddr.as_u64() & HUGE_MASK != 0 {
            return Err(VmError::Align);
        }
        if !vaddr.is_canonical() {
            return Err(VmError::InvalidAddr);
        }
        let (mapper, frames) = self.parts();
        mapper.map_huge(vaddr, paddr, flags, frames)?;
        self.stats.huge_pages += 1;
        self.tlb.queue(vaddr);
        self.tlb.flush();
        Ok(())
    }

    /// Map a device register range. Flags are forced uncached and the
    /// batch is fenced so the mapping is visible before first access.
    pub fn map_mmio(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        size: usize,
        flags: PageEntryFlags,
    ) -> Result<(), VmError> {
        if !vaddr.is_page_aligned() || !paddr.is_frame_aligned() {
            return Err(VmError::Align);
        }
        if !vaddr.in_mmio_window() {
            return Err(VmError::InvalidAddr);
        }
        let forced = flags | PageEntryFlags::mmio();
        let pages = size.div_ceil(FRAME_SIZE);
        for i in 0..pages {
            let va = vaddr.offset((i * FRAME_SIZE) as u64);
            let pa = paddr.offset((i * FRAME_SIZE) as u64);
            let (mapper, frames) = self.parts();
            mapper.map(va, pa, forced, frames)?;
            self.stats.mmio_pages += 1;
            self.tlb.queue(va);
        }
        self.tlb.flush();
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: mfence has no operands and no memory safety impact.
        unsafe {
            core::arch::asm!("mfence", options(nostack, preserves_flags));
        }
        Ok(())
    }

    /// Reserve MMIO window space and map `paddr` there.
    pub fn alloc_mmio(
        &mut self,
        paddr: PhysicalAddress,
        size: usize,
    ) -> Result<VirtualAddress, VmError> {
        let pages = size.div_ceil(FRAME_SIZE) as u64;
        let va = VirtualAddress::new(self.mmio_cursor);
        if self.mmio_cursor + pages * FRAME_SIZE as u64 > MMIO_WINDOW_END {
            return Err(VmError::AddressSpaceExhausted);
        }
        self.mmio_cursor += pages * FRAME_SIZE as u64;
        self.map_mmio(va, paddr, size, PageEntryFlags::empty())?;
        Ok(va)
    }

    /// Remove the mappings covering `[vaddr, vaddr + size)`. Frames are
    /// not released; that is the caller's decision.
    pub fn unmap(&mut self, vaddr: VirtualAddress, size: usize) -> Result<(), VmError> {
        if !vaddr.is_page_aligned() {
            return Err(VmError::Align);
        }
        let pages = size.div_ceil(FRAME_SIZE);
        for i in 0..pages {
            let va = vaddr.offset((i * FRAME_SIZE) as u64);
            let r = self.mapper().unmap(va)?;
            if r.huge {
                self.stats.huge_pages -= 1;
            } else {
                self.stats.mapped_pages -= 1;
            }
            self.tlb.queue(va);
        }
        self.tlb.flush();
        Ok(())
    }

    /// Resolve a virtual address, large-page aware.
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        self.resolve(vaddr).map(|r| r.phys)
    }

    /// Resolve with flags, for callers that need protection bits.
    pub fn resolve(&self, vaddr: VirtualAddress) -> Option<Resolved> {
        if !self.ready {
            return None;
        }
        self.mapper().translate(vaddr)
    }

    pub fn is_mapped(&self, vaddr: VirtualAddress) -> bool {
        self.resolve(vaddr).is_some()
    }

    /// Allocate `size` bytes of mapped, zeroed kernel memory.
    pub fn alloc(&mut self, size: usize) -> Result<VirtualAddress, VmError> {
        let pages = size.div_ceil(FRAME_SIZE);
        let base = self
            .buddy
            .alloc((pages * FRAME_SIZE) as u64)
            .ok_or(VmError::AddressSpaceExhausted)?;
        match self.back_range(base, pages, PageEntryFlags::kernel_rw()) {
            Ok(()) => Ok(base),
            Err(e) => {
                self.buddy.free(base, (pages * FRAME_SIZE) as u64);
                Err(e)
            }
        }
    }

    /// Allocate with an unmapped page on each side. The returned pointer
    /// is page aligned; touching either neighbour faults.
    pub fn alloc_with_guards(&mut self, size: usize) -> Result<VirtualAddress, VmError> {
        let pages = size.div_ceil(FRAME_SIZE);
        let total = pages + 2;
        let block = self
            .buddy
            .alloc((total * FRAME_SIZE) as u64)
            .ok_or(VmError::AddressSpaceExhausted)?;
        let interior = block.offset(FRAME_SIZE as u64);
        match self.back_range(interior, pages, PageEntryFlags::kernel_rw()) {
            Ok(()) => {
                self.stats.guard_pages += 2;
                Ok(interior)
            }
            Err(e) => {
                self.buddy.free(block, (total * FRAME_SIZE) as u64);
                Err(e)
            }
        }
    }

    /// Allocate a kernel stack: `size` usable bytes above one unmapped
    /// guard page. Returns the initial stack top (highest address).
    pub fn alloc_stack(&mut self, size: usize) -> Result<VirtualAddress, VmError> {
        let pages = size.div_ceil(FRAME_SIZE);
        let total = pages + 1;
        let block = self
            .buddy
            .alloc((total * FRAME_SIZE) as u64)
            .ok_or(VmError::AddressSpaceExhausted)?;
        let base = block.offset(FRAME_SIZE as u64);
        match self.back_range(base, pages, PageEntryFlags::kernel_rw()) {
            Ok(()) => {
                self.stats.guard_pages += 1;
                Ok(base.offset((pages * FRAME_SIZE) as u64))
            }
            Err(e) => {
                self.buddy.free(block, (total * FRAME_SIZE) as u64);
                Err(e)
            }
        }
    }

    /// Release an `alloc` result: unmap, free frames, return the block.
    pub fn free(&mut self, vaddr: VirtualAddress, size: usize) -> Result<(), VmError> {
        let pages = size.div_ceil(FRAME_SIZE);
        self.release_range(vaddr, pages)?;
        self.buddy.free(vaddr, (pages * FRAME_SIZE) as u64);
        Ok(())
    }

    /// Release an `alloc_with_guards` result.
    pub fn free_with_guards(&mut self, vaddr: VirtualAddress, size: usize) -> Result<(), VmError> {
        let pages = size.div_ceil(FRAME_SIZE);
        self.release_range(vaddr, pages)?;
        self.stats.guard_pages -= 2;
        self.buddy.free(
            vaddr.offset(-(FRAME_SIZE as i64) as u64),
            ((pages + 2) * FRAME_SIZE) as u64,
        );
        Ok(())
    }

    /// Release an `alloc_stack` result given its top and usable size.
    pub fn free_stack(&mut self, top: VirtualAddress, size: usize) -> Result<(), VmError> {
        let pages = size.div_ceil(FRAME_SIZE);
        let base = VirtualAddress::new(top.as_u64() - (pages * FRAME_SIZE) as u64);
        self.release_range(base, pages)?;
        self.stats.guard_pages -= 1;
        self.buddy.free(
            base.offset(-(FRAME_SIZE as i64) as u64),
            ((pages + 1) * FRAME_SIZE) as u64,
        );
        Ok(())
    }

    /// Back `pages` pages starting at `base` with fresh frames, rolling
    /// the whole range back if any step fails.
    fn back_range(
        &mut self,
        base: VirtualAddress,
        pages: usize,
        flags: PageEntryFlags,
    ) -> Result<(), VmError> {
        for i in 0..pages {
            let va = base.offset((i * FRAME_SIZE) as u64);
            let frame = match self.frames.alloc_frame() {
                Ok(f) => f,
                Err(_) => {
                    let _ = self.rollback(base, i);
                    return Err(VmError::NoMem);
                }
            };
            let (mapper, frames) = self.parts();
            if let Err(e) = mapper.map(va, frame, flags, frames) {
                self.frames.free_frame(frame);
                let _ = self.rollback(base, i);
                return Err(e);
            }
            self.stats.mapped_pages += 1;
            self.tlb.queue(va);
            // Zero through the physical window so the logic is identical
            // under the host test harness.
            // SAFETY: the frame was just allocated and mapped by us.
            unsafe {
                core::ptr::write_bytes(self.phys.phys_to_ptr(frame), 0, FRAME_SIZE);
            }
        }
        self.tlb.flush();
        Ok(())
    }

    fn rollback(&mut self, base: VirtualAddress, mapped: usize) -> Result<(), VmError> {
        self.release_range(base, mapped)
    }

    /// Unmap `pages` pages and return their frames to the source.
    fn release_range(&mut self, base: VirtualAddress, pages: usize) -> Result<(), VmError> {
        for i in 0..pages {
            let va = base.offset((i * FRAME_SIZE) as u64);
            let r = self.mapper().unmap(va)?;
            self.frames.free_frame(PhysicalAddress::new(
                r.phys.as_u64() & !(FRAME_SIZE as u64 - 1),
            ));
            self.stats.mapped_pages -= 1;
            self.tlb.queue(va);
        }
        self.tlb.flush();
        Ok(())
    }
}

/// Global kernel VMM. Lives in BSS; `init()` fills it in place so the
/// large buddy tables never transit the boot stack.
pub static KERNEL_VMM: SpinLock<KernelVmm> =
    SpinLock::new(Vmm::new(KernelPhysMapper, PmmFrames));

/// Build the kernel address space and switch to it.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() {
    extern "C" {
        static __text_start: u8;
        static __text_end: u8;
        static __rodata_start: u8;
        static __rodata_end: u8;
        static __data_start: u8;
        static __data_end: u8;
    }

    let mut vmm = KERNEL_VMM.lock();
    vmm.init().expect("vmm init");

    // Identity-map the low 4 GiB with global 2 MiB pages so physical
    // memory (and the page tables themselves) stay reachable.
    let mut pa = 0u64;
    while pa < IDENTITY_MAP_SIZE {
        let flags = PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE | PageEntryFlags::GLOBAL;
        let (mapper, frames) = vmm.parts();
        mapper
            .map_huge(VirtualAddress::new(pa), PhysicalAddress::new(pa), flags, frames)
            .expect("identity map");
        pa += 2 * 1024 * 1024;
    }

    // Kernel image sections at the high window: .text R-X, .rodata R--,
    // .data/.bss RW-. A stray write into text or rodata faults. The
    // linker places sections at KERNEL_VIRTUAL_OFFSET + physical, so the
    // translation back is a single subtraction.
    // SAFETY: linker-script symbols; only their addresses are used.
    let (text, rodata, data) = unsafe {
        (
            (
                &__text_start as *const u8 as u64,
                &__text_end as *const u8 as u64,
            ),
            (
                &__rodata_start as *const u8 as u64,
                &__rodata_end as *const u8 as u64,
            ),
            (
                &__data_start as *const u8 as u64,
                &__data_end as *const u8 as u64,
            ),
        )
    };

    let mut map_section = |start: u64, end: u64, flags: PageEntryFlags| {
        let mut va = start & !(FRAME_SIZE as u64 - 1);
        while va < end {
            let (mapper, frames) = vmm.parts();
            let _ = mapper.map(
                VirtualAddress::new(va),
                PhysicalAddress::new(va - KERNEL_VIRTUAL_OFFSET),
                flags,
                frames,
            );
            va += FRAME_SIZE as u64;
        }
    };

    map_section(text.0, text.1, PageEntryFlags::kernel_text() | PageEntryFlags::GLOBAL);
    map_section(rodata.0, rodata.1, PageEntryFlags::kernel_ro() | PageEntryFlags::GLOBAL);
    map_section(data.0, data.1, PageEntryFlags::kernel_rw() | PageEntryFlags::GLOBAL);

    // Switch to the new hierarchy.
    // SAFETY: the new PML4 covers the identity window and the kernel
    // image, so execution continues seamlessly after the CR3 write.
    unsafe {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(vmm.root().as_u64()));
        Cr3::write(frame, Cr3Flags::empty());
    }

    log::info!(
        "vmm online: pml4 at {}, heap window {:#x}..{:#x}",
        vmm.root(),
        HEAP_WINDOW_START,
        super::HEAP_WINDOW_END
    );
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    use super::super::page_table::PAGE_TABLE_ENTRIES;
    use super::*;

    /// Host backing: every "frame" is a leaked 4 KiB box; its address is
    /// the fake physical address, so phys_to_ptr is the identity.
    #[derive(Clone)]
    struct HostBacking {
        frames: Rc<RefCell<Vec<*mut PageTable>>>,
        freed: Rc<RefCell<Vec<u64>>>,
        fail_after: Rc<RefCell<Option<usize>>>,
    }

    impl HostBacking {
        fn new() -> Self {
            Self {
                frames: Rc::new(RefCell::new(Vec::new())),
                freed: Rc::new(RefCell::new(Vec::new())),
                fail_after: Rc::new(RefCell::new(None)),
            }
        }

        fn outstanding(&self) -> isize {
            self.frames.borrow().len() as isize - self.freed.borrow().len() as isize
        }
    }

    impl PhysMapper for HostBacking {
        fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
            pa.as_u64() as *mut u8
        }
    }

    impl FrameSource for HostBacking {
        fn alloc_frame(&mut self) -> Result<PhysicalAddress, MemError> {
            if let Some(n) = self.fail_after.borrow_mut().as_mut() {
                if *n == 0 {
                    return Err(MemError::OutOfFrames);
                }
                *n -= 1;
            }
            let table = Box::into_raw(Box::new(PageTable::new()));
            self.frames.borrow_mut().push(table);
            Ok(PhysicalAddress::new(table as u64))
        }

        fn free_frame(&mut self, pa: PhysicalAddress) {
            self.freed.borrow_mut().push(pa.as_u64());
        }
    }

    fn host_vmm() -> Box<Vmm<HostBacking, HostBacking>> {
        let backing = HostBacking::new();
        let mut vmm = Box::new(Vmm::new(backing.clone(), backing));
        vmm.init().unwrap();
        vmm
    }

    #[test]
    fn test_map_translate_round_trip() {
        let mut vmm = host_vmm();
        let va = VirtualAddress::new(HEAP_WINDOW_START + 0x10_0000);
        let pa = PhysicalAddress::new(0xAB_C000);
        vmm.map(va, pa, PageEntryFlags::kernel_rw()).unwrap();
        assert_eq!(vmm.translate(va), Some(pa));
        let r = vmm.resolve(va).unwrap();
        assert!(r.flags.contains(PageEntryFlags::WRITABLE));
    }

    #[test]
    fn test_map_rejects_misaligned() {
        let mut vmm = host_vmm();
        assert_eq!(
            vmm.map(
                VirtualAddress::new(HEAP_WINDOW_START + 123),
                PhysicalAddress::new(0x1000),
                PageEntryFlags::kernel_rw()
            ),
            Err(VmError::Align)
        );
        assert_eq!(
            vmm.map(
                VirtualAddress::new(HEAP_WINDOW_START),
                PhysicalAddress::new(0x1234),
                PageEntryFlags::kernel_rw()
            ),
            Err(VmError::Align)
        );
    }

    #[test]
    fn test_map_rejects_bad_window() {
        let mut vmm = host_vmm();
        // User space address is not a kernel mapping target.
        assert_eq!(
            vmm.map(
                VirtualAddress::new(0x1000),
                PhysicalAddress::new(0x1000),
                PageEntryFlags::kernel_rw()
            ),
            Err(VmError::InvalidAddr)
        );
        // Non-canonical.
        assert_eq!(
            vmm.map(
                VirtualAddress::new(0x0001_0000_0000_0000),
                PhysicalAddress::new(0x1000),
                PageEntryFlags::kernel_rw()
            ),
            Err(VmError::InvalidAddr)
        );
    }

    #[test]
    fn test_double_map_rejected() {
        let mut vmm = host_vmm();
        let va = VirtualAddress::new(HEAP_WINDOW_START);
        vmm.map(va, PhysicalAddress::new(0x1000), PageEntryFlags::kernel_rw())
            .unwrap();
        assert_eq!(
            vmm.map(va, PhysicalAddress::new(0x2000), PageEntryFlags::kernel_rw()),
            Err(VmError::AlreadyMapped)
        );
    }

    #[test]
    fn test_unmap_then_translate_fails() {
        let mut vmm = host_vmm();
        let va = VirtualAddress::new(HEAP_WINDOW_START + 0x2000);
        vmm.map(va, PhysicalAddress::new(0x3000), PageEntryFlags::kernel_rw())
            .unwrap();
        vmm.unmap(va, FRAME_SIZE).unwrap();
        assert_eq!(vmm.translate(va), None);
        assert_eq!(vmm.unmap(va, FRAME_SIZE), Err(VmError::NotMapped));
    }

    #[test]
    fn test_alloc_maps_and_zeroes() {
        let mut vmm = host_vmm();
        let va = vmm.alloc(3 * FRAME_SIZE).unwrap();
        for i in 0..3 {
            let page = va.offset((i * FRAME_SIZE) as u64);
            let r = vmm.resolve(page).unwrap();
            // The backing frame is real host memory; check the zeroing.
            let ptr = r.phys.as_u64() as *const u8;
            // SAFETY: test backing frames are live boxed buffers.
            let first = unsafe { *ptr };
            assert_eq!(first, 0);
        }
        // Page 4 of the block is unmapped (allocation was 3 pages).
        assert!(vmm.resolve(va.offset((3 * FRAME_SIZE) as u64)).is_none());
    }

    #[test]
    fn test_alloc_with_guards_window() {
        let mut vmm = host_vmm();
        let size = 2 * FRAME_SIZE;
        let q = vmm.alloc_with_guards(size).unwrap();
        assert!(q.is_page_aligned());
        // Interior pages mapped.
        assert!(vmm.is_mapped(q));
        assert!(vmm.is_mapped(q.offset(size as u64 - 1)));
        // Guards unmapped on both sides.
        assert!(!vmm.is_mapped(q.offset(-(1i64) as u64)));
        assert!(!vmm.is_mapped(q.offset(size as u64)));
    }

    #[test]
    fn test_alloc_stack_top_and_guard() {
        let mut vmm = host_vmm();
        let top = vmm.alloc_stack(4 * FRAME_SIZE).unwrap();
        assert!(top.is_page_aligned());
        // The page below the top is usable stack.
        assert!(vmm.is_mapped(top.offset(-(FRAME_SIZE as i64) as u64)));
        // The guard page below the stack bottom is not.
        let bottom = VirtualAddress::new(top.as_u64() - 4 * FRAME_SIZE as u64);
        assert!(!vmm.is_mapped(bottom.offset(-(1i64) as u64)));
    }

    #[test]
    fn test_free_releases_frames() {
        let mut vmm = host_vmm();
        let before = vmm.phys.outstanding();
        let va = vmm.alloc(2 * FRAME_SIZE).unwrap();
        vmm.free(va, 2 * FRAME_SIZE).unwrap();
        // Data frames came back; intermediate tables stay.
        let after = vmm.phys.outstanding();
        assert!(after <= before + 3, "only table frames may remain");
        assert!(!vmm.is_mapped(va));
    }

    #[test]
    fn test_partial_alloc_rolls_back() {
        let mut vmm = host_vmm();
        // Map something first so the intermediate tables exist.
        let _ = vmm.alloc(FRAME_SIZE).unwrap();
        let outstanding = vmm.phys.outstanding();
        // Allow two more frames, then fail: a 4-page alloc cannot finish.
        *vmm.phys.fail_after.borrow_mut() = Some(2);
        assert_eq!(vmm.alloc(4 * FRAME_SIZE), Err(VmError::NoMem));
        *vmm.phys.fail_after.borrow_mut() = None;
        // Everything the failed attempt took was handed back.
        assert_eq!(vmm.phys.outstanding(), outstanding);
    }

    #[test]
    fn test_mmio_forces_uncached() {
        let mut vmm = host_vmm();
        let va = vmm.alloc_mmio(PhysicalAddress::new(0xFE00_0000), 2 * FRAME_SIZE).unwrap();
        assert!(va.in_mmio_window());
        let r = vmm.resolve(va).unwrap();
        assert!(r.flags.contains(PageEntryFlags::NO_CACHE));
        assert!(r.flags.contains(PageEntryFlags::WRITE_THROUGH));
    }

    #[test]
    fn test_mmio_outside_window_rejected() {
        let mut vmm = host_vmm();
        assert_eq!(
            vmm.map_mmio(
                VirtualAddress::new(HEAP_WINDOW_START),
                PhysicalAddress::new(0xFE00_0000),
                FRAME_SIZE,
                PageEntryFlags::empty()
            ),
            Err(VmError::InvalidAddr)
        );
    }

    #[test]
    fn test_tlb_batch_overflow() {
        let mut batch = TlbBatch::new();
        for i in 0..70u64 {
            batch.queue(VirtualAddress::new(i << 12));
        }
        // Past 64 targets the batch degrades to a full flush.
        assert!(batch.pending() > TlbBatch::CAPACITY);
        batch.flush();
        assert_eq!(batch.pending(), 0);
    }

    #[test]
    fn test_entry_count_constant() {
        assert_eq!(PAGE_TABLE_ENTRIES, 512);
    }
}
