//! Physical frame allocator.
//!
//! A densely packed bitmap over 4 KiB frames, seeded from the Multiboot2
//! memory map: AVAILABLE regions become free, everything else (reserved
//! ranges, ACPI, the first megabyte, the kernel image, the boot info
//! itself) is marked used. A "first possibly free" cursor keeps the linear
//! scan short in the common case.
//!
//! A frame must never be marked free while a page table entry still
//! references it; `free_frame` trusts its caller on that point but does
//! detect double frees.

use crate::error::MemError;
use crate::sync::SpinLock;

use super::{FrameNumber, PhysicalAddress, FRAME_SIZE};

/// Managed ceiling: 4 GiB of physical memory (1M frames).
pub const MAX_FRAMES: usize = 4 * 1024 * 1024 * 1024 / FRAME_SIZE;

const BITMAP_WORDS: usize = MAX_FRAMES / 64;

/// Allocator statistics as reported by `stats()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total_frames: u64,
    pub used_frames: u64,
    pub free_frames: u64,
    pub alloc_count: u64,
    pub free_count: u64,
    pub alloc_failures: u64,
    pub largest_free_run: u64,
    /// 0 = one contiguous free block, 100 = maximally scattered.
    pub fragmentation_pct: u64,
}

/// Bitmap frame allocator. Bit set = frame used.
pub struct FrameAllocator {
    bitmap: [u64; BITMAP_WORDS],
    total_frames: u64,
    used_frames: u64,
    /// Lowest index that might be free.
    cursor: u64,
    alloc_count: u64,
    free_count: u64,
    alloc_failures: u64,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            total_frames: 0,
            used_frames: 0,
            cursor: 0,
            alloc_count: 0,
            free_count: 0,
            alloc_failures: 0,
        }
    }

    fn is_used(&self, idx: u64) -> bool {
        self.bitmap[(idx / 64) as usize] & (1 << (idx % 64)) != 0
    }

    fn mark_used(&mut self, idx: u64) {
        if idx >= self.total_frames {
            return;
        }
        let word = (idx / 64) as usize;
        let bit = 1u64 << (idx % 64);
        if self.bitmap[word] & bit == 0 {
            self.bitmap[word] |= bit;
            self.used_frames += 1;
        }
    }

    fn mark_free(&mut self, idx: u64) {
        if idx >= self.total_frames {
            return;
        }
        let word = (idx / 64) as usize;
        let bit = 1u64 << (idx % 64);
        if self.bitmap[word] & bit != 0 {
            self.bitmap[word] &= !bit;
            self.used_frames -= 1;
        }
    }

    /// Set up the managed range: `total` frames, all initially used.
    /// Free regions are then punched in with `seed_free_range`.
    pub fn set_total(&mut self, total: u64) {
        let total = total.min(MAX_FRAMES as u64);
        self.total_frames = total;
        self.used_frames = total;
        for word in self.bitmap.iter_mut() {
            *word = u64::MAX;
        }
        self.cursor = 0;
    }

    /// Mark `[start, start + count)` free during seeding.
    pub fn seed_free_range(&mut self, start: FrameNumber, count: u64) {
        for idx in start.as_u64()..start.as_u64().saturating_add(count) {
            self.mark_free(idx);
        }
    }

    /// Mark `[start, start + count)` used (reserved regions, kernel image).
    pub fn seed_used_range(&mut self, start: FrameNumber, count: u64) {
        for idx in start.as_u64()..start.as_u64().saturating_add(count) {
            self.mark_used(idx);
        }
    }

    /// Allocate one frame.
    pub fn alloc(&mut self) -> Result<FrameNumber, MemError> {
        let mut idx = self.cursor;
        while idx < self.total_frames {
            // Skip fully used words.
            if idx % 64 == 0 {
                while idx < self.total_frames && self.bitmap[(idx / 64) as usize] == u64::MAX {
                    idx += 64;
                }
                if idx >= self.total_frames {
                    break;
                }
            }
            if !self.is_used(idx) {
                self.mark_used(idx);
                self.cursor = idx + 1;
                self.alloc_count += 1;
                return Ok(FrameNumber::new(idx));
            }
            idx += 1;
        }
        self.alloc_failures += 1;
        Err(MemError::OutOfFrames)
    }

    /// Release one frame. Double frees are detected, not silently absorbed.
    pub fn free(&mut self, frame: FrameNumber) -> Result<(), MemError> {
        let idx = frame.as_u64();
        if idx >= self.total_frames {
            return Err(MemError::InvalidFrame);
        }
        if !self.is_used(idx) {
            return Err(MemError::DoubleFree);
        }
        self.mark_free(idx);
        if idx < self.cursor {
            self.cursor = idx;
        }
        self.free_count += 1;
        Ok(())
    }

    /// Allocate `count` consecutive frames (DMA buffers, large pages).
    pub fn alloc_contiguous(&mut self, count: u64) -> Result<FrameNumber, MemError> {
        self.alloc_contiguous_aligned(count, 1)
    }

    /// Allocate `count` consecutive frames whose start index is a multiple
    /// of `align_frames`. A 2 MiB page wants `align_frames = 512`.
    pub fn alloc_contiguous_aligned(
        &mut self,
        count: u64,
        align_frames: u64,
    ) -> Result<FrameNumber, MemError> {
        if count == 0 || count > self.total_frames {
            self.alloc_failures += 1;
            return Err(MemError::OutOfFrames);
        }
        let align = align_frames.max(1);
        let mut start = 0u64;
        while start + count <= self.total_frames {
            if start % align != 0 {
                start += align - (start % align);
                continue;
            }
            let mut run = 0;
            while run < count && !self.is_used(start + run) {
                run += 1;
            }
            if run == count {
                for idx in start..start + count {
                    self.mark_used(idx);
                }
                self.alloc_count += 1;
                return Ok(FrameNumber::new(start));
            }
            // Jump past the used frame that broke the run.
            start = ((start + run + 1).div_ceil(align)) * align;
        }
        self.alloc_failures += 1;
        Err(MemError::OutOfFrames)
    }

    /// Allocate one naturally aligned 2 MiB huge page.
    pub fn alloc_huge(&mut self) -> Result<FrameNumber, MemError> {
        self.alloc_contiguous_aligned(512, 512)
    }

    /// Free a contiguous run previously handed out by `alloc_contiguous`.
    pub fn free_contiguous(&mut self, start: FrameNumber, count: u64) -> Result<(), MemError> {
        for i in 0..count {
            self.free(FrameNumber::new(start.as_u64() + i))?;
        }
        Ok(())
    }

    /// Whether a frame is currently free. Seeding helpers aside, this is
    /// only a diagnostic.
    pub fn is_frame_free(&self, frame: FrameNumber) -> bool {
        frame.as_u64() < self.total_frames && !self.is_used(frame.as_u64())
    }

    pub fn stats(&self) -> FrameStats {
        let mut largest = 0u64;
        let mut run = 0u64;
        for idx in 0..self.total_frames {
            if self.is_used(idx) {
                largest = largest.max(run);
                run = 0;
            } else {
                run += 1;
            }
        }
        largest = largest.max(run);

        let free = self.total_frames - self.used_frames;
        let fragmentation = if free == 0 {
            0
        } else {
            100 - largest * 100 / free
        };

        FrameStats {
            total_frames: self.total_frames,
            used_frames: self.used_frames,
            free_frames: free,
            alloc_count: self.alloc_count,
            free_count: self.free_count,
            alloc_failures: self.alloc_failures,
            largest_free_run: largest,
            fragmentation_pct: fragmentation,
        }
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator. First in the kernel lock order.
pub static FRAME_ALLOCATOR: SpinLock<FrameAllocator> = SpinLock::new(FrameAllocator::new());

/// Seed the global allocator from the Multiboot2 memory map.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init(boot_info: &crate::boot::multiboot2::BootInfo) {
    use crate::boot::multiboot2::MemoryRegionKind;

    extern "C" {
        static __kernel_phys_start: u8;
        static __kernel_phys_end: u8;
    }

    let mut pmm = FRAME_ALLOCATOR.lock();

    // Highest AVAILABLE end address bounds the managed range.
    let mut max_end = 0u64;
    for region in boot_info.memory_regions() {
        if region.kind == MemoryRegionKind::Available {
            max_end = max_end.max(region.base + region.length);
        }
    }
    pmm.set_total(max_end / FRAME_SIZE as u64);

    for region in boot_info.memory_regions() {
        if region.kind == MemoryRegionKind::Available {
            let start = region.base.div_ceil(FRAME_SIZE as u64);
            let end = (region.base + region.length) / FRAME_SIZE as u64;
            if end > start {
                pmm.seed_free_range(FrameNumber::new(start), end - start);
            }
        }
    }

    // First megabyte stays reserved.
    pmm.seed_used_range(FrameNumber::new(0), (0x10_0000 / FRAME_SIZE) as u64);

    // Kernel image frames, from the linker symbols.
    // SAFETY: the symbols are defined by the linker script and only their
    // addresses are taken.
    let (kstart, kend) = unsafe {
        (
            &__kernel_phys_start as *const u8 as u64,
            &__kernel_phys_end as *const u8 as u64,
        )
    };
    let kstart_frame = kstart / FRAME_SIZE as u64;
    let kend_frame = kend.div_ceil(FRAME_SIZE as u64);
    pmm.seed_used_range(FrameNumber::new(kstart_frame), kend_frame - kstart_frame);

    // The boot info structure itself.
    let info_start = boot_info.base_addr() / FRAME_SIZE as u64;
    let info_end = (boot_info.base_addr() + boot_info.total_size() as u64)
        .div_ceil(FRAME_SIZE as u64);
    pmm.seed_used_range(FrameNumber::new(info_start), info_end - info_start);
}

/// Allocate a single zeroed-by-caller frame from the global allocator.
pub fn alloc_frame() -> Result<PhysicalAddress, MemError> {
    FRAME_ALLOCATOR.lock().alloc().map(|f| f.as_addr())
}

/// Return a frame to the global allocator.
pub fn free_frame(addr: PhysicalAddress) -> Result<(), MemError> {
    FRAME_ALLOCATOR.lock().free(addr.as_frame())
}
