//! General-purpose kernel heap.
//!
//! Size-segregated free lists for the common small sizes (16 bytes to
//! 2 KiB); anything larger is carved straight from the buddy-backed VMM.
//! A per-CPU cache fronts the global lists (degenerate but real on one
//! CPU), and every block carries a magic header so frees can be checked.
//!
//! The heap starts life over a static bootstrap region so `alloc` works
//! before paging does, and switches to VMM pages during `mm::init`.
//! Blocks handed out from the bootstrap region stay valid forever — the
//! region is kernel BSS.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use crate::error::HeapError;
use crate::sync::SpinLock;

use super::FRAME_SIZE;

/// Small-allocation size classes.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

const CLASS_COUNT: usize = SIZE_CLASSES.len();

/// Per-class, per-CPU cache depth.
const CACHE_DEPTH: usize = 16;

/// SMP hook: sized for one CPU today, indexed by `cpu_id()`.
const MAX_CPUS: usize = 1;

/// Bootstrap region used before the VMM is live.
const BOOTSTRAP_SIZE: usize = 512 * 1024;

const HEADER_SIZE: usize = 16;

const MAGIC_ALLOC: u32 = 0x5646_4B48; // "VFKH"
const MAGIC_SHIFTED: u32 = 0x5646_4B53; // "VFKS", align > 16 redirect

const STATE_ALLOCATED: u8 = 0xA1;
const STATE_FREE: u8 = 0xF4;

/// Marker class value for large (page-backed) blocks.
const CLASS_LARGE: u8 = 0xFF;

/// Runtime validation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// No runtime checks.
    None,
    /// Magic and state check on every free.
    Basic,
    /// Free-list walk on every operation. Diagnostic only.
    Full,
}

/// Which caches are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Off,
    PerCpu,
    Tiered,
}

/// Block header, immediately before every payload.
#[repr(C)]
struct AllocHeader {
    magic: u32,
    state: u8,
    class: u8,
    _reserved: u16,
    /// Requested size (exact accounting), or the redirect offset for
    /// shifted headers.
    size: usize,
}

const _: () = assert!(core::mem::size_of::<AllocHeader>() == HEADER_SIZE);

/// Free-list link, stored in the payload of free blocks.
struct FreeNode {
    next: *mut FreeNode,
}

/// Backing store the heap grows from.
enum Backing {
    /// Not yet bound; binds to the bootstrap region on first use.
    Unbound,
    /// Bump allocation over a fixed region (bootstrap, or a test buffer).
    Fixed {
        base: *mut u8,
        size: usize,
        offset: usize,
    },
    /// Buddy-backed VMM pages.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    Vmm,
}

/// Heap statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStats {
    /// Bytes in live allocations (requested sizes).
    pub total_allocated: usize,
    /// High-water mark of `total_allocated`.
    pub peak_allocated: usize,
    pub alloc_count: u64,
    pub free_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Adjacent large blocks merged on free.
    pub coalesce_count: u64,
}

impl HeapStats {
    /// Cache hit rate in percent.
    pub fn cache_hit_pct(&self) -> u64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0
        } else {
            self.cache_hits * 100 / total
        }
    }
}

/// Large free block, threaded through its own payload.
struct LargeNode {
    next: *mut LargeNode,
    /// Whole-block capacity in bytes, header included.
    capacity: usize,
}

struct CpuCache {
    lists: [*mut FreeNode; CLASS_COUNT],
    counts: [usize; CLASS_COUNT],
}

impl CpuCache {
    const fn new() -> Self {
        Self {
            lists: [ptr::null_mut(); CLASS_COUNT],
            counts: [0; CLASS_COUNT],
        }
    }
}

/// The kernel heap. All state lives under one lock; the per-CPU caches
/// are the contention hook for a later SMP world.
pub struct Heap {
    free_lists: [*mut FreeNode; CLASS_COUNT],
    caches: [CpuCache; MAX_CPUS],
    large_free: *mut LargeNode,
    backing: Backing,
    validation: ValidationMode,
    cache_mode: CacheMode,
    stats: HeapStats,
    /// Blocks ever carved per class, bounding full-walk iteration.
    carved: [usize; CLASS_COUNT],
}

// SAFETY: the raw pointers reference memory owned by the heap; access is
// serialized by the surrounding SpinLock.
unsafe impl Send for Heap {}

static mut BOOTSTRAP_REGION: [u8; BOOTSTRAP_SIZE] = [0; BOOTSTRAP_SIZE];

impl Heap {
    pub const fn new() -> Self {
        Self {
            free_lists: [ptr::null_mut(); CLASS_COUNT],
            caches: [const { CpuCache::new() }; MAX_CPUS],
            large_free: ptr::null_mut(),
            backing: Backing::Unbound,
            validation: ValidationMode::Basic,
            cache_mode: CacheMode::PerCpu,
            stats: HeapStats {
                total_allocated: 0,
                peak_allocated: 0,
                alloc_count: 0,
                free_count: 0,
                cache_hits: 0,
                cache_misses: 0,
                coalesce_count: 0,
            },
            carved: [0; CLASS_COUNT],
        }
    }

    /// Heap for a caller-provided region (tests, early bring-up probes).
    pub fn with_region(base: *mut u8, size: usize) -> Self {
        let mut heap = Self::new();
        heap.backing = Backing::Fixed {
            base,
            size,
            offset: 0,
        };
        heap
    }

    pub fn set_validation(&mut self, mode: ValidationMode) {
        self.validation = mode;
    }

    pub fn set_cache_mode(&mut self, mode: CacheMode) {
        self.cache_mode = mode;
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    fn cpu_id() -> usize {
        0
    }

    fn class_for(size: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&c| size <= c)
    }

    /// Page-aligned growth from the backing store.
    fn grow(&mut self, bytes: usize) -> Option<*mut u8> {
        let bytes = bytes.div_ceil(FRAME_SIZE) * FRAME_SIZE;
        if matches!(self.backing, Backing::Unbound) {
            // First use: bind the static bootstrap region.
            // SAFETY: addr_of_mut creates no intermediate reference; the
            // region is only reachable through this heap afterwards.
            let base = unsafe { ptr::addr_of_mut!(BOOTSTRAP_REGION) as *mut u8 };
            self.backing = Backing::Fixed {
                base,
                size: BOOTSTRAP_SIZE,
                offset: 0,
            };
        }
        match &mut self.backing {
            Backing::Unbound => unreachable!(),
            Backing::Fixed { base, size, offset } => {
                // Align the cursor up to a page first.
                let aligned =
                    (*base as usize + *offset).div_ceil(FRAME_SIZE) * FRAME_SIZE - *base as usize;
                if aligned + bytes > *size {
                    return None;
                }
                *offset = aligned + bytes;
                // SAFETY: in-bounds offset of the region.
                Some(unsafe { base.add(aligned) })
            }
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            Backing::Vmm => super::vmm::KERNEL_VMM
                .lock()
                .alloc(bytes)
                .ok()
                .map(|va| va.as_u64() as *mut u8),
        }
    }

    fn header_of(payload: *mut u8) -> *mut AllocHeader {
        // SAFETY contract: payload must come from this heap.
        payload.wrapping_sub(HEADER_SIZE) as *mut AllocHeader
    }

    /// Carve one page into blocks of `class` and push them on the global
    /// free list.
    fn refill_class(&mut self, class: usize) -> bool {
        let block = HEADER_SIZE + SIZE_CLASSES[class];
        let Some(page) = self.grow(FRAME_SIZE) else {
            return false;
        };
        let count = FRAME_SIZE / block;
        for i in 0..count {
            // SAFETY: offsets stay inside the page just grown.
            unsafe {
                let hdr = page.add(i * block) as *mut AllocHeader;
                (*hdr) = AllocHeader {
                    magic: MAGIC_ALLOC,
                    state: STATE_FREE,
                    class: class as u8,
                    _reserved: 0,
                    size: 0,
                };
                let node = page.add(i * block + HEADER_SIZE) as *mut FreeNode;
                (*node).next = self.free_lists[class];
                self.free_lists[class] = node;
            }
        }
        self.carved[class] += count;
        true
    }

    fn pop_class(&mut self, class: usize) -> Option<*mut u8> {
        // Cache first.
        if self.cache_mode != CacheMode::Off {
            let cache = &mut self.caches[Self::cpu_id()];
            let node = cache.lists[class];
            if !node.is_null() {
                // SAFETY: cache nodes are free blocks owned by the heap.
                cache.lists[class] = unsafe { (*node).next };
                cache.counts[class] -= 1;
                self.stats.cache_hits += 1;
                return Some(node as *mut u8);
            }
            self.stats.cache_misses += 1;
        }

        if self.free_lists[class].is_null() && !self.refill_class(class) {
            return None;
        }
        let node = self.free_lists[class];
        // SAFETY: list nodes are free blocks owned by the heap.
        self.free_lists[class] = unsafe { (*node).next };
        Some(node as *mut u8)
    }

    fn push_class(&mut self, payload: *mut u8, class: usize) {
        let node = payload as *mut FreeNode;
        if self.cache_mode != CacheMode::Off {
            let cache = &mut self.caches[Self::cpu_id()];
            if cache.counts[class] < CACHE_DEPTH {
                // SAFETY: the block is free and exclusively ours.
                unsafe {
                    (*node).next = cache.lists[class];
                }
                cache.lists[class] = node;
                cache.counts[class] += 1;
                return;
            }
        }
        // SAFETY: as above.
        unsafe {
            (*node).next = self.free_lists[class];
        }
        self.free_lists[class] = node;
    }

    /// First-fit search of the large free list; merges are done at free
    /// time, so this only pops.
    fn pop_large(&mut self, needed: usize) -> Option<(*mut u8, usize)> {
        let mut prev: *mut LargeNode = ptr::null_mut();
        let mut cur = self.large_free;
        while !cur.is_null() {
            // SAFETY: large list nodes live in blocks owned by the heap.
            unsafe {
                if (*cur).capacity >= needed {
                    if prev.is_null() {
                        self.large_free = (*cur).next;
                    } else {
                        (*prev).next = (*cur).next;
                    }
                    return Some((cur as *mut u8, (*cur).capacity));
                }
                prev = cur;
                cur = (*cur).next;
            }
        }
        None
    }

    /// Insert a large block, merging with an adjacent free block when the
    /// ranges touch.
    fn push_large(&mut self, base: *mut u8, capacity: usize) {
        // One merge pass: look for a block ending exactly at `base` or
        // starting exactly at `base + capacity`.
        let mut prev: *mut LargeNode = ptr::null_mut();
        let mut cur = self.large_free;
        while !cur.is_null() {
            // SAFETY: as in pop_large.
            unsafe {
                let cur_base = cur as *mut u8;
                let cur_cap = (*cur).capacity;
                let merged = if cur_base.wrapping_add(cur_cap) == base {
                    Some((cur_base, cur_cap + capacity))
                } else if base.wrapping_add(capacity) == cur_base {
                    Some((base, capacity + cur_cap))
                } else {
                    None
                };
                if let Some((new_base, new_cap)) = merged {
                    if prev.is_null() {
                        self.large_free = (*cur).next;
                    } else {
                        (*prev).next = (*cur).next;
                    }
                    self.stats.coalesce_count += 1;
                    return self.push_large(new_base, new_cap);
                }
                prev = cur;
                cur = (*cur).next;
            }
        }
        let node = base as *mut LargeNode;
        // SAFETY: the block is free and at least LargeNode-sized.
        unsafe {
            (*node).next = self.large_free;
            (*node).capacity = capacity;
        }
        self.large_free = node;
    }

    /// Allocate `size` bytes. Returns null on exhaustion, never panics.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        if self.validation == ValidationMode::Full {
            if let Err(e) = self.validate_full() {
                panic!("heap corrupt before alloc: {:?}", e);
            }
        }

        let payload = match Self::class_for(size) {
            Some(class) => {
                let Some(block) = self.pop_class(class) else {
                    return ptr::null_mut();
                };
                // SAFETY: the header precedes every class block.
                unsafe {
                    let hdr = Self::header_of(block);
                    (*hdr).state = STATE_ALLOCATED;
                    (*hdr).size = size;
                }
                block
            }
            None => {
                let needed = HEADER_SIZE + size;
                let (base, capacity) = match self.pop_large(needed) {
                    Some(hit) => hit,
                    None => {
                        let cap = needed.div_ceil(FRAME_SIZE) * FRAME_SIZE;
                        let Some(base) = self.grow(cap) else {
                            return ptr::null_mut();
                        };
                        (base, cap)
                    }
                };
                // SAFETY: block is at least HEADER_SIZE + size bytes.
                unsafe {
                    let hdr = base as *mut AllocHeader;
                    (*hdr) = AllocHeader {
                        magic: MAGIC_ALLOC,
                        state: STATE_ALLOCATED,
                        class: CLASS_LARGE,
                        _reserved: 0,
                        size,
                    };
                    // Remember the true capacity for the free path.
                    (*hdr)._reserved = (capacity / FRAME_SIZE).min(u16::MAX as usize) as u16;
                    base.add(HEADER_SIZE)
                }
            }
        };

        self.stats.alloc_count += 1;
        self.stats.total_allocated += size;
        self.stats.peak_allocated = self.stats.peak_allocated.max(self.stats.total_allocated);
        payload
    }

    /// Free a block. Detected corruption comes back as an error; the
    /// global wrapper turns it into a panic.
    pub fn free(&mut self, payload: *mut u8) -> Result<(), HeapError> {
        if payload.is_null() {
            return Ok(());
        }
        if self.validation == ValidationMode::Full {
            self.validate_full()?;
        }

        let hdr = Self::header_of(payload);
        // SAFETY: header location is implied by the allocation contract;
        // the magic check below is what catches contract violations.
        let (magic, state, class, size) =
            unsafe { ((*hdr).magic, (*hdr).state, (*hdr).class, (*hdr).size) };

        if self.validation != ValidationMode::None {
            if magic != MAGIC_ALLOC {
                return Err(HeapError::Corruption {
                    addr: payload as usize,
                });
            }
            if state == STATE_FREE {
                return Err(HeapError::DoubleFree {
                    addr: payload as usize,
                });
            }
            if state != STATE_ALLOCATED {
                return Err(HeapError::Corruption {
                    addr: payload as usize,
                });
            }
        }

        if class == CLASS_LARGE {
            // SAFETY: large header validated above.
            let capacity = unsafe { (*hdr)._reserved as usize * FRAME_SIZE };
            // SAFETY: same header; marking it free before requeueing.
            unsafe {
                (*hdr).state = STATE_FREE;
            }
            self.push_large(hdr as *mut u8, capacity);
        } else {
            let class = class as usize;
            if class >= CLASS_COUNT {
                return Err(HeapError::Corruption {
                    addr: payload as usize,
                });
            }
            // SAFETY: class header validated above.
            unsafe {
                (*hdr).state = STATE_FREE;
            }
            self.push_class(payload, class);
        }

        self.stats.free_count += 1;
        // Saturating: under ValidationMode::None a double free slips
        // through and must not wrap the counter.
        self.stats.total_allocated = self.stats.total_allocated.saturating_sub(size);
        Ok(())
    }

    /// Resize in place when the block already fits, else move.
    pub fn realloc(&mut self, payload: *mut u8, new_size: usize) -> *mut u8 {
        if payload.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            let _ = self.free(payload);
            return ptr::null_mut();
        }
        let hdr = Self::header_of(payload);
        // SAFETY: allocation contract; same as free.
        let (class, old_size) = unsafe { ((*hdr).class, (*hdr).size) };
        let capacity = if class == CLASS_LARGE {
            // SAFETY: as above.
            unsafe { (*hdr)._reserved as usize * FRAME_SIZE - HEADER_SIZE }
        } else {
            SIZE_CLASSES[class as usize]
        };
        if new_size <= capacity {
            // SAFETY: as above.
            unsafe {
                (*hdr).size = new_size;
            }
            self.stats.total_allocated = self.stats.total_allocated - old_size + new_size;
            self.stats.peak_allocated = self.stats.peak_allocated.max(self.stats.total_allocated);
            return payload;
        }
        let fresh = self.alloc(new_size);
        if fresh.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: both blocks are live and at least old_size bytes.
        unsafe {
            ptr::copy_nonoverlapping(payload, fresh, old_size.min(new_size));
        }
        let _ = self.free(payload);
        fresh
    }

    /// Allocate `n * size` zeroed bytes.
    pub fn calloc(&mut self, n: usize, size: usize) -> *mut u8 {
        let Some(total) = n.checked_mul(size) else {
            return ptr::null_mut();
        };
        let p = self.alloc(total);
        if !p.is_null() {
            // SAFETY: freshly allocated, total bytes long.
            unsafe {
                ptr::write_bytes(p, 0, total);
            }
        }
        p
    }

    /// Walk every free list checking headers and bounding iteration by
    /// the number of blocks ever carved. Catches cycles and clobbered
    /// free-block headers.
    pub fn validate_full(&self) -> Result<(), HeapError> {
        for class in 0..CLASS_COUNT {
            let bound = self.carved[class] + 1;
            let mut steps = 0usize;
            let mut walk = |mut node: *mut FreeNode| -> Result<(), HeapError> {
                while !node.is_null() {
                    steps += 1;
                    if steps > bound {
                        return Err(HeapError::Corruption { addr: node as usize });
                    }
                    // SAFETY: nodes were heap blocks; the header check is
                    // the point of this walk.
                    unsafe {
                        let hdr = Self::header_of(node as *mut u8);
                        if (*hdr).magic != MAGIC_ALLOC || (*hdr).state != STATE_FREE {
                            return Err(HeapError::Corruption { addr: node as usize });
                        }
                        node = (*node).next;
                    }
                }
                Ok(())
            };
            walk(self.free_lists[class])?;
            for cache in &self.caches {
                walk(cache.lists[class])?;
            }
        }
        Ok(())
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Global kernel heap. Third in the kernel lock order.
pub static KERNEL_HEAP: SpinLock<Heap> = SpinLock::new(Heap::new());

/// Switch the global heap from the bootstrap region to VMM-backed pages.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() {
    let mut heap = KERNEL_HEAP.lock();
    heap.backing = Backing::Vmm;
    log::info!("heap backing switched to vmm");
}

/// Allocate from the global heap. Null on exhaustion.
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    NonNull::new(KERNEL_HEAP.lock().alloc(size))
}

/// Free to the global heap. Corruption is fatal, per the error policy:
/// a clobbered header means an invariant other modules rely on is gone.
/// A double free is reported to Cerberus before the panic so the
/// violation is on the record.
pub fn kfree(ptr: *mut u8) {
    match KERNEL_HEAP.lock().free(ptr) {
        Ok(()) => {}
        Err(e @ HeapError::DoubleFree { addr }) => {
            crate::security::cerberus::track_free(addr as u64, crate::sched::current_pid());
            panic!("kfree: {:?}", e);
        }
        Err(e) => panic!("kfree: {:?}", e),
    }
}

/// Select the runtime validation level of the global heap.
pub fn set_validation_mode(mode: ValidationMode) {
    KERNEL_HEAP.lock().set_validation(mode);
}

/// Select which caches front the global heap.
pub fn set_cache_mode(mode: CacheMode) {
    KERNEL_HEAP.lock().set_cache_mode(mode);
}

pub fn krealloc(ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
    NonNull::new(KERNEL_HEAP.lock().realloc(ptr, new_size))
}

pub fn kcalloc(n: usize, size: usize) -> Option<NonNull<u8>> {
    NonNull::new(KERNEL_HEAP.lock().calloc(n, size))
}

pub fn heap_stats() -> HeapStats {
    KERNEL_HEAP.lock().stats()
}

/// `GlobalAlloc` façade over the kernel heap, installed as the global
/// allocator on bare metal.
pub struct KernelAllocator;

// SAFETY: alloc/dealloc delegate to the locked heap; alignment above 16
// is honored through shifted headers that record the original block.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = KERNEL_HEAP.lock();
        if layout.align() <= HEADER_SIZE {
            return heap.alloc(layout.size().max(1));
        }
        // Over-allocate, then plant a redirect header just below the
        // aligned payload.
        let raw = heap.alloc(layout.size() + layout.align() + HEADER_SIZE);
        if raw.is_null() {
            return raw;
        }
        let payload = ((raw as usize + HEADER_SIZE + layout.align() - 1) / layout.align())
            * layout.align();
        // SAFETY: payload - HEADER_SIZE lies inside the over-allocation.
        unsafe {
            let shifted = (payload - HEADER_SIZE) as *mut AllocHeader;
            (*shifted) = AllocHeader {
                magic: MAGIC_SHIFTED,
                state: STATE_ALLOCATED,
                class: 0,
                _reserved: 0,
                size: payload - raw as usize,
            };
        }
        payload as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let mut heap = KERNEL_HEAP.lock();
        // SAFETY: ptr came from `alloc` above, so a header precedes it.
        let real = unsafe {
            let hdr = Heap::header_of(ptr);
            if (*hdr).magic == MAGIC_SHIFTED {
                ptr.sub((*hdr).size)
            } else {
                ptr
            }
        };
        if let Err(e) = heap.free(real) {
            panic!("dealloc: {:?}", e);
        }
    }
}
