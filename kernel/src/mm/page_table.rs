//! Page tables and the four-level walker.
//!
//! This is the narrow unsafe surface for paging: entries are
//! `#[repr(transparent)]` u64 wrappers with safe accessors, and the walker
//! only touches table memory through a [`PhysMapper`], which is how
//! page-table pages stay reachable (identity window below 4 GiB, fixed
//! physical-to-virtual offset above it — or plain heap memory under the
//! host test harness).

use crate::error::{MemError, VmError};

use super::{PageEntryFlags, PhysicalAddress, VirtualAddress, FRAME_SIZE};

/// Entries per table at every level.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Mask selecting the physical address bits of an entry.
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// A single page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_present(&self) -> bool {
        self.0 & PageEntryFlags::PRESENT.bits() != 0
    }

    /// Terminal 2 MiB mapping (meaningful at the PD level).
    pub const fn is_large(&self) -> bool {
        self.0 & PageEntryFlags::LARGE.bits() != 0
    }

    pub fn addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & ENTRY_ADDR_MASK)
    }

    pub fn flags(&self) -> PageEntryFlags {
        PageEntryFlags::from_bits_truncate(self.0)
    }

    /// Point this entry at `addr` with `flags`. The address must be
    /// 4 KiB aligned; PRESENT is implied for every non-zero entry.
    pub fn set(&mut self, addr: PhysicalAddress, flags: PageEntryFlags) {
        debug_assert!(addr.is_frame_aligned());
        self.0 = (addr.as_u64() & ENTRY_ADDR_MASK)
            | flags.bits()
            | PageEntryFlags::PRESENT.bits();
    }

    pub fn set_flags(&mut self, flags: PageEntryFlags) {
        self.0 = (self.0 & ENTRY_ADDR_MASK) | flags.bits() | PageEntryFlags::PRESENT.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A 512-entry table at any of the four levels.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); PAGE_TABLE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        for e in self.entries.iter_mut() {
            e.clear();
        }
    }

    pub fn entry(&self, idx: usize) -> &PageTableEntry {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut PageTableEntry {
        &mut self.entries[idx]
    }

    /// True if no entry is in use, meaning the table could be reclaimed.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_unused())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Indices of a canonical virtual address at each level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableIndices {
    pub pml4: usize,
    pub pdp: usize,
    pub pd: usize,
    pub pt: usize,
}

impl TableIndices {
    pub fn of(addr: VirtualAddress) -> Self {
        let a = addr.as_u64();
        Self {
            pml4: ((a >> 39) & 0x1FF) as usize,
            pdp: ((a >> 30) & 0x1FF) as usize,
            pd: ((a >> 21) & 0x1FF) as usize,
            pt: ((a >> 12) & 0x1FF) as usize,
        }
    }
}

/// Access to page-table memory by physical address.
pub trait PhysMapper {
    /// Translate the physical address of a table page into a pointer the
    /// kernel can dereference.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;
}

/// Supplier of zeroed frames for intermediate tables.
pub trait FrameSource {
    fn alloc_frame(&mut self) -> Result<PhysicalAddress, MemError>;
    fn free_frame(&mut self, pa: PhysicalAddress);
}

/// Result of resolving a virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub phys: PhysicalAddress,
    pub flags: PageEntryFlags,
    pub huge: bool,
}

/// Four-level walker over one PML4 root.
///
/// The walker is purely mechanical; address-range policy (canonical,
/// window membership, alignment) belongs to the VMM on top of it.
pub struct Mapper<'a, M: PhysMapper> {
    root: PhysicalAddress,
    phys: &'a M,
}

impl<'a, M: PhysMapper> Mapper<'a, M> {
    /// # Safety
    ///
    /// `root` must be the physical address of a live PML4 whose table
    /// pages are all reachable through `phys`, and the caller must
    /// serialize all mutation of that hierarchy (the VMM lock does).
    pub unsafe fn new(root: PhysicalAddress, phys: &'a M) -> Self {
        Self { root, phys }
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    fn table_ptr(&self, pa: PhysicalAddress) -> *mut PageTable {
        self.phys.phys_to_ptr(pa) as *mut PageTable
    }

    fn table_mut(&self, pa: PhysicalAddress) -> &mut PageTable {
        // SAFETY: `pa` came from the root or a PRESENT entry of this
        // hierarchy, which per the constructor contract is reachable
        // through `phys` and exclusively ours while the VMM lock is held.
        unsafe { &mut *self.table_ptr(pa) }
    }

    /// Descend to the entry at `level` (4 = PML4 .. 1 = PT), creating
    /// intermediate tables when `source` is provided. Returns a raw entry
    /// pointer; the hierarchy stays exclusively ours for its lifetime.
    fn descend(
        &self,
        addr: VirtualAddress,
        target_level: u8,
        mut source: Option<&mut dyn FrameSource>,
    ) -> Result<*mut PageTableEntry, VmError> {
        let idx = TableIndices::of(addr);
        let level_idx = |level: u8| match level {
            4 => idx.pml4,
            3 => idx.pdp,
            2 => idx.pd,
            _ => idx.pt,
        };

        let mut table = self.table_ptr(self.root);
        let mut level = 4u8;
        loop {
            // SAFETY: `table` is the root or a PRESENT entry target; see
            // `table_mut`.
            let entry = unsafe { (*table).entry_mut(level_idx(level)) as *mut PageTableEntry };
            if level == target_level {
                return Ok(entry);
            }
            // SAFETY: same provenance as above; no other alias is live.
            let entry = unsafe { &mut *entry };
            if entry.is_present() && entry.is_large() {
                // A huge mapping terminates the walk above the target.
                return Err(VmError::AlreadyMapped);
            }
            if !entry.is_present() {
                let src = source.as_deref_mut().ok_or(VmError::NotMapped)?;
                let frame = src.alloc_frame().map_err(|_| VmError::NoMem)?;
                self.table_mut(frame).zero();
                entry.set(
                    frame,
                    PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE | PageEntryFlags::USER,
                );
            }
            table = self.table_ptr(entry.addr());
            level -= 1;
        }
    }

    /// Install a 4 KiB mapping.
    pub fn map(
        &self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageEntryFlags,
        source: &mut dyn FrameSource,
    ) -> Result<(), VmError> {
        // SAFETY: entry pointer provenance per `descend`.
        let entry = unsafe { &mut *self.descend(vaddr, 1, Some(source))? };
        if entry.is_present() {
            return Err(VmError::AlreadyMapped);
        }
        entry.set(paddr, flags);
        Ok(())
    }

    /// Install a terminal 2 MiB mapping at the PD level.
    pub fn map_huge(
        &self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageEntryFlags,
        source: &mut dyn FrameSource,
    ) -> Result<(), VmError> {
        // SAFETY: entry pointer provenance per `descend`.
        let entry = unsafe { &mut *self.descend(vaddr, 2, Some(source))? };
        if entry.is_present() {
            return Err(VmError::AlreadyMapped);
        }
        entry.set(paddr, flags | PageEntryFlags::LARGE);
        Ok(())
    }

    /// Remove the mapping covering `vaddr`; returns what it pointed at.
    pub fn unmap(&self, vaddr: VirtualAddress) -> Result<Resolved, VmError> {
        // Walk by hand so a huge PD entry can terminate early.
        let idx = TableIndices::of(vaddr);
        let pml4 = self.table_mut(self.root);
        let e4 = pml4.entry_mut(idx.pml4);
        if !e4.is_present() {
            return Err(VmError::NotMapped);
        }
        let pdp = self.table_mut(e4.addr());
        let e3 = pdp.entry_mut(idx.pdp);
        if !e3.is_present() {
            return Err(VmError::NotMapped);
        }
        let pd = self.table_mut(e3.addr());
        let e2 = pd.entry_mut(idx.pd);
        if !e2.is_present() {
            return Err(VmError::NotMapped);
        }
        if e2.is_large() {
            let out = Resolved {
                phys: e2.addr(),
                flags: e2.flags(),
                huge: true,
            };
            e2.clear();
            return Ok(out);
        }
        let pt = self.table_mut(e2.addr());
        let e1 = pt.entry_mut(idx.pt);
        if !e1.is_present() {
            return Err(VmError::NotMapped);
        }
        let out = Resolved {
            phys: e1.addr(),
            flags: e1.flags(),
            huge: false,
        };
        e1.clear();
        Ok(out)
    }

    /// Resolve `vaddr` through the tables, large-page aware.
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<Resolved> {
        let idx = TableIndices::of(vaddr);
        let pml4 = self.table_mut(self.root);
        let e4 = pml4.entry(idx.pml4);
        if !e4.is_present() {
            return None;
        }
        let pdp = self.table_mut(e4.addr());
        let e3 = pdp.entry(idx.pdp);
        if !e3.is_present() {
            return None;
        }
        let pd = self.table_mut(e3.addr());
        let e2 = pd.entry(idx.pd);
        if !e2.is_present() {
            return None;
        }
        if e2.is_large() {
            let offset = vaddr.as_u64() & 0x1F_FFFF;
            return Some(Resolved {
                phys: PhysicalAddress::new(e2.addr().as_u64() + offset),
                flags: e2.flags(),
                huge: true,
            });
        }
        let pt = self.table_mut(e2.addr());
        let e1 = pt.entry(idx.pt);
        if !e1.is_present() {
            return None;
        }
        let offset = vaddr.as_u64() & (FRAME_SIZE as u64 - 1);
        Some(Resolved {
            phys: PhysicalAddress::new(e1.addr().as_u64() + offset),
            flags: e1.flags(),
            huge: false,
        })
    }

    /// Rewrite the flags of an existing 4 KiB mapping.
    pub fn set_flags(
        &self,
        vaddr: VirtualAddress,
        flags: PageEntryFlags,
    ) -> Result<(), VmError> {
        // SAFETY: entry pointer provenance per `descend`.
        let entry = unsafe { &mut *self.descend(vaddr, 1, None)? };
        if !entry.is_present() {
            return Err(VmError::NotMapped);
        }
        entry.set_flags(flags);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory page-table backing so the walker runs under the host
    //! test harness against real table layouts.

    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    use super::*;

    /// Frames are leaked `Box<PageTable>`s; their heap address doubles as
    /// the fake physical address, so `phys_to_ptr` is the identity.
    pub struct TestBacking {
        tables: RefCell<Vec<*mut PageTable>>,
    }

    impl TestBacking {
        pub fn new() -> Self {
            Self {
                tables: RefCell::new(Vec::new()),
            }
        }

        pub fn new_table(&self) -> PhysicalAddress {
            let table = Box::into_raw(Box::new(PageTable::new()));
            self.tables.borrow_mut().push(table);
            PhysicalAddress::new(table as u64)
        }

        pub fn table_count(&self) -> usize {
            self.tables.borrow().len()
        }
    }

    impl Drop for TestBacking {
        fn drop(&mut self) {
            for t in self.tables.borrow_mut().drain(..) {
                // SAFETY: every pointer was produced by Box::into_raw above
                // and is dropped exactly once here.
                drop(unsafe { Box::from_raw(t) });
            }
        }
    }

    impl PhysMapper for TestBacking {
        fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
            pa.as_u64() as *mut u8
        }
    }

    pub struct TestFrames<'a> {
        backing: &'a TestBacking,
    }

    impl<'a> TestFrames<'a> {
        pub fn new(backing: &'a TestBacking) -> Self {
            Self { backing }
        }
    }

    impl FrameSource for TestFrames<'_> {
        fn alloc_frame(&mut self) -> Result<PhysicalAddress, MemError> {
            Ok(self.backing.new_table())
        }

        fn free_frame(&mut self, _pa: PhysicalAddress) {}
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{TestBacking, TestFrames};
    use super::*;

    fn setup(backing: &TestBacking) -> Mapper<'_, TestBacking> {
        let root = backing.new_table();
        // SAFETY: freshly created root, tables reachable via identity.
        unsafe { Mapper::new(root, backing) }
    }

    #[test]
    fn test_map_translate_round_trip() {
        let backing = TestBacking::new();
        let mapper = setup(&backing);
        let mut frames = TestFrames::new(&backing);

        let va = VirtualAddress::new(0xFFFF_8000_0004_2000);
        let pa = PhysicalAddress::new(0x1234_5000);
        mapper
            .map(va, pa, PageEntryFlags::kernel_rw(), &mut frames)
            .unwrap();

        let r = mapper.translate(va).unwrap();
        assert_eq!(r.phys, pa);
        assert!(!r.huge);
        assert!(r.flags.contains(PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE));

        // Offsets inside the page resolve too.
        let r = mapper.translate(va.offset(0x123)).unwrap();
        assert_eq!(r.phys.as_u64(), pa.as_u64() + 0x123);
    }

    #[test]
    fn test_map_creates_three_tables() {
        let backing = TestBacking::new();
        let mapper = setup(&backing);
        let mut frames = TestFrames::new(&backing);
        assert_eq!(backing.table_count(), 1); // just the root

        mapper
            .map(
                VirtualAddress::new(0xFFFF_8000_0000_0000),
                PhysicalAddress::new(0x1000),
                PageEntryFlags::kernel_rw(),
                &mut frames,
            )
            .unwrap();
        // PDP, PD, PT were created lazily.
        assert_eq!(backing.table_count(), 4);

        // A second page in the same PT creates nothing new.
        mapper
            .map(
                VirtualAddress::new(0xFFFF_8000_0000_1000),
                PhysicalAddress::new(0x2000),
                PageEntryFlags::kernel_rw(),
                &mut frames,
            )
            .unwrap();
        assert_eq!(backing.table_count(), 4);
    }

    #[test]
    fn test_double_map_rejected() {
        let backing = TestBacking::new();
        let mapper = setup(&backing);
        let mut frames = TestFrames::new(&backing);

        let va = VirtualAddress::new(0xFFFF_8000_0000_0000);
        mapper
            .map(va, PhysicalAddress::new(0x1000), PageEntryFlags::kernel_rw(), &mut frames)
            .unwrap();
        assert_eq!(
            mapper.map(va, PhysicalAddress::new(0x2000), PageEntryFlags::kernel_rw(), &mut frames),
            Err(VmError::AlreadyMapped)
        );
    }

    #[test]
    fn test_unmap() {
        let backing = TestBacking::new();
        let mapper = setup(&backing);
        let mut frames = TestFrames::new(&backing);

        let va = VirtualAddress::new(0xFFFF_8000_0000_3000);
        let pa = PhysicalAddress::new(0x9000);
        mapper
            .map(va, pa, PageEntryFlags::kernel_rw(), &mut frames)
            .unwrap();
        let r = mapper.unmap(va).unwrap();
        assert_eq!(r.phys, pa);
        assert!(mapper.translate(va).is_none());
        assert_eq!(mapper.unmap(va), Err(VmError::NotMapped));
    }

    #[test]
    fn test_huge_mapping() {
        let backing = TestBacking::new();
        let mapper = setup(&backing);
        let mut frames = TestFrames::new(&backing);

        let va = VirtualAddress::new(0xFFFF_8000_0020_0000);
        let pa = PhysicalAddress::new(0x0040_0000);
        mapper
            .map_huge(va, pa, PageEntryFlags::kernel_rw(), &mut frames)
            .unwrap();

        let r = mapper.translate(va.offset(0x1_2345)).unwrap();
        assert!(r.huge);
        assert_eq!(r.phys.as_u64(), pa.as_u64() + 0x1_2345);

        // A 4 KiB map under the huge mapping is refused.
        assert_eq!(
            mapper.map(va, PhysicalAddress::new(0x1000), PageEntryFlags::kernel_rw(), &mut frames),
            Err(VmError::AlreadyMapped)
        );
    }

    #[test]
    fn test_set_flags() {
        let backing = TestBacking::new();
        let mapper = setup(&backing);
        let mut frames = TestFrames::new(&backing);

        let va = VirtualAddress::new(0xFFFF_8000_0000_5000);
        mapper
            .map(va, PhysicalAddress::new(0x5000), PageEntryFlags::kernel_rw(), &mut frames)
            .unwrap();
        mapper.set_flags(va, PageEntryFlags::kernel_ro()).unwrap();
        let r = mapper.translate(va).unwrap();
        assert!(!r.flags.contains(PageEntryFlags::WRITABLE));
    }

    #[test]
    fn test_translate_unmapped() {
        let backing = TestBacking::new();
        let mapper = setup(&backing);
        assert!(mapper.translate(VirtualAddress::new(0x4000)).is_none());
    }
}
