use alloc::vec::Vec;
use bit_field::BitField;
use bitflags::bitflags;
use core::fmt;
use x86_64::{structures::paging::PhysFrame, PhysAddr, VirtAddr};

use super::{page_round_down, phys, virt, FramePool, EXTMEM, KERNBASE, KERNLINK, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::param::KernelConfig;

pub const NPDENTRIES: usize = 1024;
pub const NPTENTRIES: usize = 1024;

bitflags! {
    /// Permission bits shared by directory and table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

/// One 32-bit directory or table entry: frame address in the top 20 bits,
/// flags in the low 12.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const EMPTY: PageTableEntry = PageTableEntry(0);

    pub fn new(addr: PhysAddr, flags: PteFlags) -> Self {
        assert!(addr.is_aligned(PAGE_SIZE as u64), "entry address must be page aligned");
        PageTableEntry(addr.as_u64() as u32 | flags.bits())
    }

    pub fn from_raw(raw: u32) -> Self {
        PageTableEntry(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0.get_bits(0..12))
    }

    pub fn addr(self) -> PhysAddr {
        PhysAddr::new((self.0.get_bits(12..32) as u64) << 12)
    }

    pub fn frame(self) -> PhysFrame {
        PhysFrame::containing_address(self.addr())
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PTE({:#010x}, {:?})", self.addr().as_u64(), self.flags())
    }
}

/// Page directory index.
pub fn pdx(va: VirtAddr) -> usize {
    va.as_u64().get_bits(22..32) as usize
}

/// Page table index.
pub fn ptx(va: VirtAddr) -> usize {
    va.as_u64().get_bits(12..22) as usize
}

/// First address covered by directory entry `dir`.
pub fn table_base(dir: usize) -> usize {
    dir << 22
}

/// Location of a leaf entry inside a page-table page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PteSlot {
    table: PhysFrame,
    index: usize,
}

impl PteSlot {
    pub fn read(self, pool: &FramePool) -> PageTableEntry {
        PageTableEntry(pool.read_entry(self.table, self.index))
    }

    pub fn write(self, pool: &FramePool, entry: PageTableEntry) {
        pool.write_entry(self.table, self.index, entry.0);
    }
}

pub(crate) fn directory_entry(pool: &FramePool, root: PhysFrame, dir: usize) -> PageTableEntry {
    PageTableEntry(pool.read_entry(root, dir))
}

pub(crate) fn set_directory_entry(pool: &FramePool, root: PhysFrame, dir: usize, entry: PageTableEntry) {
    pool.write_entry(root, dir, entry.0);
}

/// Finds the leaf slot for `va` without creating anything. `None` when the
/// covering page table does not exist.
pub(crate) fn lookup(pool: &FramePool, root: PhysFrame, va: VirtAddr) -> Option<PteSlot> {
    let pde = directory_entry(pool, root, pdx(va));
    if !pde.is_present() {
        return None;
    }
    Some(PteSlot {
        table: pde.frame(),
        index: ptx(va),
    })
}

/// Like `lookup`, but allocates and installs a zeroed page table on demand.
pub(crate) fn walk_alloc(pool: &FramePool, root: PhysFrame, va: VirtAddr) -> KernelResult<PteSlot> {
    if let Some(slot) = lookup(pool, root, va) {
        return Ok(slot);
    }
    let table = pool.allocate_frame().ok_or(KernelError::OutOfMemory)?;
    pool.zero(table);
    // Leaf entries restrict access further.
    let flags = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER;
    set_directory_entry(pool, root, pdx(va), PageTableEntry::new(table.start_address(), flags));
    Ok(PteSlot {
        table,
        index: ptx(va),
    })
}

/// Installs leaf entries for `[va, va + size)` pointing at consecutive
/// frames from `pa`. Panics if any page in the range is already mapped.
pub(crate) fn map_pages(
    pool: &FramePool,
    root: PhysFrame,
    va: VirtAddr,
    size: usize,
    pa: PhysAddr,
    perm: PteFlags,
) -> KernelResult<()> {
    if size == 0 {
        return Ok(());
    }
    let start = va.as_u64() as usize;
    let mut a = page_round_down(start);
    let last = page_round_down(start + size - 1);
    let mut pa = pa.align_down(PAGE_SIZE as u64);
    loop {
        let slot = walk_alloc(pool, root, virt(a))?;
        let old = slot.read(pool);
        if old.is_present() {
            panic!("remap: {:#x} already mapped to {:#x}", a, old.addr().as_u64());
        }
        slot.write(pool, PageTableEntry::new(pa, perm | PteFlags::PRESENT));
        if a == last {
            return Ok(());
        }
        a += PAGE_SIZE;
        pa += PAGE_SIZE as u64;
    }
}

/// One fixed region of the kernel half, installed into every address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelMapping {
    pub virt: usize,
    pub phys_start: usize,
    pub phys_end: usize,
    pub perm: PteFlags,
}

impl KernelMapping {
    pub fn size(&self) -> usize {
        self.phys_end - self.phys_start
    }

    /// I/O space, read-only kernel text, then kernel data and all managed
    /// memory up to the top of the frame pool.
    pub fn layout(config: &KernelConfig) -> Vec<KernelMapping> {
        let text_end = EXTMEM + config.kernel_text;
        let mut map = Vec::new();
        map.push(KernelMapping {
            virt: KERNBASE,
            phys_start: 0,
            phys_end: EXTMEM,
            perm: PteFlags::WRITABLE,
        });
        if config.kernel_text > 0 {
            map.push(KernelMapping {
                virt: KERNLINK,
                phys_start: EXTMEM,
                phys_end: text_end,
                perm: PteFlags::empty(),
            });
        }
        map.push(KernelMapping {
            virt: KERNBASE + text_end,
            phys_start: text_end,
            phys_end: config.phys_top(),
            perm: PteFlags::WRITABLE,
        });
        map
    }

    pub(crate) fn start(&self) -> (VirtAddr, PhysAddr) {
        (virt(self.virt), phys(self.phys_start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> FramePool {
        FramePool::new(PhysAddr::new(0x20_0000), 8)
    }

    fn fresh_root(pool: &FramePool) -> PhysFrame {
        let root = pool.allocate_frame().unwrap();
        pool.zero(root);
        root
    }

    #[test]
    fn indices_split_the_address() {
        let va = VirtAddr::new(0x8040_3123);
        assert_eq!(pdx(va), 0x201);
        assert_eq!(ptx(va), 0x003);
        assert_eq!(table_base(0x201), 0x8040_0000);
    }

    #[test]
    fn entry_keeps_address_and_flags_apart() {
        let e = PageTableEntry::new(PhysAddr::new(0x0034_5000), PteFlags::PRESENT | PteFlags::USER);
        assert_eq!(e.raw(), 0x0034_5005);
        assert_eq!(e.addr().as_u64(), 0x0034_5000);
        assert!(e.is_present());
        assert!(!e.flags().contains(PteFlags::WRITABLE));
        assert!(!PageTableEntry::EMPTY.is_present());
    }

    #[test]
    fn map_allocates_one_table_per_directory_entry() {
        let pool = pool();
        let root = fresh_root(&pool);
        let before = pool.stats().allocated;
        map_pages(&pool, root, VirtAddr::new(0x1000), 2 * PAGE_SIZE, PhysAddr::new(0x5000), PteFlags::USER)
            .unwrap();
        assert_eq!(pool.stats().allocated, before + 1);

        let slot = lookup(&pool, root, VirtAddr::new(0x2000)).unwrap();
        let e = slot.read(&pool);
        assert_eq!(e.addr().as_u64(), 0x6000);
        assert_eq!(e.flags(), PteFlags::PRESENT | PteFlags::USER);
        assert!(lookup(&pool, root, VirtAddr::new(0x40_0000)).is_none());
    }

    #[test]
    fn unaligned_ranges_cover_every_touched_page() {
        let pool = pool();
        let root = fresh_root(&pool);
        map_pages(&pool, root, VirtAddr::new(0x1ff0), 0x20, PhysAddr::new(0x9000), PteFlags::WRITABLE).unwrap();
        assert!(lookup(&pool, root, VirtAddr::new(0x1000)).unwrap().read(&pool).is_present());
        assert!(lookup(&pool, root, VirtAddr::new(0x2000)).unwrap().read(&pool).is_present());
        assert!(!lookup(&pool, root, VirtAddr::new(0x3000)).unwrap().read(&pool).is_present());
    }

    #[test]
    fn table_allocation_failure_is_reported() {
        let pool = FramePool::new(PhysAddr::new(0x20_0000), 1);
        let root = fresh_root(&pool);
        let err = map_pages(&pool, root, VirtAddr::new(0), PAGE_SIZE, PhysAddr::new(0), PteFlags::USER);
        assert_eq!(err, Err(KernelError::OutOfMemory));
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn mapping_twice_is_fatal() {
        let pool = pool();
        let root = fresh_root(&pool);
        map_pages(&pool, root, VirtAddr::new(0x1000), PAGE_SIZE, PhysAddr::new(0x5000), PteFlags::USER).unwrap();
        let _ = map_pages(&pool, root, VirtAddr::new(0x1000), PAGE_SIZE, PhysAddr::new(0x7000), PteFlags::USER);
    }

    #[test]
    fn layout_covers_io_text_and_memory() {
        let config = KernelConfig::default();
        let map = KernelMapping::layout(&config);
        assert_eq!(map.len(), 3);
        assert_eq!(map[0].virt, KERNBASE);
        assert_eq!(map[1].virt, KERNLINK);
        assert!(!map[1].perm.contains(PteFlags::WRITABLE));
        assert_eq!(map[2].phys_end, config.phys_top());
        assert_eq!(map[1].phys_end, map[2].phys_start);
    }
}
