use alloc::string::String;
use alloc::vec::Vec;
use x86_64::{structures::paging::PhysFrame, PhysAddr, VirtAddr};

use super::paging::{self, KernelMapping, PageTableEntry, PteFlags, NPDENTRIES};
use super::{page_round_up, virt, FramePool, KERNBASE, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Who is asking for a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Kernel,
    User,
}

/// One process's page directory and everything hanging off it.
///
/// Not `Clone`: page-table mutation goes through `&mut self`, so the owner
/// (a running process, or whoever is building one that is not yet
/// published) is the only writer. Frames come from the pool passed to each
/// call and must all be returned through [`AddressSpace::destroy`].
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysFrame,
}

impl AddressSpace {
    /// Allocates an empty directory and installs the kernel mappings.
    pub fn create(pool: &FramePool, kmap: &[KernelMapping]) -> KernelResult<Self> {
        let root = pool.allocate_frame().ok_or(KernelError::OutOfMemory)?;
        pool.zero(root);
        let mut space = AddressSpace { root };
        for k in kmap {
            let (va, pa) = k.start();
            if let Err(e) = space.map(pool, va, k.size(), pa, k.perm) {
                space.destroy(pool);
                return Err(e);
            }
        }
        Ok(space)
    }

    /// Physical address of the directory, as loaded into the MMU.
    pub fn root(&self) -> PhysFrame {
        self.root
    }

    pub fn map(
        &mut self,
        pool: &FramePool,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        perm: PteFlags,
    ) -> KernelResult<()> {
        paging::map_pages(pool, self.root, va, size, pa, perm)
    }

    /// Clears leaf entries in `[va, va + size)` without freeing the frames
    /// they point to. Returns how many entries were cleared.
    pub fn unmap(&mut self, pool: &FramePool, va: VirtAddr, size: usize) -> usize {
        let start = va.as_u64() as usize;
        let end = start + size;
        let mut cleared = 0;
        let mut a = super::page_round_down(start);
        while a < end {
            if let Some(slot) = paging::lookup(pool, self.root, virt(a)) {
                if slot.read(pool).is_present() {
                    slot.write(pool, PageTableEntry::EMPTY);
                    cleared += 1;
                }
            }
            a += PAGE_SIZE;
        }
        cleared
    }

    /// Loads the first user image at address 0. The image must fit in one page.
    pub fn load_image(&mut self, pool: &FramePool, image: &[u8]) -> KernelResult<()> {
        if image.len() >= PAGE_SIZE {
            panic!("load_image: {} bytes is more than a page", image.len());
        }
        let frame = pool.allocate_frame().ok_or(KernelError::OutOfMemory)?;
        pool.zero(frame);
        if let Err(e) = self.map(
            pool,
            VirtAddr::new(0),
            PAGE_SIZE,
            frame.start_address(),
            PteFlags::WRITABLE | PteFlags::USER,
        ) {
            pool.deallocate_frame(frame);
            return Err(e);
        }
        pool.write(frame.start_address(), image);
        Ok(())
    }

    /// Grows user memory from `old_top` to `new_top` with zeroed, writable,
    /// user pages. On failure nothing allocated by this call survives.
    pub fn grow(&mut self, pool: &FramePool, old_top: usize, new_top: usize) -> KernelResult<usize> {
        if new_top <= old_top {
            return Err(KernelError::InvalidArgument);
        }
        if new_top > KERNBASE {
            return Err(KernelError::OutOfRange);
        }
        let start = page_round_up(old_top);
        if start >= new_top {
            return Ok(new_top);
        }

        let absent: Vec<usize> = (paging::pdx(virt(start))..=paging::pdx(virt(new_top - 1)))
            .filter(|&dir| !paging::directory_entry(pool, self.root, dir).is_present())
            .collect();

        let mut a = start;
        while a < new_top {
            let Some(frame) = pool.allocate_frame() else {
                crate::log_warn!("grow: out of memory at {:#x}", a);
                self.undo_growth(pool, start, a, &absent);
                return Err(KernelError::OutOfMemory);
            };
            pool.zero(frame);
            let perm = PteFlags::WRITABLE | PteFlags::USER;
            if let Err(e) = self.map(pool, virt(a), PAGE_SIZE, frame.start_address(), perm) {
                crate::log_warn!("grow: no page table for {:#x}", a);
                pool.deallocate_frame(frame);
                self.undo_growth(pool, start, a, &absent);
                return Err(e);
            }
            a += PAGE_SIZE;
        }
        Ok(new_top)
    }

    fn undo_growth(&mut self, pool: &FramePool, start: usize, reached: usize, absent: &[usize]) {
        self.shrink(pool, reached, start);
        for &dir in absent {
            let pde = paging::directory_entry(pool, self.root, dir);
            if pde.is_present() {
                pool.deallocate_frame(pde.frame());
                paging::set_directory_entry(pool, self.root, dir, PageTableEntry::EMPTY);
            }
        }
    }

    /// Frees user pages in `[new_top, old_top)`. A no-op returning
    /// `old_top` unless `new_top < old_top`.
    pub fn shrink(&mut self, pool: &FramePool, old_top: usize, new_top: usize) -> usize {
        if new_top >= old_top {
            return old_top;
        }
        let mut a = page_round_up(new_top);
        while a < old_top {
            match paging::lookup(pool, self.root, virt(a)) {
                None => {
                    // No table here; jump to the next directory entry.
                    a = paging::table_base(paging::pdx(virt(a)) + 1);
                    continue;
                }
                Some(slot) => {
                    let e = slot.read(pool);
                    if e.is_present() {
                        pool.deallocate_frame(e.frame());
                        slot.write(pool, PageTableEntry::EMPTY);
                    }
                }
            }
            a += PAGE_SIZE;
        }
        new_top
    }

    /// Builds a full, independent copy of the user pages below `size`, with
    /// the same permissions, on top of fresh kernel mappings.
    pub fn duplicate(&self, pool: &FramePool, kmap: &[KernelMapping], size: usize) -> KernelResult<AddressSpace> {
        let mut copy = AddressSpace::create(pool, kmap)?;
        let mut a = 0;
        while a < size {
            let Some(slot) = paging::lookup(pool, self.root, virt(a)) else {
                a = paging::table_base(paging::pdx(virt(a)) + 1);
                continue;
            };
            let e = slot.read(pool);
            if e.is_present() {
                let Some(frame) = pool.allocate_frame() else {
                    copy.destroy(pool);
                    return Err(KernelError::OutOfMemory);
                };
                pool.copy_frame(e.frame(), frame);
                let perm = e.flags() - PteFlags::PRESENT;
                if let Err(err) = copy.map(pool, virt(a), PAGE_SIZE, frame.start_address(), perm) {
                    pool.deallocate_frame(frame);
                    copy.destroy(pool);
                    return Err(err);
                }
            }
            a += PAGE_SIZE;
        }
        Ok(copy)
    }

    /// Frees every user page, every page-table page and the directory.
    pub fn destroy(mut self, pool: &FramePool) {
        self.shrink(pool, KERNBASE, 0);
        for dir in 0..NPDENTRIES {
            let pde = paging::directory_entry(pool, self.root, dir);
            if pde.is_present() {
                pool.deallocate_frame(pde.frame());
            }
        }
        pool.deallocate_frame(self.root);
    }

    pub fn entry(&self, pool: &FramePool, va: VirtAddr) -> Option<PageTableEntry> {
        paging::lookup(pool, self.root, va)
            .map(|slot| slot.read(pool))
            .filter(|e| e.is_present())
    }

    /// Physical address backing `va`. User access additionally requires the
    /// user bit, even for a page that is mapped.
    pub fn translate(&self, pool: &FramePool, va: VirtAddr, access: Access) -> KernelResult<PhysAddr> {
        let e = self.entry(pool, va).ok_or(KernelError::NotMapped)?;
        if access == Access::User && !e.flags().contains(PteFlags::USER) {
            return Err(KernelError::AccessDenied);
        }
        Ok(e.addr() + (va.as_u64() & (PAGE_SIZE as u64 - 1)))
    }

    /// Drops the user bit on one page; used for stack guard pages.
    pub fn clear_user(&mut self, pool: &FramePool, va: VirtAddr) {
        let slot = paging::lookup(pool, self.root, va)
            .unwrap_or_else(|| panic!("clear_user: no page table for {:#x}", va.as_u64()));
        let e = slot.read(pool);
        slot.write(pool, PageTableEntry::new(e.addr(), e.flags() - PteFlags::USER));
    }

    /// Copies `bytes` into user memory at `va`, one page run at a time.
    /// Works on any address space, not only the active one.
    pub fn copy_into(&self, pool: &FramePool, va: VirtAddr, bytes: &[u8]) -> KernelResult<()> {
        let mut va = va.as_u64() as usize;
        let mut rest = bytes;
        while !rest.is_empty() {
            let pa = self.translate(pool, virt(va), Access::User)?;
            let n = rest.len().min(PAGE_SIZE - va % PAGE_SIZE);
            pool.write(pa, &rest[..n]);
            rest = &rest[n..];
            va += n;
        }
        Ok(())
    }

    /// The reverse of `copy_into`.
    pub fn copy_from(&self, pool: &FramePool, va: VirtAddr, buf: &mut [u8]) -> KernelResult<()> {
        let mut va = va.as_u64() as usize;
        let mut done = 0;
        while done < buf.len() {
            let pa = self.translate(pool, virt(va), Access::User)?;
            let n = (buf.len() - done).min(PAGE_SIZE - va % PAGE_SIZE);
            pool.read(pa, &mut buf[done..done + n]);
            done += n;
            va += n;
        }
        Ok(())
    }
}

/// What a user program sees of its own memory.
pub struct UserMemory<'a> {
    pool: &'a FramePool,
    space: &'a AddressSpace,
    size: usize,
}

impl<'a> UserMemory<'a> {
    pub fn new(pool: &'a FramePool, space: &'a AddressSpace, size: usize) -> Self {
        UserMemory { pool, space, size }
    }

    /// Current program break.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn read(&self, va: usize, buf: &mut [u8]) -> KernelResult<()> {
        self.space.copy_from(self.pool, virt(va), buf)
    }

    /// Stores from user mode also need the writable bit.
    pub fn write(&mut self, va: usize, bytes: &[u8]) -> KernelResult<()> {
        let mut page = super::page_round_down(va);
        while page < va + bytes.len() {
            if let Some(e) = self.space.entry(self.pool, virt(page)) {
                if !e.flags().contains(PteFlags::WRITABLE) {
                    return Err(KernelError::AccessDenied);
                }
            }
            page += PAGE_SIZE;
        }
        self.space.copy_into(self.pool, virt(va), bytes)
    }

    pub fn read_u32(&self, va: usize) -> KernelResult<u32> {
        let mut raw = [0u8; 4];
        self.read(va, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_u32(&mut self, va: usize, value: u32) -> KernelResult<()> {
        self.write(va, &value.to_le_bytes())
    }

    /// Reads a NUL-terminated string of at most `max` bytes.
    pub fn read_str(&self, va: usize, max: usize) -> KernelResult<String> {
        let mut out = Vec::new();
        for i in 0..max {
            let mut b = [0u8; 1];
            self.read(va + i, &mut b)?;
            if b[0] == 0 {
                return String::from_utf8(out).map_err(|_| KernelError::InvalidArgument);
            }
            out.push(b[0]);
        }
        Err(KernelError::InvalidArgument)
    }
}
