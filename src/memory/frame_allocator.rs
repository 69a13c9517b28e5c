use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use x86_64::{
    structures::paging::{FrameAllocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use super::PAGE_SIZE;

/// Pattern written over freed frames so stale users read garbage.
const JUNK: u8 = 0x01;

type FrameData = Box<[u8; PAGE_SIZE]>;

struct FreeList {
    free: Vec<usize>,
    in_use: Vec<bool>,
}

/// Allocation counters, for leak accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub allocated: usize,
    pub freed: usize,
    pub free: usize,
    pub total: usize,
}

impl FrameStats {
    pub fn outstanding(&self) -> usize {
        self.allocated - self.freed
    }
}

/// Physical page frames backing user memory, kernel stacks and page-table
/// pages. Frame `i` lives at `base + i * PAGE_SIZE`.
///
/// Safe to share between CPUs: the free list and every frame have their own
/// lock, and the free-list lock is always taken before a frame lock.
pub struct FramePool {
    base: PhysAddr,
    frames: Vec<Mutex<FrameData>>,
    list: Mutex<FreeList>,
    allocated: AtomicUsize,
    freed: AtomicUsize,
}

impl FramePool {
    pub fn new(base: PhysAddr, count: usize) -> Self {
        assert!(
            base.is_aligned(PAGE_SIZE as u64),
            "frame pool base {:#x} is not page aligned",
            base.as_u64()
        );
        let frames = (0..count)
            .map(|_| Mutex::new(Box::new([JUNK; PAGE_SIZE])))
            .collect();
        // Popped from the back, so low frames go out first.
        let free = (0..count).rev().collect();
        FramePool {
            base,
            frames,
            list: Mutex::new(FreeList {
                free,
                in_use: alloc::vec![false; count],
            }),
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// First physical address past the managed range.
    pub fn end(&self) -> PhysAddr {
        self.base + (self.frames.len() * PAGE_SIZE) as u64
    }

    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Takes one frame off the free list. Contents are unspecified.
    pub fn allocate_frame(&self) -> Option<PhysFrame> {
        let index = {
            let mut list = self.list.lock();
            let index = list.free.pop()?;
            list.in_use[index] = true;
            index
        };
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(self.frame_at(index))
    }

    /// Returns a frame to the pool.
    pub fn deallocate_frame(&self, frame: PhysFrame) {
        let index = self.index_of(frame.start_address());
        let mut list = self.list.lock();
        if !list.in_use[index] {
            panic!(
                "deallocate_frame: {:#x} is not allocated",
                frame.start_address().as_u64()
            );
        }
        self.frames[index].lock().fill(JUNK);
        list.in_use[index] = false;
        list.free.push(index);
        drop(list);
        self.freed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> FrameStats {
        let free = self.list.lock().free.len();
        FrameStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            free,
            total: self.frames.len(),
        }
    }

    /// Runs `f` with exclusive access to the bytes of `frame`.
    pub fn with_frame<R>(&self, frame: PhysFrame, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        let index = self.index_of(frame.start_address());
        let mut data = self.frames[index].lock();
        f(&mut **data)
    }

    pub fn zero(&self, frame: PhysFrame) {
        self.with_frame(frame, |bytes| bytes.fill(0));
    }

    pub fn copy_frame(&self, src: PhysFrame, dst: PhysFrame) {
        let mut buf = [0u8; PAGE_SIZE];
        self.with_frame(src, |bytes| buf.copy_from_slice(&bytes[..]));
        self.with_frame(dst, |bytes| bytes.copy_from_slice(&buf));
    }

    /// Copies `src` into memory starting at physical address `addr`; the run
    /// must not cross a frame boundary.
    pub fn write(&self, addr: PhysAddr, src: &[u8]) {
        let (frame, offset) = self.split(addr, src.len());
        self.with_frame(frame, |bytes| bytes[offset..offset + src.len()].copy_from_slice(src));
    }

    pub fn read(&self, addr: PhysAddr, dst: &mut [u8]) {
        let (frame, offset) = self.split(addr, dst.len());
        self.with_frame(frame, |bytes| dst.copy_from_slice(&bytes[offset..offset + dst.len()]));
    }

    pub(crate) fn read_entry(&self, table: PhysFrame, index: usize) -> u32 {
        self.with_frame(table, |bytes| {
            let at = index * 4;
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        })
    }

    pub(crate) fn write_entry(&self, table: PhysFrame, index: usize, value: u32) {
        self.with_frame(table, |bytes| {
            let at = index * 4;
            bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
        });
    }

    fn split(&self, addr: PhysAddr, len: usize) -> (PhysFrame, usize) {
        let frame = PhysFrame::containing_address(addr);
        let offset = (addr - frame.start_address()) as usize;
        assert!(offset + len <= PAGE_SIZE, "physical access crosses a frame boundary");
        (frame, offset)
    }

    fn frame_at(&self, index: usize) -> PhysFrame {
        PhysFrame::containing_address(self.base + (index * PAGE_SIZE) as u64)
    }

    fn index_of(&self, addr: PhysAddr) -> usize {
        if !self.contains(addr) || !addr.is_aligned(PAGE_SIZE as u64) {
            panic!("{:#x} is not a frame of this pool", addr.as_u64());
        }
        ((addr - self.base) as usize) / PAGE_SIZE
    }
}

unsafe impl FrameAllocator<Size4KiB> for &FramePool {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        FramePool::allocate_frame(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(count: usize) -> FramePool {
        FramePool::new(PhysAddr::new(0x20_0000), count)
    }

    #[test]
    fn hands_out_low_frames_first() {
        let pool = pool(4);
        let a = pool.allocate_frame().unwrap();
        let b = pool.allocate_frame().unwrap();
        assert_eq!(a.start_address().as_u64(), 0x20_0000);
        assert_eq!(b.start_address().as_u64(), 0x20_1000);
    }

    #[test]
    fn exhaustion_returns_none_and_free_restores() {
        let pool = pool(2);
        let a = pool.allocate_frame().unwrap();
        let _b = pool.allocate_frame().unwrap();
        assert!(pool.allocate_frame().is_none());
        pool.deallocate_frame(a);
        assert_eq!(pool.allocate_frame(), Some(a));
        let stats = pool.stats();
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.outstanding(), 2);
        assert_eq!(stats.free, 0);
    }

    #[test]
    fn freed_frames_are_filled_with_junk() {
        let pool = pool(1);
        let frame = pool.allocate_frame().unwrap();
        pool.zero(frame);
        pool.write(frame.start_address() + 8u64, b"abc");
        pool.deallocate_frame(frame);
        let frame = pool.allocate_frame().unwrap();
        let mut buf = [0u8; 3];
        pool.read(frame.start_address() + 8u64, &mut buf);
        assert_eq!(buf, [JUNK; 3]);
    }

    #[test]
    fn entries_are_little_endian_words() {
        let pool = pool(1);
        let table = pool.allocate_frame().unwrap();
        pool.zero(table);
        pool.write_entry(table, 3, 0xdead_b007);
        assert_eq!(pool.read_entry(table, 3), 0xdead_b007);
        let mut raw = [0u8; 4];
        pool.read(table.start_address() + 12u64, &mut raw);
        assert_eq!(raw, [0x07, 0xb0, 0xad, 0xde]);
    }

    #[test]
    fn usable_through_the_frame_allocator_trait() {
        let pool = pool(1);
        let mut alloc = &pool;
        assert!(FrameAllocator::<Size4KiB>::allocate_frame(&mut alloc).is_some());
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    #[should_panic(expected = "is not allocated")]
    fn double_free_is_fatal() {
        let pool = pool(1);
        let frame = pool.allocate_frame().unwrap();
        pool.deallocate_frame(frame);
        pool.deallocate_frame(frame);
    }

    #[test]
    #[should_panic(expected = "not a frame of this pool")]
    fn foreign_frames_are_rejected() {
        let pool = pool(1);
        pool.deallocate_frame(PhysFrame::containing_address(PhysAddr::new(0x1000)));
    }
}
