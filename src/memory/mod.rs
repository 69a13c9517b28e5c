//! Physical frames, two-level page tables and per-process address spaces.
//!
//! Virtual addresses are 32 bits wide: a 10-bit directory index, a 10-bit
//! table index and a 12-bit page offset. Everything below `KERNBASE` is user
//! space; every address space maps the same kernel range above it.

pub mod address_space;
pub mod frame_allocator;
pub mod paging;

pub use address_space::{Access, AddressSpace, UserMemory};
pub use frame_allocator::{FramePool, FrameStats};
pub use paging::{KernelMapping, PageTableEntry, PteFlags};

use x86_64::{PhysAddr, VirtAddr};

pub const PAGE_SIZE: usize = 4096;

/// First kernel virtual address.
pub const KERNBASE: usize = 0x8000_0000;

/// Start of extended memory; the low megabyte is I/O space.
pub const EXTMEM: usize = 0x10_0000;

/// Where the kernel image is linked.
pub const KERNLINK: usize = KERNBASE + EXTMEM;

/// Memory-mapped devices live here and above.
pub const DEVSPACE: usize = 0xFE00_0000;

pub fn page_round_up(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub fn page_round_down(n: usize) -> usize {
    n & !(PAGE_SIZE - 1)
}

pub(crate) fn virt(addr: usize) -> VirtAddr {
    VirtAddr::new(addr as u64)
}

pub(crate) fn phys(addr: usize) -> PhysAddr {
    PhysAddr::new(addr as u64)
}
