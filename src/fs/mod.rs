//! The slice of the file system the process core depends on: resolving a
//! path to an inode, dropping inode references inside a transaction, and
//! the block device underneath. `memfs` is a small in-memory implementation.

pub mod file;
pub mod inode;
pub mod memfs;

pub use file::{File, FileRef, FileType};
pub use inode::{Inode, InodeRef, InodeType};
pub use memfs::{MemFs, RamDisk};

pub const BSIZE: usize = 512;
pub const ROOTDEV: u32 = 1;
pub const ROOTINO: u32 = 1;

/// One disk block. Whoever holds it has it locked.
#[derive(Clone)]
pub struct Buf {
    pub dev: u32,
    pub blockno: u32,
    pub data: [u8; BSIZE],
}

pub trait BlockDevice: Send + Sync {
    fn read_block(&self, dev: u32, blockno: u32) -> Buf;

    fn write_block(&self, buf: &Buf);
}

pub trait FileSystem: Send + Sync {
    /// Runs once, in the context of the first process to be scheduled.
    fn init(&self) {}

    fn namei(&self, path: &str) -> Option<InodeRef>;

    fn begin_op(&self);

    fn end_op(&self);

    /// Drops one in-memory reference. Must be called between `begin_op`
    /// and `end_op`.
    fn iput(&self, inode: InodeRef);
}
