use alloc::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    File,
    Directory,
    Device,
}

/// In-memory handle for an on-disk inode. Cloning the `Arc` is `idup`.
#[derive(Debug)]
pub struct Inode {
    pub dev: u32,
    pub inum: u32,
    pub kind: InodeType,
}

pub type InodeRef = Arc<Inode>;
