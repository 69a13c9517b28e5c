use alloc::sync::Arc;
use spin::Mutex;

use super::{FileSystem, InodeRef};

pub enum FileType {
    Console,
    Inode(InodeRef),
}

/// An open file. Descriptor tables share it; cloning the `Arc` is `filedup`.
pub struct File {
    pub file_type: FileType,
    pub offset: u32,
    pub readable: bool,
    pub writable: bool,
}

pub type FileRef = Arc<Mutex<File>>;

impl File {
    pub fn new_console() -> FileRef {
        Arc::new(Mutex::new(File {
            file_type: FileType::Console,
            offset: 0,
            readable: true,
            writable: true,
        }))
    }

    pub fn new_inode(inode: InodeRef, readable: bool, writable: bool) -> FileRef {
        Arc::new(Mutex::new(File {
            file_type: FileType::Inode(inode),
            offset: 0,
            readable,
            writable,
        }))
    }
}

/// Drops one reference; the last one releases the inode in a transaction.
pub fn close(fs: &dyn FileSystem, file: FileRef) {
    let Some(last) = Arc::into_inner(file) else {
        return;
    };
    if let FileType::Inode(inode) = last.into_inner().file_type {
        fs.begin_op();
        fs.iput(inode);
        fs.end_op();
    }
}
