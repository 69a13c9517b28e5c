use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use super::{BlockDevice, Buf, FileSystem, Inode, InodeRef, InodeType, BSIZE, ROOTDEV, ROOTINO};

/// Block that holds the commit counter.
const LOG_HEADER: u32 = 0;

// ──────────────────────────────────────────────────────────────
//  RamDisk
// ──────────────────────────────────────────────────────────────

pub struct RamDisk {
    blocks: Mutex<Vec<[u8; BSIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(nblocks: usize) -> Self {
        RamDisk {
            blocks: Mutex::new(alloc::vec![[0u8; BSIZE]; nblocks]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, dev: u32, blockno: u32) -> Buf {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let blocks = self.blocks.lock();
        let data = *blocks
            .get(blockno as usize)
            .unwrap_or_else(|| panic!("read_block: block {} out of range", blockno));
        Buf { dev, blockno, data }
    }

    fn write_block(&self, buf: &Buf) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut blocks = self.blocks.lock();
        match blocks.get_mut(buf.blockno as usize) {
            Some(block) => *block = buf.data,
            None => panic!("write_block: block {} out of range", buf.blockno),
        }
    }
}

// ──────────────────────────────────────────────────────────────
//  MemFs: flat namespace over a RamDisk
// ──────────────────────────────────────────────────────────────

struct LogState {
    outstanding: usize,
}

/// Counters for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFsStats {
    pub puts: usize,
    pub commits: u32,
    pub outstanding: usize,
}

/// Root directory plus whatever paths were registered with `create`.
/// Every completed outermost transaction bumps a counter on block 0.
pub struct MemFs {
    disk: RamDisk,
    names: Mutex<Vec<(String, InodeRef)>>,
    log: Mutex<LogState>,
    next_inum: AtomicUsize,
    puts: AtomicUsize,
    ready: AtomicBool,
}

impl MemFs {
    pub fn new() -> Self {
        let root = Arc::new(Inode {
            dev: ROOTDEV,
            inum: ROOTINO,
            kind: InodeType::Directory,
        });
        MemFs {
            disk: RamDisk::new(8),
            names: Mutex::new(alloc::vec![(String::from("/"), root)]),
            log: Mutex::new(LogState { outstanding: 0 }),
            next_inum: AtomicUsize::new(ROOTINO as usize + 1),
            puts: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
        }
    }

    /// Registers a file at `path`.
    pub fn create(&self, path: &str, kind: InodeType) -> InodeRef {
        let inum = self.next_inum.fetch_add(1, Ordering::Relaxed) as u32;
        let inode = Arc::new(Inode {
            dev: ROOTDEV,
            inum,
            kind,
        });
        self.names.lock().push((String::from(path), inode.clone()));
        inode
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn disk(&self) -> &RamDisk {
        &self.disk
    }

    /// References to the root inode held outside the name table.
    pub fn root_refs(&self) -> usize {
        self.namei("/").map_or(0, |root| Arc::strong_count(&root) - 2)
    }

    pub fn stats(&self) -> MemFsStats {
        MemFsStats {
            puts: self.puts.load(Ordering::Relaxed),
            commits: self.commits(),
            outstanding: self.log.lock().outstanding,
        }
    }

    fn commits(&self) -> u32 {
        let header = self.disk.read_block(ROOTDEV, LOG_HEADER);
        u32::from_le_bytes([header.data[0], header.data[1], header.data[2], header.data[3]])
    }

    fn commit(&self) {
        let mut header = self.disk.read_block(ROOTDEV, LOG_HEADER);
        let n = u32::from_le_bytes([header.data[0], header.data[1], header.data[2], header.data[3]]);
        header.data[..4].copy_from_slice(&(n + 1).to_le_bytes());
        self.disk.write_block(&header);
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemFs {
    fn init(&self) {
        let _ = self.disk.read_block(ROOTDEV, LOG_HEADER);
        self.ready.store(true, Ordering::Release);
        crate::log_info!("memfs: ready");
    }

    fn namei(&self, path: &str) -> Option<InodeRef> {
        self.names
            .lock()
            .iter()
            .find(|(name, _)| name == path)
            .map(|(_, inode)| inode.clone())
    }

    fn begin_op(&self) {
        self.log.lock().outstanding += 1;
    }

    fn end_op(&self) {
        let mut log = self.log.lock();
        if log.outstanding == 0 {
            panic!("end_op: no transaction in progress");
        }
        log.outstanding -= 1;
        if log.outstanding == 0 {
            self.commit();
        }
    }

    fn iput(&self, inode: InodeRef) {
        if self.log.lock().outstanding == 0 {
            panic!("iput: inode {} released outside a transaction", inode.inum);
        }
        self.puts.fetch_add(1, Ordering::Relaxed);
        drop(inode);
    }
}
