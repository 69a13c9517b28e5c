//! Named shared-memory objects.
//!
//! A process opens an object by name and gets a small descriptor back.
//! The first opener sizes it once with `shm_trunc`; any holder can then map
//! all of its pages into a fixed window that belongs to the descriptor.
//! Pages live until the last descriptor on the object is closed.

use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::PhysFrame;

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::memory::{page_round_up, virt, PteFlags, KERNBASE, PAGE_SIZE};
use crate::scheduler::Task;

/// Objects system-wide.
pub const NSHMO: usize = 16;
/// Descriptors per process.
pub const NOSHMO: usize = 8;
/// Largest object, in pages.
pub const SHM_PAGES: usize = 32;
/// Start of the mapping windows. User heap stays below it.
pub const SHM_BASE: usize = KERNBASE / 2;
pub const SHM_NAME_MAX: usize = 64;

const WINDOW: usize = SHM_PAGES * PAGE_SIZE;

struct ShmObject {
    name: String,
    refs: usize,
    size: usize,
    pages: Vec<PhysFrame>,
}

impl ShmObject {
    fn empty() -> Self {
        ShmObject {
            name: String::new(),
            refs: 0,
            size: 0,
            pages: Vec::new(),
        }
    }
}

pub struct ShmTable {
    objects: Mutex<Vec<ShmObject>>,
}

impl ShmTable {
    pub fn new() -> Self {
        ShmTable {
            objects: Mutex::new((0..NSHMO).map(|_| ShmObject::empty()).collect()),
        }
    }

    /// Objects with at least one open descriptor.
    pub fn live(&self) -> usize {
        self.objects.lock().iter().filter(|o| o.refs > 0).count()
    }
}

impl Default for ShmTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-process descriptor table.
#[derive(Debug, Default)]
pub struct ShmDescriptors {
    open: [Option<usize>; NOSHMO],
    mapped: [Option<usize>; NOSHMO],
}

impl ShmDescriptors {
    fn object(&self, od: usize) -> KernelResult<usize> {
        self.open
            .get(od)
            .copied()
            .flatten()
            .ok_or(KernelError::BadDescriptor)
    }

    pub fn is_open(&self, od: usize) -> bool {
        self.object(od).is_ok()
    }

    /// Where `od` is mapped, if it is.
    pub fn mapping(&self, od: usize) -> Option<usize> {
        self.mapped.get(od).copied().flatten()
    }
}

/// Fixed user window for descriptor `od`.
pub fn window(od: usize) -> usize {
    SHM_BASE + od * WINDOW
}

impl Kernel {
    /// Opens the object called `name`, creating it if nobody has it open.
    /// A process that already holds it gets its existing descriptor.
    pub fn shm_open(&self, task: &mut Task, name: &str) -> KernelResult<usize> {
        if name.is_empty() || name.len() > SHM_NAME_MAX {
            return Err(KernelError::InvalidArgument);
        }
        let mut objects = self.shm.objects.lock();

        let existing = objects.iter().position(|o| o.refs > 0 && o.name == name);
        if let Some(id) = existing {
            if let Some(od) = task.shm.open.iter().position(|&o| o == Some(id)) {
                return Ok(od);
            }
        }

        let od = task
            .shm
            .open
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::NoSpace)?;
        let id = match existing {
            Some(id) => id,
            None => {
                let id = objects
                    .iter()
                    .position(|o| o.refs == 0)
                    .ok_or(KernelError::NoSpace)?;
                objects[id].name = String::from(name);
                id
            }
        };
        objects[id].refs += 1;
        task.shm.open[od] = Some(id);
        Ok(od)
    }

    /// Sets the size of a fresh object and gives it zeroed pages. Works
    /// once per object.
    pub fn shm_trunc(&self, task: &mut Task, od: usize, size: usize) -> KernelResult<usize> {
        let id = task.shm.object(od)?;
        if size == 0 || size > WINDOW {
            return Err(KernelError::InvalidArgument);
        }
        let mut objects = self.shm.objects.lock();
        let object = &mut objects[id];
        if object.size != 0 {
            return Err(KernelError::InvalidArgument);
        }

        let count = page_round_up(size) / PAGE_SIZE;
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            match self.frames.allocate_frame() {
                Some(frame) => {
                    self.frames.zero(frame);
                    pages.push(frame);
                }
                None => {
                    for frame in pages {
                        self.frames.deallocate_frame(frame);
                    }
                    crate::log_warn!("shm_trunc: {}: out of memory", object.name);
                    return Err(KernelError::OutOfMemory);
                }
            }
        }
        object.pages = pages;
        object.size = size;
        Ok(size)
    }

    /// Maps every page of the object at the descriptor's window and returns
    /// its address. Pages are user-writable only if `writable`.
    pub fn shm_map(&self, task: &mut Task, od: usize, writable: bool) -> KernelResult<usize> {
        let id = task.shm.object(od)?;
        if let Some(va) = task.shm.mapping(od) {
            return Ok(va);
        }
        let objects = self.shm.objects.lock();
        let object = &objects[id];
        if object.size == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let perm = if writable {
            PteFlags::USER | PteFlags::WRITABLE
        } else {
            PteFlags::USER
        };
        let base = window(od);
        for (i, frame) in object.pages.iter().enumerate() {
            let va = base + i * PAGE_SIZE;
            if let Err(e) = task
                .space
                .map(&self.frames, virt(va), PAGE_SIZE, frame.start_address(), perm)
            {
                task.space.unmap(&self.frames, virt(base), i * PAGE_SIZE);
                return Err(e);
            }
        }
        task.shm.mapped[od] = Some(base);
        Ok(base)
    }

    /// Unmaps and closes `od`. The last close frees the pages.
    pub fn shm_close(&self, task: &mut Task, od: usize) -> KernelResult<()> {
        let id = task.shm.object(od)?;
        let mut objects = self.shm.objects.lock();
        let object = &mut objects[id];
        if let Some(va) = task.shm.mapped[od].take() {
            task.space
                .unmap(&self.frames, virt(va), object.pages.len() * PAGE_SIZE);
        }
        task.shm.open[od] = None;

        if object.refs == 0 {
            panic!("shm_close: {} has no references", object.name);
        }
        object.refs -= 1;
        if object.refs == 0 {
            for frame in object.pages.drain(..) {
                self.frames.deallocate_frame(frame);
            }
            *object = ShmObject::empty();
        }
        Ok(())
    }

    /// Closes every descriptor `task` holds.
    pub(crate) fn shm_close_all(&self, task: &mut Task) {
        for od in 0..NOSHMO {
            if task.shm.is_open(od) {
                let _ = self.shm_close(task, od);
            }
        }
    }

    pub fn shm_live(&self) -> usize {
        self.shm.live()
    }
}
