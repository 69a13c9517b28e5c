use alloc::string::String;
use core::fmt;
use x86_64::{structures::paging::PhysFrame, PhysAddr};

use super::context::KernelContext;
use super::sleep::Channel;
use crate::fs::{FileRef, InodeRef};
use crate::interrupts::usermode::{TrapFrame, UserProgram};
use crate::memory::{AddressSpace, FramePool, UserMemory, PAGE_SIZE};
use crate::param::{NAME_LEN, NOFILE};
use crate::shm::ShmDescriptors;

/// Unique process identifier. Assigned in increasing order, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a process-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcessState {
    /// The only moves the table accepts.
    pub fn can_become(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Unused, Embryo)
                | (Embryo, Runnable)
                | (Embryo, Unused)
                | (Runnable, Running)
                | (Running, Runnable)
                | (Running, Sleeping)
                | (Running, Zombie)
                | (Sleeping, Runnable)
                | (Zombie, Unused)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ProcessState::Unused => "unused",
            ProcessState::Embryo => "embryo",
            ProcessState::Sleeping => "sleep ",
            ProcessState::Runnable => "runble",
            ProcessState::Running => "run   ",
            ProcessState::Zombie => "zombie",
        }
    }
}

/// One page of kernel stack.
#[derive(Debug)]
pub struct KernelStack {
    frame: PhysFrame,
}

impl KernelStack {
    pub fn allocate(pool: &FramePool) -> Option<Self> {
        let frame = pool.allocate_frame()?;
        pool.zero(frame);
        Some(KernelStack { frame })
    }

    pub fn top(&self) -> PhysAddr {
        self.frame.start_address() + PAGE_SIZE as u64
    }

    pub fn release(self, pool: &FramePool) {
        pool.deallocate_frame(self.frame);
    }
}

/// Left in the slot by `exit` for the parent to reclaim.
#[derive(Debug)]
pub struct Remains {
    pub kstack: KernelStack,
    pub space: AddressSpace,
}

/// Process control block: the part of a process other CPUs may look at.
/// Every field is guarded by the table lock.
pub struct Process {
    pub pid: ProcessId,
    pub state: ProcessState,
    pub parent: Option<SlotId>,
    pub chan: Option<Channel>,
    pub killed: bool,
    pub name: String,
    /// CPU currently running it.
    pub cpu: Option<usize>,
    pub(crate) page_table: Option<PhysFrame>,
    pub(crate) kstack_top: Option<PhysAddr>,
    /// Saved continuation; absent while the process is on a CPU.
    pub(crate) context: Option<KernelContext>,
    pub(crate) remains: Option<Remains>,
}

impl Process {
    pub(crate) fn new() -> Self {
        Process {
            pid: ProcessId(0),
            state: ProcessState::Unused,
            parent: None,
            chan: None,
            killed: false,
            name: String::new(),
            cpu: None,
            page_table: None,
            kstack_top: None,
            context: None,
            remains: None,
        }
    }

    /// Clears everything except `state`.
    pub(crate) fn reset(&mut self) {
        self.pid = ProcessId(0);
        self.parent = None;
        self.chan = None;
        self.killed = false;
        self.name.clear();
        self.cpu = None;
        self.page_table = None;
        self.kstack_top = None;
        self.context = None;
        self.remains = None;
    }
}

/// Everything a process owns privately. It travels inside the process's
/// kernel context, so only the process itself ever touches it.
pub struct Task {
    pub slot: SlotId,
    pub pid: ProcessId,
    /// Bytes of user memory, from address 0.
    pub size: usize,
    pub space: AddressSpace,
    pub kstack: KernelStack,
    pub tf: TrapFrame,
    pub program: Option<UserProgram>,
    pub files: [Option<FileRef>; NOFILE],
    pub cwd: Option<InodeRef>,
    pub shm: ShmDescriptors,
    pub name: String,
}

impl Task {
    pub fn memory<'a>(&'a self, pool: &'a FramePool) -> UserMemory<'a> {
        UserMemory::new(pool, &self.space, self.size)
    }

    /// Puts `file` in the lowest free descriptor.
    pub fn install_file(&mut self, file: FileRef) -> Option<usize> {
        let fd = self.files.iter().position(Option::is_none)?;
        self.files[fd] = Some(file);
        Some(fd)
    }
}

pub(crate) fn short_name(name: &str) -> String {
    name.chars().take(NAME_LEN).collect()
}
