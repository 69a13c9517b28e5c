use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::Platform;
use crate::scheduler::SlotId;

const NO_PROC: usize = usize::MAX;

/// Per-CPU state. Only the owning CPU writes it; atomics let the record
/// live in the shared kernel object.
pub struct Cpu {
    pub id: usize,
    /// Depth of `push_off` nesting.
    ncli: AtomicUsize,
    /// Were interrupts enabled before the outermost `push_off`?
    intena: AtomicBool,
    current: AtomicUsize,
}

impl Cpu {
    pub(crate) fn new(id: usize) -> Self {
        Cpu {
            id,
            ncli: AtomicUsize::new(0),
            intena: AtomicBool::new(false),
            current: AtomicUsize::new(NO_PROC),
        }
    }

    /// Slot of the process running here, if any.
    pub fn current(&self) -> Option<SlotId> {
        match self.current.load(Ordering::Relaxed) {
            NO_PROC => None,
            index => Some(SlotId(index)),
        }
    }

    pub(crate) fn set_current(&self, slot: Option<SlotId>) {
        self.current
            .store(slot.map_or(NO_PROC, |s| s.0), Ordering::Relaxed);
    }

    pub fn depth(&self) -> usize {
        self.ncli.load(Ordering::Relaxed)
    }

    /// Disables interrupts, remembering the outermost previous state.
    /// Matched `push_off`/`pop_off` pairs nest.
    pub fn push_off(&self, platform: &dyn Platform) {
        let was_enabled = platform.interrupts_enabled(self.id);
        platform.disable_interrupts(self.id);
        if self.ncli.load(Ordering::Relaxed) == 0 {
            self.intena.store(was_enabled, Ordering::Relaxed);
        }
        self.ncli.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop_off(&self, platform: &dyn Platform) {
        if platform.interrupts_enabled(self.id) {
            panic!("pop_off: cpu {} interruptible", self.id);
        }
        let depth = self.ncli.load(Ordering::Relaxed);
        if depth == 0 {
            panic!("pop_off: cpu {} not pushed", self.id);
        }
        self.ncli.store(depth - 1, Ordering::Relaxed);
        if depth == 1 && self.intena.load(Ordering::Relaxed) {
            platform.enable_interrupts(self.id);
        }
    }
}
