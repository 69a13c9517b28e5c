use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use x86_64::{structures::paging::PhysFrame, PhysAddr};

use super::Platform;

const KERNEL_ROOT: u64 = 0;

struct SimCpu {
    interrupts: AtomicBool,
    halts: AtomicUsize,
    root: AtomicU64,
    kstack_top: AtomicU64,
}

/// Software stand-in for the machine: interrupt flags are plain atomics and
/// the "MMU" just remembers which directory was loaded.
pub struct SimPlatform {
    cpus: Vec<SimCpu>,
    idle: Option<fn()>,
}

impl SimPlatform {
    pub fn new(ncpu: usize) -> Self {
        let cpus = (0..ncpu)
            .map(|_| SimCpu {
                interrupts: AtomicBool::new(false),
                halts: AtomicUsize::new(0),
                root: AtomicU64::new(KERNEL_ROOT),
                kstack_top: AtomicU64::new(0),
            })
            .collect();
        SimPlatform { cpus, idle: None }
    }

    /// Calls `idle` whenever a CPU would halt, e.g. to yield a host thread.
    pub fn with_idle(mut self, idle: fn()) -> Self {
        self.idle = Some(idle);
        self
    }

    pub fn halts(&self, cpu: usize) -> usize {
        self.cpus[cpu].halts.load(Ordering::Relaxed)
    }

    /// Directory currently loaded on `cpu`; `None` for the kernel's.
    pub fn active_root(&self, cpu: usize) -> Option<PhysAddr> {
        match self.cpus[cpu].root.load(Ordering::Acquire) {
            KERNEL_ROOT => None,
            raw => Some(PhysAddr::new(raw)),
        }
    }

    pub fn kstack_top(&self, cpu: usize) -> u64 {
        self.cpus[cpu].kstack_top.load(Ordering::Relaxed)
    }
}

impl Platform for SimPlatform {
    fn interrupts_enabled(&self, cpu: usize) -> bool {
        self.cpus[cpu].interrupts.load(Ordering::Relaxed)
    }

    fn enable_interrupts(&self, cpu: usize) {
        self.cpus[cpu].interrupts.store(true, Ordering::Relaxed);
    }

    fn disable_interrupts(&self, cpu: usize) {
        self.cpus[cpu].interrupts.store(false, Ordering::Relaxed);
    }

    fn wait_for_interrupt(&self, cpu: usize) {
        self.cpus[cpu].halts.fetch_add(1, Ordering::Relaxed);
        match self.idle {
            Some(idle) => idle(),
            None => core::hint::spin_loop(),
        }
    }

    fn switch_uvm(&self, cpu: usize, root: PhysFrame, kstack_top: PhysAddr) {
        let c = &self.cpus[cpu];
        c.kstack_top.store(kstack_top.as_u64(), Ordering::Relaxed);
        c.root.store(root.start_address().as_u64(), Ordering::Release);
    }

    fn switch_kvm(&self, cpu: usize) {
        self.cpus[cpu].root.store(KERNEL_ROOT, Ordering::Release);
    }
}
