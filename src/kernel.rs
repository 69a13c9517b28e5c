//! The kernel runtime object.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, Once};

use crate::arch::Platform;
use crate::cpu::Cpu;
use crate::error::KernelResult;
use crate::fs::FileSystem;
use crate::memory::{phys, FramePool, KernelMapping};
use crate::param::KernelConfig;
use crate::scheduler::ProcessTable;
use crate::serial;
use crate::shm::ShmTable;

/// Everything the process core shares between CPUs. Built once by
/// [`Kernel::boot`] and never freed.
pub struct Kernel {
    config: KernelConfig,
    pub(crate) frames: FramePool,
    pub(crate) kmap: Vec<KernelMapping>,
    pub(crate) procs: ProcessTable,
    pub(crate) ticks: Mutex<u64>,
    cpus: Vec<Cpu>,
    platform: &'static dyn Platform,
    fs: Arc<dyn FileSystem>,
    pub(crate) shm: ShmTable,
    pub(crate) fs_ready: Once<()>,
}

impl Kernel {
    pub fn boot(
        config: KernelConfig,
        platform: &'static dyn Platform,
        fs: Arc<dyn FileSystem>,
    ) -> KernelResult<&'static Kernel> {
        config.validate()?;
        serial::set_max_level(config.log_level);

        let kernel = Kernel {
            frames: FramePool::new(phys(config.phys_base), config.phys_pages),
            kmap: KernelMapping::layout(&config),
            procs: ProcessTable::new(config.nproc),
            ticks: Mutex::new(0),
            cpus: (0..config.ncpu).map(Cpu::new).collect(),
            platform,
            fs,
            shm: ShmTable::new(),
            fs_ready: Once::new(),
            config,
        };
        crate::log_info!(
            "boot: {} cpus, {} procs, {} pages at {:#x}",
            kernel.config.ncpu,
            kernel.config.nproc,
            kernel.config.phys_pages,
            kernel.config.phys_base
        );
        Ok(Box::leak(Box::new(kernel)))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn cpu(&self, cpu: usize) -> &Cpu {
        self.cpus
            .get(cpu)
            .unwrap_or_else(|| panic!("cpu {} out of range", cpu))
    }

    pub fn ncpu(&self) -> usize {
        self.cpus.len()
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform
    }

    pub fn fs(&self) -> &dyn FileSystem {
        &*self.fs
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    /// The kernel half every address space starts with.
    pub fn kernel_map(&self) -> &[KernelMapping] {
        &self.kmap
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.procs
    }
}

/// Boots on the machine we are running on, logging to COM1.
#[cfg(target_arch = "x86_64")]
pub fn boot_bare_metal(config: KernelConfig, fs: Arc<dyn FileSystem>) -> KernelResult<&'static Kernel> {
    serial::init();
    Kernel::boot(config, &crate::arch::x86::X86Platform, fs).map_err(|e| {
        crate::log_error!("boot failed: {}", e);
        e
    })
}
