//! Compile-time limits and the boot-time configuration.

use crate::error::{KernelError, KernelResult};
use crate::memory::{DEVSPACE, EXTMEM, KERNBASE, PAGE_SIZE};
use crate::serial::LogLevel;

/// Upper bound on process slots.
pub const NPROC: usize = 64;
/// Upper bound on CPUs.
pub const NCPU: usize = 8;
/// Open files per process.
pub const NOFILE: usize = 16;
/// Kernel stack size, one page.
pub const KSTACK_SIZE: usize = PAGE_SIZE;
/// Longest process name kept, excluding the terminator.
pub const NAME_LEN: usize = 15;

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub ncpu: usize,
    pub nproc: usize,
    /// Physical address of the first frame handed to the frame pool.
    pub phys_base: usize,
    /// Number of frames in the pool.
    pub phys_pages: usize,
    /// Bytes of read-only kernel text starting at `EXTMEM`.
    pub kernel_text: usize,
    pub log_level: LogLevel,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            ncpu: 1,
            nproc: NPROC,
            phys_base: 0x20_0000,
            phys_pages: 512,
            kernel_text: 0x8_0000,
            log_level: LogLevel::Info,
        }
    }
}

impl KernelConfig {
    pub fn with_cpus(mut self, ncpu: usize) -> Self {
        self.ncpu = ncpu;
        self
    }

    pub fn with_procs(mut self, nproc: usize) -> Self {
        self.nproc = nproc;
        self
    }

    pub fn with_pages(mut self, pages: usize) -> Self {
        self.phys_pages = pages;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// End of physical memory, one past the last pool frame.
    pub fn phys_top(&self) -> usize {
        self.phys_base + self.phys_pages * PAGE_SIZE
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.ncpu == 0 || self.ncpu > NCPU {
            return Err(KernelError::InvalidConfig("ncpu out of range"));
        }
        if self.nproc == 0 || self.nproc > NPROC {
            return Err(KernelError::InvalidConfig("nproc out of range"));
        }
        if self.phys_pages == 0 {
            return Err(KernelError::InvalidConfig("no physical pages"));
        }
        if self.phys_base % PAGE_SIZE != 0 || self.kernel_text % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidConfig("physical layout not page aligned"));
        }
        if self.phys_base < EXTMEM + self.kernel_text {
            return Err(KernelError::InvalidConfig("frame pool overlaps the kernel image"));
        }
        if KERNBASE + self.phys_top() > DEVSPACE {
            return Err(KernelError::InvalidConfig("physical memory reaches device space"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        let config = KernelConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.phys_top(), 0x40_0000);
    }

    #[test]
    fn rejects_impossible_layouts() {
        assert!(KernelConfig::default().with_cpus(0).validate().is_err());
        assert!(KernelConfig::default().with_cpus(NCPU + 1).validate().is_err());
        assert!(KernelConfig::default().with_pages(0).validate().is_err());

        let mut overlap = KernelConfig::default();
        overlap.phys_base = EXTMEM;
        assert_eq!(
            overlap.validate(),
            Err(KernelError::InvalidConfig("frame pool overlaps the kernel image"))
        );

        let huge = KernelConfig::default().with_pages(0x7E00_0000 / PAGE_SIZE);
        assert!(huge.validate().is_err());
    }
}
