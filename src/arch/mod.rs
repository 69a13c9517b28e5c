//! What the scheduler needs from the machine.

pub mod sim;
#[cfg(target_arch = "x86_64")]
pub mod x86;

use x86_64::{structures::paging::PhysFrame, PhysAddr};

/// Per-CPU interrupt control and MMU switching. Every method is called on
/// the CPU it names.
pub trait Platform: Send + Sync {
    fn interrupts_enabled(&self, cpu: usize) -> bool;

    fn enable_interrupts(&self, cpu: usize);

    fn disable_interrupts(&self, cpu: usize);

    /// Idles until the next interrupt arrives.
    fn wait_for_interrupt(&self, cpu: usize);

    /// Loads a process's page directory and points the trap stack at its
    /// kernel stack.
    fn switch_uvm(&self, _cpu: usize, _root: PhysFrame, _kstack_top: PhysAddr) {}

    /// Goes back to the kernel-only mappings.
    fn switch_kvm(&self, _cpu: usize) {}
}
