use x86_64::instructions::{hlt, interrupts};

use super::Platform;

/// The CPU we are running on. Interrupt state is per core in hardware, so
/// the `cpu` argument is implied.
pub struct X86Platform;

impl Platform for X86Platform {
    fn interrupts_enabled(&self, _cpu: usize) -> bool {
        interrupts::are_enabled()
    }

    fn enable_interrupts(&self, _cpu: usize) {
        interrupts::enable();
    }

    fn disable_interrupts(&self, _cpu: usize) {
        interrupts::disable();
    }

    fn wait_for_interrupt(&self, _cpu: usize) {
        hlt();
    }
}
