#![cfg_attr(not(test), no_std)]

//! Quark: the process and virtual-memory core of a small multiprocessor
//! teaching kernel.

extern crate alloc;

pub mod serial;

pub mod arch;
pub mod cpu;
pub mod error;
pub mod fs;
pub mod init;
pub mod interrupts;
pub mod kernel;
pub mod memory;
pub mod param;
pub mod scheduler;
pub mod shm;
pub mod syscalls;

pub use error::{KernelError, KernelResult};
pub use kernel::Kernel;
pub use param::KernelConfig;

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log_error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
