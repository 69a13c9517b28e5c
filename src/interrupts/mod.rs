//! Traps: the user-mode return loop and the clock.

pub mod clock;
pub mod usermode;

pub use usermode::{TrapFrame, UserProgram};

pub const T_PGFLT: u32 = 14;
pub const T_IRQ0: u32 = 32;
pub const IRQ_TIMER: u32 = 0;
pub const T_TIMER: u32 = T_IRQ0 + IRQ_TIMER;
/// `int 0x40`.
pub const T_SYSCALL: u32 = 64;

/// Interrupt-enable bit of `eflags`.
pub const FL_IF: u32 = 0x200;
