//! The first user process.
//!
//! init does nothing but reap. Orphans are handed to it, so it waits in a
//! loop; when it has no children at all it naps for a few ticks and looks
//! again.

use crate::interrupts::TrapFrame;
use crate::memory::UserMemory;
use crate::syscalls::{SYS_SLEEP, SYS_WAIT};

/// Word at address 0: ticks to nap between idle polls.
pub const INITCODE: &[u8] = &[1, 0, 0, 0];

const WAITING: u32 = 1;

/// Program counter in `eip`: 0 at entry, `WAITING` after a `wait` was
/// issued.
pub fn init_program(tf: &mut TrapFrame, memory: &mut UserMemory<'_>) {
    if tf.eip == WAITING && tf.result() < 0 {
        let nap = memory.read_u32(0).unwrap_or(1);
        tf.eip = 0;
        tf.syscall(SYS_SLEEP, &[nap]);
        return;
    }
    tf.eip = WAITING;
    tf.syscall(SYS_WAIT, &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing;
    use crate::scheduler::{ProcessId, ProcessState};

    #[test]
    fn init_reaps_orphans() {
        let k = testing::kernel(1, 64);
        assert_eq!(k.userinit(init_program, INITCODE), Ok(ProcessId(1)));
        let child = k.spawn("orphan", |_, _| async {}).unwrap();
        for _ in 0..4 {
            k.scan(0);
        }
        assert_eq!(k.processes().state_of(child), None);
        // With nothing left to reap, init naps on the clock.
        assert_eq!(k.processes().state_of(ProcessId(1)), Some(ProcessState::Sleeping));
        // One pass to wake and yield for the tick, one to go back to sleep.
        k.clock_tick();
        k.scan(0);
        k.scan(0);
        assert_eq!(k.processes().state_of(ProcessId(1)), Some(ProcessState::Sleeping));
    }
}
