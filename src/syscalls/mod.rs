//! System call numbers and the dispatcher.
//!
//! Convention: `eax` = number, `ebx`/`ecx`/`edx` = arguments. The result
//! goes back in `eax`; every failure is `-1`.

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::scheduler::{ProcessId, Task};
use crate::shm::SHM_NAME_MAX;

pub const SYS_FORK: u32 = 1;
pub const SYS_EXIT: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_KILL: u32 = 6;
pub const SYS_GETPID: u32 = 11;
pub const SYS_SBRK: u32 = 12;
pub const SYS_SLEEP: u32 = 13;
pub const SYS_UPTIME: u32 = 14;
pub const SYS_YIELD: u32 = 15;
pub const SYS_SHM_OPEN: u32 = 22;
pub const SYS_SHM_TRUNC: u32 = 23;
pub const SYS_SHM_MAP: u32 = 24;
pub const SYS_SHM_CLOSE: u32 = 25;

/// Runs the system call described by `task.tf` and returns the value for
/// `eax`. `exit` never gets here; the trap loop handles it.
pub(crate) async fn dispatch(kernel: &'static Kernel, task: &mut Task) -> u32 {
    let num = task.tf.eax;
    let (a0, a1) = (task.tf.arg(0), task.tf.arg(1));

    let result: KernelResult<u32> = match num {
        SYS_FORK => kernel.fork(task).map(|pid| pid.0),
        SYS_WAIT => kernel.wait(task.slot).await.map(|pid| pid.0),
        SYS_KILL => kernel.kill(ProcessId(a0)).map(|()| 0),
        SYS_GETPID => Ok(task.pid.0),
        SYS_SBRK => kernel.grow_process(task, a0 as i32).map(|old| old as u32),
        SYS_SLEEP => kernel.sleep_ticks(task.slot, u64::from(a0)).await.map(|()| 0),
        SYS_UPTIME => Ok(kernel.uptime() as u32),
        SYS_YIELD => {
            kernel.yield_now(task.slot).await;
            Ok(0)
        }
        SYS_SHM_OPEN => {
            let name = task.memory(&kernel.frames).read_str(a0 as usize, SHM_NAME_MAX);
            name.and_then(|name| kernel.shm_open(task, &name)).map(|od| od as u32)
        }
        SYS_SHM_TRUNC => kernel.shm_trunc(task, a0 as usize, a1 as usize).map(|size| size as u32),
        SYS_SHM_MAP => kernel.shm_map(task, a0 as usize, a1 != 0).map(|va| va as u32),
        SYS_SHM_CLOSE => kernel.shm_close(task, a0 as usize).map(|()| 0),
        _ => {
            crate::log_warn!("{} {}: unknown sys call {}", task.pid, task.name, num);
            Err(KernelError::InvalidArgument)
        }
    };

    match result {
        Ok(value) => value,
        Err(e) => {
            if e.is_exhaustion() {
                crate::log_warn!("{} {}: sys call {}: {}", task.pid, task.name, num, e);
            }
            u32::MAX
        }
    }
}
