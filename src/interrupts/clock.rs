use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::scheduler::{Channel, SlotId};

impl Kernel {
    /// Timer interrupt on the boot CPU.
    pub fn clock_tick(&self) {
        let mut ticks = self.ticks.lock();
        *ticks += 1;
        // The table lock nests inside the tick lock.
        self.procs.lock().wakeup(Channel::Ticks);
        drop(ticks);
    }

    pub fn uptime(&self) -> u64 {
        *self.ticks.lock()
    }

    /// Sleeps for `n` ticks. Gives up early if the process is killed.
    pub async fn sleep_ticks(&self, slot: SlotId, n: u64) -> KernelResult<()> {
        let start = self.uptime();
        loop {
            let sleep = {
                let ticks = self.ticks.lock();
                if *ticks - start >= n {
                    return Ok(());
                }
                if self.procs.killed(slot) {
                    return Err(KernelError::Killed);
                }
                self.sleep(slot, Channel::Ticks, ticks)
            };
            sleep.await;
        }
    }
}
