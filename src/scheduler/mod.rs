//! Processes and the per-CPU scheduler.
//!
//! Each CPU loops over the process table front to back and resumes the
//! first RUNNABLE process whose context is parked in its slot. A process
//! gives the CPU back only when it yields, sleeps or exits. There is no
//! preemption beyond the once-per-tick yield on return to user mode.

pub mod context;
pub mod lifecycle;
pub mod sleep;
pub mod table;
pub mod task;

use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Poll;

pub use context::KernelContext;
pub use sleep::{Channel, Sleep};
pub use table::{Embryo, Launch, ProcessInfo, ProcessTable, TableGuard, TableInner};
pub use task::{KernelStack, Process, ProcessId, ProcessState, Remains, SlotId, Task};

use crate::kernel::Kernel;

impl Kernel {
    /// The scheduler loop for `cpu`. Never returns.
    pub fn run_scheduler(&self, cpu: usize) -> ! {
        let mut idle = false;
        loop {
            self.platform().enable_interrupts(cpu);
            if idle {
                self.platform().wait_for_interrupt(cpu);
            }
            idle = !self.scan(cpu);
        }
    }

    /// The scheduler loop, until `stop` is raised.
    pub fn run_scheduler_until(&self, cpu: usize, stop: &AtomicBool) {
        let mut idle = false;
        while !stop.load(Ordering::Acquire) {
            self.platform().enable_interrupts(cpu);
            if idle {
                self.platform().wait_for_interrupt(cpu);
            }
            idle = !self.scan(cpu);
        }
        self.platform().disable_interrupts(cpu);
    }

    /// One pass over the table. Returns whether anything ran.
    pub fn scan(&self, cpu: usize) -> bool {
        let c = self.cpu(cpu);
        let platform = self.platform();
        let mut ran = false;

        for index in 0..self.procs.capacity() {
            let slot = SlotId(index);

            c.push_off(platform);
            let picked = {
                let mut t = self.procs.lock();
                let p = t.get_mut(slot);
                let context = if p.state == ProcessState::Runnable {
                    p.context.take()
                } else {
                    None
                };
                match context {
                    None => None,
                    Some(context) => {
                        p.cpu = Some(cpu);
                        let pid = p.pid;
                        let page_table = p.page_table;
                        let kstack_top = p.kstack_top;
                        t.transition(slot, ProcessState::Running);
                        c.set_current(Some(slot));
                        if let (Some(root), Some(top)) = (page_table, kstack_top) {
                            platform.switch_uvm(cpu, root, top);
                        }
                        Some((pid, context))
                    }
                }
            };
            c.pop_off(platform);

            let Some((pid, mut context)) = picked else {
                continue;
            };
            ran = true;
            let outcome = context.switch_to();

            c.push_off(platform);
            {
                let mut t = self.procs.lock();
                platform.switch_kvm(cpu);
                c.set_current(None);
                let p = t.get_mut(slot);
                match outcome {
                    Poll::Pending => {
                        if p.state == ProcessState::Running {
                            panic!("sched running: pid {} gave up the cpu without a new state", pid);
                        }
                        p.cpu = None;
                        p.context = Some(context);
                    }
                    // Exited. The parent may already have reaped the slot.
                    Poll::Ready(()) => {
                        if p.pid == pid {
                            if p.state != ProcessState::Zombie {
                                panic!("pid {} finished without exiting", pid);
                            }
                            p.cpu = None;
                        }
                    }
                }
            }
            c.pop_off(platform);
        }
        ran
    }

    /// Checks a process is ready to leave the CPU, then lets go of the
    /// table lock for the scheduler to take back.
    pub(crate) fn sched(&self, table: TableGuard<'_>, slot: SlotId) {
        if table.get(slot).state == ProcessState::Running {
            panic!("sched running: pid {}", table.get(slot).pid);
        }
        drop(table);
    }

    /// Gives up the CPU for one round.
    pub async fn yield_now(&self, slot: SlotId) {
        {
            let mut t = self.procs.lock();
            t.transition(slot, ProcessState::Runnable);
            self.sched(t, slot);
        }
        futures::pending!();
    }

    /// Slot of the process running on `cpu`.
    pub fn myproc(&self, cpu: usize) -> Option<SlotId> {
        let c = self.cpu(cpu);
        c.push_off(self.platform());
        let slot = c.current();
        c.pop_off(self.platform());
        slot
    }

    /// Logs one line per live process.
    pub fn procdump(&self) {
        for info in self.procs.snapshot() {
            crate::log_info!(
                "{} {} {}{}",
                info.pid,
                info.state.label(),
                info.name,
                if info.killed { " (killed)" } else { "" }
            );
        }
    }
}
