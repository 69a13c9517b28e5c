//! User mode, seen from the kernel.
//!
//! A user program is a plain function that runs from one trap to the next.
//! It gets the saved registers and a view of its own memory, and returns
//! when it traps: with `trapno == T_SYSCALL` to make a system call, or with
//! the timer vector left in place when its time slice ran out.

use alloc::boxed::Box;

use super::{FL_IF, T_SYSCALL, T_TIMER};
use crate::kernel::Kernel;
use crate::memory::UserMemory;
use crate::scheduler::Task;
use crate::syscalls::{self, SYS_EXIT};

/// Registers saved on entry to the kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

impl TrapFrame {
    /// Fresh user registers: start at `entry` with the stack at `stack_top`.
    pub fn user_entry(entry: u32, stack_top: u32) -> Self {
        TrapFrame {
            eip: entry,
            esp: stack_top,
            eflags: FL_IF,
            ..TrapFrame::default()
        }
    }

    /// Loads a system call request.
    pub fn syscall(&mut self, num: u32, args: &[u32]) {
        self.eax = num;
        let mut regs = [&mut self.ebx, &mut self.ecx, &mut self.edx];
        for (reg, arg) in regs.iter_mut().zip(args) {
            **reg = *arg;
        }
        self.trapno = T_SYSCALL;
    }

    pub fn arg(&self, n: usize) -> u32 {
        match n {
            0 => self.ebx,
            1 => self.ecx,
            2 => self.edx,
            _ => 0,
        }
    }

    /// Signed view of `eax`, where system calls leave their result.
    pub fn result(&self) -> i32 {
        self.eax as i32
    }
}

pub type UserProgram = fn(&mut TrapFrame, &mut UserMemory<'_>);

/// Body of every process that has a user side. Runs the program trap by
/// trap until it exits or is killed.
pub(crate) async fn user_main(kernel: &'static Kernel, mut task: Box<Task>) {
    kernel.forkret();
    let slot = task.slot;
    let mut last_tick = kernel.uptime();

    loop {
        if kernel.procs.killed(slot) {
            break;
        }
        let Some(program) = task.program else {
            break;
        };

        {
            let t: &mut Task = &mut task;
            t.tf.trapno = T_TIMER;
            let mut memory = UserMemory::new(&kernel.frames, &t.space, t.size);
            program(&mut t.tf, &mut memory);
        }

        match task.tf.trapno {
            T_SYSCALL => {
                if kernel.procs.killed(slot) {
                    break;
                }
                if task.tf.eax == SYS_EXIT {
                    break;
                }
                let result = syscalls::dispatch(kernel, &mut task).await;
                task.tf.eax = result;
                if kernel.procs.killed(slot) {
                    break;
                }
            }
            T_TIMER => {
                last_tick = kernel.uptime();
                kernel.yield_now(slot).await;
                continue;
            }
            trapno => {
                crate::log_warn!(
                    "pid {} {}: trap {} err {} eip {:#x}, kill proc",
                    task.pid,
                    task.name,
                    trapno,
                    task.tf.err,
                    task.tf.eip
                );
                kernel.procs.lock().get_mut(slot).killed = true;
                break;
            }
        }

        let now = kernel.uptime();
        if now != last_tick {
            last_tick = now;
            kernel.yield_now(slot).await;
        }
    }

    kernel.exit(task);
}
