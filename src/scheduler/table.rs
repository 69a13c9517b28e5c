use alloc::string::String;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};
use x86_64::structures::paging::PhysFrame;

use super::context::KernelContext;
use super::sleep::Channel;
use super::task::{short_name, KernelStack, Process, ProcessId, ProcessState, SlotId};
use crate::error::{KernelError, KernelResult};
use crate::memory::FramePool;

/// A slot that has been claimed but not yet published.
#[derive(Debug)]
pub struct Embryo {
    pub slot: SlotId,
    pub pid: ProcessId,
    pub kstack: KernelStack,
}

/// How a freshly built process goes live.
pub struct Launch {
    pub parent: Option<SlotId>,
    pub name: String,
    pub page_table: PhysFrame,
    pub context: KernelContext,
}

/// Read-only view of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: ProcessId,
    pub state: ProcessState,
    pub name: String,
    pub parent: Option<ProcessId>,
    pub killed: bool,
}

/// Everything behind the table lock.
pub struct TableInner {
    pub(crate) procs: Vec<Process>,
    next_pid: u32,
    pub(crate) init: Option<SlotId>,
}

pub type TableGuard<'a> = MutexGuard<'a, TableInner>;

impl TableInner {
    pub fn get(&self, slot: SlotId) -> &Process {
        &self.procs[slot.0]
    }

    pub fn get_mut(&mut self, slot: SlotId) -> &mut Process {
        &mut self.procs[slot.0]
    }

    pub fn capacity(&self) -> usize {
        self.procs.len()
    }

    /// Moves `slot` to `next`, refusing anything off the lifecycle graph.
    pub fn transition(&mut self, slot: SlotId, next: ProcessState) {
        let p = &mut self.procs[slot.0];
        if !p.state.can_become(next) {
            panic!(
                "pid {} (slot {}): illegal transition {:?} -> {:?}",
                p.pid, slot.0, p.state, next
            );
        }
        p.state = next;
    }

    /// Makes every process sleeping on `chan` runnable. Holding the guard is
    /// what makes this race-free with `sleep`.
    pub fn wakeup(&mut self, chan: Channel) -> usize {
        let mut woken = 0;
        for p in self.procs.iter_mut() {
            if p.state == ProcessState::Sleeping && p.chan == Some(chan) {
                p.state = ProcessState::Runnable;
                woken += 1;
            }
        }
        woken
    }

    /// Returns a reaped or abandoned slot to the free pool.
    pub(crate) fn release(&mut self, slot: SlotId) {
        self.transition(slot, ProcessState::Unused);
        self.procs[slot.0].reset();
    }

    pub fn find(&self, pid: ProcessId) -> Option<SlotId> {
        self.procs
            .iter()
            .position(|p| p.state != ProcessState::Unused && p.pid == pid)
            .map(SlotId)
    }
}

/// Fixed-capacity table of process slots under one lock.
pub struct ProcessTable {
    inner: Mutex<TableInner>,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        ProcessTable {
            inner: Mutex::new(TableInner {
                procs: (0..capacity).map(|_| Process::new()).collect(),
                next_pid: 1,
                init: None,
            }),
        }
    }

    pub fn lock(&self) -> TableGuard<'_> {
        self.inner.lock()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn init(&self) -> Option<SlotId> {
        self.lock().init
    }

    /// Claims an unused slot and gives it a kernel stack. The stack is
    /// allocated after the lock is dropped; on failure the slot goes back
    /// to UNUSED and its pid is burnt.
    pub fn allocate(&self, pool: &FramePool) -> KernelResult<Embryo> {
        let (slot, pid) = {
            let mut t = self.lock();
            let slot = t
                .procs
                .iter()
                .position(|p| p.state == ProcessState::Unused)
                .map(SlotId)
                .ok_or(KernelError::ProcessTableFull)?;
            t.transition(slot, ProcessState::Embryo);
            let pid = ProcessId(t.next_pid);
            t.next_pid += 1;
            t.get_mut(slot).pid = pid;
            (slot, pid)
        };

        match KernelStack::allocate(pool) {
            Some(kstack) => Ok(Embryo { slot, pid, kstack }),
            None => {
                self.lock().release(slot);
                Err(KernelError::OutOfMemory)
            }
        }
    }

    /// Gives up on an embryo whose setup failed.
    pub fn abandon(&self, embryo: Embryo, pool: &FramePool) {
        embryo.kstack.release(pool);
        self.lock().release(embryo.slot);
    }

    /// Fills in an embryo and makes it RUNNABLE.
    pub fn publish(&self, slot: SlotId, kstack_top: x86_64::PhysAddr, launch: Launch) {
        let mut t = self.lock();
        let p = t.get_mut(slot);
        p.parent = launch.parent;
        p.name = short_name(&launch.name);
        p.page_table = Some(launch.page_table);
        p.kstack_top = Some(kstack_top);
        p.context = Some(launch.context);
        t.transition(slot, ProcessState::Runnable);
    }

    /// Asks `pid` to exit at its next safe point. A sleeping target is made
    /// runnable so it notices promptly; a running one is left alone.
    pub fn kill(&self, pid: ProcessId) -> KernelResult<()> {
        let mut t = self.lock();
        let slot = t.find(pid).ok_or(KernelError::NoSuchProcess)?;
        let p = t.get_mut(slot);
        p.killed = true;
        if p.state == ProcessState::Sleeping {
            p.state = ProcessState::Runnable;
        }
        Ok(())
    }

    pub fn killed(&self, slot: SlotId) -> bool {
        self.lock().get(slot).killed
    }

    pub fn state_of(&self, pid: ProcessId) -> Option<ProcessState> {
        let t = self.lock();
        t.find(pid).map(|slot| t.get(slot).state)
    }

    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        let t = self.lock();
        t.procs
            .iter()
            .filter(|p| p.state != ProcessState::Unused)
            .map(|p| ProcessInfo {
                pid: p.pid,
                state: p.state,
                name: p.name.clone(),
                parent: p.parent.map(|s| t.get(s).pid),
                killed: p.killed,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::PhysAddr;

    fn pool() -> FramePool {
        FramePool::new(PhysAddr::new(0x20_0000), 8)
    }

    fn launch(pool: &FramePool) -> Launch {
        Launch {
            parent: None,
            name: String::from("t"),
            page_table: pool.allocate_frame().unwrap(),
            context: KernelContext::new(async {}),
        }
    }

    #[test]
    fn pids_increase_and_are_not_reused() {
        let pool = pool();
        let table = ProcessTable::new(2);
        let a = table.allocate(&pool).unwrap();
        let b = table.allocate(&pool).unwrap();
        assert_eq!((a.pid, b.pid), (ProcessId(1), ProcessId(2)));
        assert_eq!(table.allocate(&pool).unwrap_err(), KernelError::ProcessTableFull);

        let freed = a.slot;
        table.abandon(a, &pool);
        let c = table.allocate(&pool).unwrap();
        assert_eq!(c.slot, freed);
        assert_eq!(c.pid, ProcessId(3));
        table.abandon(b, &pool);
        table.abandon(c, &pool);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn stack_exhaustion_reverts_the_slot() {
        let pool = FramePool::new(PhysAddr::new(0x20_0000), 1);
        let table = ProcessTable::new(4);
        let held = pool.allocate_frame().unwrap();
        assert_eq!(table.allocate(&pool).unwrap_err(), KernelError::OutOfMemory);
        assert!(table.snapshot().is_empty());
        pool.deallocate_frame(held);
        assert_eq!(table.allocate(&pool).unwrap().pid, ProcessId(2));
    }

    #[test]
    fn publish_makes_the_embryo_runnable() {
        let pool = pool();
        let table = ProcessTable::new(2);
        let e = table.allocate(&pool).unwrap();
        assert_eq!(table.state_of(e.pid), Some(ProcessState::Embryo));
        table.publish(e.slot, e.kstack.top(), launch(&pool));
        let info = &table.snapshot()[0];
        assert_eq!(info.state, ProcessState::Runnable);
        assert_eq!(info.name, "t");
    }

    #[test]
    fn kill_wakes_sleepers_but_not_runners() {
        let pool = pool();
        let table = ProcessTable::new(2);
        let a = table.allocate(&pool).unwrap();
        let b = table.allocate(&pool).unwrap();
        table.publish(a.slot, a.kstack.top(), launch(&pool));
        table.publish(b.slot, b.kstack.top(), launch(&pool));
        {
            let mut t = table.lock();
            t.transition(a.slot, ProcessState::Running);
            t.transition(a.slot, ProcessState::Sleeping);
            t.get_mut(a.slot).chan = Some(Channel::Token(7));
            t.transition(b.slot, ProcessState::Running);
        }

        table.kill(a.pid).unwrap();
        assert_eq!(table.state_of(a.pid), Some(ProcessState::Runnable));
        table.kill(b.pid).unwrap();
        assert_eq!(table.state_of(b.pid), Some(ProcessState::Running));
        assert!(table.killed(b.slot));
        assert_eq!(table.kill(ProcessId(99)), Err(KernelError::NoSuchProcess));
    }

    #[test]
    fn wakeup_is_a_broadcast_on_one_channel() {
        let table = ProcessTable::new(3);
        let mut t = table.lock();
        for (i, chan) in [(0, Channel::Ticks), (1, Channel::Ticks), (2, Channel::Token(1))] {
            let p = t.get_mut(SlotId(i));
            p.state = ProcessState::Sleeping;
            p.chan = Some(chan);
        }
        assert_eq!(t.wakeup(Channel::Ticks), 2);
        assert_eq!(t.get(SlotId(0)).state, ProcessState::Runnable);
        assert_eq!(t.get(SlotId(2)).state, ProcessState::Sleeping);
        assert_eq!(t.wakeup(Channel::Ticks), 0);
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn skipping_a_state_is_fatal() {
        let table = ProcessTable::new(1);
        table.lock().transition(SlotId(0), ProcessState::Runnable);
    }

    #[test]
    fn unused_slots_do_not_answer_to_pid_zero() {
        let table = ProcessTable::new(2);
        assert_eq!(table.kill(ProcessId(0)), Err(KernelError::NoSuchProcess));
    }
}
