//! Creating, forking, exiting and reaping processes.

use alloc::boxed::Box;
use alloc::string::String;
use core::future::Future;

use super::context::KernelContext;
use super::sleep::Channel;
use super::table::{Embryo, Launch};
use super::task::{ProcessId, ProcessState, Remains, SlotId, Task};
use crate::error::{KernelError, KernelResult};
use crate::fs::file;
use crate::interrupts::usermode::{user_main, TrapFrame, UserProgram};
use crate::kernel::Kernel;
use crate::memory::{AddressSpace, PAGE_SIZE};
use crate::shm::{ShmDescriptors, SHM_BASE};

impl Kernel {
    /// Sets up the first user process from a one-page image loaded at 0.
    pub fn userinit(&'static self, program: UserProgram, image: &[u8]) -> KernelResult<ProcessId> {
        if self.procs.init().is_some() {
            panic!("userinit: init already exists");
        }
        let embryo = self.procs.allocate(&self.frames)?;
        let mut space = match AddressSpace::create(&self.frames, &self.kmap) {
            Ok(space) => space,
            Err(e) => {
                self.procs.abandon(embryo, &self.frames);
                return Err(e);
            }
        };
        if let Err(e) = space.load_image(&self.frames, image) {
            space.destroy(&self.frames);
            self.procs.abandon(embryo, &self.frames);
            return Err(e);
        }

        let Embryo { slot, pid, kstack } = embryo;
        let kstack_top = kstack.top();
        let root = space.root();
        let name = String::from("initcode");
        let task = Box::new(Task {
            slot,
            pid,
            size: PAGE_SIZE,
            space,
            kstack,
            tf: TrapFrame::user_entry(0, PAGE_SIZE as u32),
            program: Some(program),
            files: Default::default(),
            cwd: self.fs().namei("/"),
            shm: ShmDescriptors::default(),
            name: name.clone(),
        });

        self.procs.lock().init = Some(slot);
        self.procs.publish(
            slot,
            kstack_top,
            Launch {
                parent: None,
                name,
                page_table: root,
                context: KernelContext::new(user_main(self, task)),
            },
        );
        crate::log_info!("userinit: pid {}", pid);
        Ok(pid)
    }

    /// Starts a process whose body is kernel code. It is adopted by init
    /// when there is one, and exits when `entry` finishes.
    pub fn spawn<F, Fut>(&'static self, name: &str, entry: F) -> KernelResult<ProcessId>
    where
        F: FnOnce(&'static Kernel, SlotId) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let embryo = self.procs.allocate(&self.frames)?;
        let space = match AddressSpace::create(&self.frames, &self.kmap) {
            Ok(space) => space,
            Err(e) => {
                self.procs.abandon(embryo, &self.frames);
                return Err(e);
            }
        };

        let Embryo { slot, pid, kstack } = embryo;
        let kstack_top = kstack.top();
        let root = space.root();
        let task = Box::new(Task {
            slot,
            pid,
            size: 0,
            space,
            kstack,
            tf: TrapFrame::default(),
            program: None,
            files: Default::default(),
            cwd: self.fs().namei("/"),
            shm: ShmDescriptors::default(),
            name: String::from(name),
        });

        let body = async move {
            self.forkret();
            entry(self, slot).await;
            self.exit(task);
        };
        self.procs.publish(
            slot,
            kstack_top,
            Launch {
                parent: self.procs.init(),
                name: String::from(name),
                page_table: root,
                context: KernelContext::new(body),
            },
        );
        Ok(pid)
    }

    /// Copies `parent` into a new process that returns 0 from the same
    /// system call. Nothing of the child survives a failure.
    pub fn fork(&'static self, parent: &mut Task) -> KernelResult<ProcessId> {
        let embryo = self.procs.allocate(&self.frames)?;
        let space = match parent.space.duplicate(&self.frames, &self.kmap, parent.size) {
            Ok(space) => space,
            Err(e) => {
                self.procs.abandon(embryo, &self.frames);
                crate::log_warn!("fork: pid {}: {}", parent.pid, e);
                return Err(e);
            }
        };

        let Embryo { slot, pid, kstack } = embryo;
        let kstack_top = kstack.top();
        let root = space.root();
        let mut tf = parent.tf;
        tf.eax = 0;
        let child = Box::new(Task {
            slot,
            pid,
            size: parent.size,
            space,
            kstack,
            tf,
            program: parent.program,
            files: parent.files.clone(),
            cwd: parent.cwd.clone(),
            shm: ShmDescriptors::default(),
            name: parent.name.clone(),
        });

        self.procs.publish(
            slot,
            kstack_top,
            Launch {
                parent: Some(parent.slot),
                name: parent.name.clone(),
                page_table: root,
                context: KernelContext::new(user_main(self, child)),
            },
        );
        Ok(pid)
    }

    /// Turns the calling process into a zombie. Its memory and kernel
    /// stack stay behind until the parent reaps it; its children go to
    /// init. The caller must return to the scheduler straight after.
    pub fn exit(&self, mut task: Box<Task>) {
        let slot = task.slot;
        if self.procs.init() == Some(slot) {
            panic!("init exiting");
        }

        for fd in task.files.iter_mut() {
            if let Some(f) = fd.take() {
                file::close(self.fs(), f);
            }
        }
        self.shm_close_all(&mut task);
        if let Some(cwd) = task.cwd.take() {
            self.fs().begin_op();
            self.fs().iput(cwd);
            self.fs().end_op();
        }

        let Task {
            pid, kstack, space, ..
        } = *task;

        let mut t = self.procs.lock();
        if let Some(parent) = t.get(slot).parent {
            t.wakeup(Channel::Process(parent));
        }

        let init = t.init;
        let mut orphaned_zombie = false;
        for p in t.procs.iter_mut() {
            if p.state != ProcessState::Unused && p.parent == Some(slot) {
                p.parent = init;
                orphaned_zombie |= p.state == ProcessState::Zombie;
            }
        }
        if let (true, Some(init)) = (orphaned_zombie, init) {
            t.wakeup(Channel::Process(init));
        }

        t.get_mut(slot).remains = Some(Remains { kstack, space });
        t.transition(slot, ProcessState::Zombie);
        crate::log_info!("exit: pid {}", pid);
        self.sched(t, slot);
    }

    /// Waits for a child to exit, reaps it and returns its pid.
    pub async fn wait(&self, slot: SlotId) -> KernelResult<ProcessId> {
        loop {
            let sleep = {
                let mut t = self.procs.lock();
                let mut have_kids = false;
                let mut zombie = None;
                for (i, p) in t.procs.iter().enumerate() {
                    if p.state == ProcessState::Unused || p.parent != Some(slot) {
                        continue;
                    }
                    have_kids = true;
                    if p.state == ProcessState::Zombie {
                        zombie = Some(SlotId(i));
                        break;
                    }
                }

                if let Some(child) = zombie {
                    let p = t.get_mut(child);
                    let pid = p.pid;
                    let remains = p.remains.take();
                    t.release(child);
                    if let Some(Remains { kstack, space }) = remains {
                        kstack.release(&self.frames);
                        space.destroy(&self.frames);
                    }
                    return Ok(pid);
                }
                if !have_kids {
                    return Err(KernelError::NoChildren);
                }
                if t.get(slot).killed {
                    return Err(KernelError::Killed);
                }
                self.sleep_locked(slot, Channel::Process(slot), t)
            };
            sleep.await;
        }
    }

    /// Grows or shrinks user memory by `delta` bytes and returns the old
    /// size. The heap never reaches the shared-memory windows.
    pub fn grow_process(&self, task: &mut Task, delta: i32) -> KernelResult<usize> {
        let old = task.size;
        let new = if delta >= 0 {
            old.checked_add(delta as usize).ok_or(KernelError::OutOfRange)?
        } else {
            old.checked_sub(delta.unsigned_abs() as usize)
                .ok_or(KernelError::InvalidArgument)?
        };

        if new > old {
            if new > SHM_BASE {
                return Err(KernelError::OutOfRange);
            }
            task.space.grow(&self.frames, old, new).map_err(|e| {
                crate::log_warn!("growproc: pid {} out of memory at {:#x}", task.pid, old);
                e
            })?;
        } else if new < old {
            task.space.shrink(&self.frames, old, new);
        }
        task.size = new;
        self.reload_address_space(task.slot);
        Ok(old)
    }

    /// Reinstalls the page table of `slot` on the CPU running it so the
    /// hardware drops stale translations.
    fn reload_address_space(&self, slot: SlotId) {
        let t = self.procs.lock();
        let p = t.get(slot);
        if let (Some(cpu), Some(root), Some(top)) = (p.cpu, p.page_table, p.kstack_top) {
            self.platform().switch_uvm(cpu, root, top);
        }
    }

    /// Marks `pid` killed. It exits the next time it crosses the user
    /// boundary or wakes in an interruptible wait.
    pub fn kill(&self, pid: ProcessId) -> KernelResult<()> {
        self.procs.kill(pid)?;
        crate::log_info!("kill: pid {}", pid);
        Ok(())
    }

    /// Runs once per process, the first time it is scheduled. The very
    /// first one brings up the file system, which may sleep and so cannot
    /// run from boot.
    pub(crate) fn forkret(&self) {
        self.fs_ready.call_once(|| self.fs().init());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use crate::kernel::testing;
    use crate::memory::UserMemory;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// Waits until it has no children left.
    async fn reap_all(k: &'static Kernel, slot: SlotId) -> Vec<ProcessId> {
        let mut reaped = Vec::new();
        while let Ok(pid) = k.wait(slot).await {
            reaped.push(pid);
        }
        reaped
    }

    fn idle(_: &mut TrapFrame, _: &mut UserMemory<'_>) {}

    #[test]
    fn wait_without_children_fails_at_once() {
        let k = testing::kernel(1, 32);
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        k.spawn("lonely", move |k, slot| async move {
            *s.lock() = Some(k.wait(slot).await);
        })
        .unwrap();
        k.scan(0);
        assert_eq!(*seen.lock(), Some(Err(KernelError::NoChildren)));
    }

    #[test]
    fn parent_reaps_children_and_pids_are_not_reused() {
        let k = testing::kernel(1, 64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let parent = k
            .spawn("parent", move |k, slot| async move {
                let first = k.spawn_child(slot, "c1");
                *s.lock() = reap_all(k, slot).await;
                let second = k.spawn_child(slot, "c2");
                s.lock().push(first);
                let more = reap_all(k, slot).await;
                s.lock().extend(more);
                s.lock().push(second);
            })
            .unwrap();
        for _ in 0..8 {
            k.scan(0);
        }
        let seen = seen.lock().clone();
        assert_eq!(seen, [ProcessId(2), ProcessId(2), ProcessId(3), ProcessId(3)]);
        assert_eq!(parent, ProcessId(1));
        // Only the parent itself remains, as a zombie with no parent.
        let left = k.procs.snapshot();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].state, ProcessState::Zombie);
    }

    #[test]
    fn exit_wakes_a_waiting_parent() {
        let k = testing::kernel(1, 64);
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let parent = k
            .spawn("parent", move |k, slot| async move {
                let o2 = o.clone();
                k.spawn_child_with(slot, "child", move |k, slot| async move {
                    k.yield_now(slot).await;
                    o2.lock().push("child exits");
                });
                o.lock().push("parent waits");
                let r = k.wait(slot).await;
                assert!(r.is_ok());
                o.lock().push("parent reaped");
            })
            .unwrap();
        k.scan(0);
        assert_eq!(k.procs.state_of(parent), Some(ProcessState::Sleeping));
        k.scan(0);
        k.scan(0);
        assert_eq!(*order.lock(), ["parent waits", "child exits", "parent reaped"]);
    }

    #[test]
    fn orphans_go_to_init() {
        let k = testing::kernel(1, 64);
        k.userinit(idle, &[]).unwrap();
        let grandchild = Arc::new(Mutex::new(None));
        let g = grandchild.clone();
        k.spawn("middle", move |k, slot| async move {
            *g.lock() = Some(k.spawn_child_with(slot, "orphan", |k, slot| async move {
                k.yield_now(slot).await;
            }));
        })
        .unwrap();
        // Keep init from running so the table can be inspected.
        {
            let mut t = k.procs.lock();
            let init = t.init.unwrap();
            t.transition(init, ProcessState::Running);
        }
        k.scan(0);
        let orphan = grandchild.lock().unwrap();
        let info = k.procs.snapshot().into_iter().find(|i| i.pid == orphan).unwrap();
        assert_eq!(info.parent, Some(ProcessId(1)));
    }

    #[test]
    fn waiting_init_reaps_an_orphaned_zombie() {
        let k = testing::kernel(1, 96);
        let grandchild = Arc::new(Mutex::new(None));
        let g = grandchild.clone();
        // Parentless, so nothing reaps it once it exits.
        k.spawn("middle", move |k, slot| async move {
            *g.lock() = Some(k.spawn_child(slot, "grandchild"));
            k.yield_now(slot).await;
        })
        .unwrap();
        let init = k
            .userinit(crate::init::init_program, crate::init::INITCODE)
            .unwrap();
        // A child that outlives the test keeps init blocked in wait.
        let keeper = k
            .spawn("keeper", |k, slot| async move {
                let _ = k.sleep_ticks(slot, 1_000_000).await;
            })
            .unwrap();

        k.scan(0);
        let gc = grandchild.lock().unwrap();
        assert_eq!(k.procs.state_of(gc), Some(ProcessState::Zombie));
        assert_eq!(k.procs.state_of(init), Some(ProcessState::Sleeping));

        for _ in 0..3 {
            k.scan(0);
        }
        assert_eq!(k.procs.state_of(gc), None);
        assert_eq!(k.procs.state_of(init), Some(ProcessState::Sleeping));
        assert_eq!(k.procs.state_of(keeper), Some(ProcessState::Sleeping));
    }

    #[test]
    fn fork_failure_leaves_nothing_behind() {
        let k = testing::kernel(1, 64);
        let before = k.frames.stats();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        k.spawn("forker", move |k, slot| async move {
            let mut task = k.test_task(slot, 2 * PAGE_SIZE);
            // Soak up every frame except one: enough for the kernel stack,
            // not for the page directory.
            let mut hog = Vec::new();
            while let Some(frame) = k.frames.allocate_frame() {
                hog.push(frame);
            }
            k.frames.deallocate_frame(hog.pop().unwrap());
            *s.lock() = Some(k.fork(&mut task));
            for frame in hog {
                k.frames.deallocate_frame(frame);
            }
            k.release_test_task(task);
        })
        .unwrap();
        k.scan(0);
        assert_eq!(*seen.lock(), Some(Err(KernelError::OutOfMemory)));
        // Only the spawned process's own leftovers are still out.
        let zombie_frames = k.frames.stats().outstanding() - before.outstanding();
        assert_eq!(zombie_frames, 1 + k.empty_space_cost());
        assert_eq!(k.procs.snapshot().len(), 1);
    }

    #[test]
    fn sbrk_returns_the_old_size() {
        let k = testing::kernel(1, 64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        k.spawn("heap", move |k, slot| async move {
            let mut task = k.test_task(slot, PAGE_SIZE);
            s.lock().push(k.grow_process(&mut task, 5000));
            s.lock().push(k.grow_process(&mut task, -5000));
            s.lock().push(k.grow_process(&mut task, -(2 * PAGE_SIZE as i32)));
            s.lock().push(k.grow_process(&mut task, SHM_BASE as i32));
            k.release_test_task(task);
        })
        .unwrap();
        k.scan(0);
        assert_eq!(
            *seen.lock(),
            [
                Ok(PAGE_SIZE),
                Ok(PAGE_SIZE + 5000),
                Err(KernelError::InvalidArgument),
                Err(KernelError::OutOfRange),
            ]
        );
    }

    #[test]
    fn first_process_brings_up_the_file_system() {
        let rig = testing::rig(1, 32);
        assert!(!rig.fs.is_ready());
        rig.kernel.spawn("first", |_, _| async {}).unwrap();
        rig.kernel.scan(0);
        assert!(rig.fs.is_ready());
    }

    #[test]
    fn exit_releases_the_working_directory() {
        let rig = testing::rig(1, 32);
        let fs: &MemFs = &rig.fs;
        rig.kernel.spawn("cwd", |_, _| async {}).unwrap();
        assert_eq!(fs.root_refs(), 1);
        rig.kernel.scan(0);
        assert_eq!(fs.root_refs(), 0);
        assert_eq!(fs.stats().outstanding, 0);
    }

    #[test]
    #[should_panic(expected = "init exiting")]
    fn init_may_not_exit() {
        fn quit(tf: &mut TrapFrame, _: &mut UserMemory<'_>) {
            tf.syscall(crate::syscalls::SYS_EXIT, &[]);
        }
        let k = testing::kernel(1, 32);
        k.userinit(quit, &[]).unwrap();
        k.scan(0);
    }

    #[test]
    #[should_panic(expected = "init already exists")]
    fn there_is_only_one_init() {
        let k = testing::kernel(1, 32);
        k.userinit(idle, &[]).unwrap();
        let _ = k.userinit(idle, &[]);
    }

    impl Kernel {
        /// Spawns a kernel-task child of `parent` that exits at once.
        fn spawn_child(&'static self, parent: SlotId, name: &str) -> ProcessId {
            self.spawn_child_with(parent, name, |_, _| async {})
        }

        fn spawn_child_with<F, Fut>(&'static self, parent: SlotId, name: &str, entry: F) -> ProcessId
        where
            F: FnOnce(&'static Kernel, SlotId) -> Fut + Send + 'static,
            Fut: Future<Output = ()> + Send + 'static,
        {
            let pid = self.spawn(name, entry).unwrap();
            let mut t = self.procs.lock();
            let child = t.find(pid).unwrap();
            t.get_mut(child).parent = Some(parent);
            pid
        }

        /// A throwaway user-side task that borrows `slot`'s identity.
        fn test_task(&self, slot: SlotId, size: usize) -> Box<Task> {
            let mut space = AddressSpace::create(&self.frames, &self.kmap).unwrap();
            if size > 0 {
                space.grow(&self.frames, 0, size).unwrap();
            }
            let t = self.procs.lock();
            let p = t.get(slot);
            Box::new(Task {
                slot,
                pid: p.pid,
                size,
                space,
                kstack: crate::scheduler::KernelStack::allocate(&self.frames).unwrap(),
                tf: TrapFrame::default(),
                program: Some(idle),
                files: Default::default(),
                cwd: None,
                shm: ShmDescriptors::default(),
                name: p.name.clone(),
            })
        }

        fn release_test_task(&self, task: Box<Task>) {
            let Task { space, kstack, .. } = *task;
            space.destroy(&self.frames);
            kstack.release(&self.frames);
        }

        /// Frames an address space with only the kernel half mapped holds.
        fn empty_space_cost(&self) -> usize {
            let before = self.frames.stats().outstanding();
            let space = AddressSpace::create(&self.frames, &self.kmap).unwrap();
            let cost = self.frames.stats().outstanding() - before;
            space.destroy(&self.frames);
            cost
        }
    }
}
