//! A small multiprocessor on host threads: one thread per simulated CPU
//! running the scheduler loop, plus one driving the clock.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use quark::arch::sim::SimPlatform;
use quark::fs::MemFs;
use quark::{Kernel, KernelConfig};

pub struct Machine {
    pub kernel: &'static Kernel,
    pub fs: Arc<MemFs>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Machine {
    pub fn boot(ncpu: usize, pages: usize) -> Self {
        let platform: &'static SimPlatform =
            Box::leak(Box::new(SimPlatform::new(ncpu).with_idle(std::thread::yield_now)));
        let fs = Arc::new(MemFs::new());
        let config = KernelConfig::default().with_cpus(ncpu).with_pages(pages);
        let kernel = Kernel::boot(config, platform, fs.clone()).expect("boot");
        Machine {
            kernel,
            fs,
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        }
    }

    /// Starts every CPU and the clock.
    pub fn start(&mut self) {
        for cpu in 0..self.kernel.ncpu() {
            let kernel = self.kernel;
            let stop = self.stop.clone();
            self.threads
                .push(std::thread::spawn(move || kernel.run_scheduler_until(cpu, &stop)));
        }
        let kernel = self.kernel;
        let stop = self.stop.clone();
        self.threads.push(std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                kernel.clock_tick();
                std::thread::sleep(Duration::from_millis(1));
            }
        }));
    }

    /// Polls `cond` until it holds or `timeout` passes.
    pub fn wait_until(&self, timeout: Duration, mut cond: impl FnMut(&'static Kernel) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond(self.kernel) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond(self.kernel)
    }

    /// Stops every thread. A panic on any CPU fails the test here.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        for t in self.threads.drain(..) {
            t.join().expect("a cpu panicked");
        }
    }
}
