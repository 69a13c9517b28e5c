use alloc::boxed::Box;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::task::noop_waker;

/// Saved kernel-side execution of a process.
///
/// A process runs by being polled once. It leaves the CPU by returning
/// `Pending` after it has recorded its new state under the table lock, or
/// `Ready` once it has become a zombie and will never run again.
pub struct KernelContext {
    entry: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl KernelContext {
    pub fn new(entry: impl Future<Output = ()> + Send + 'static) -> Self {
        KernelContext {
            entry: Box::pin(entry),
        }
    }

    /// Resumes the process until it next gives up the CPU.
    pub(crate) fn switch_to(&mut self) -> Poll<()> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        self.entry.as_mut().poll(&mut cx)
    }
}

impl fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("KernelContext")
    }
}
