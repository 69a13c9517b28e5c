//! Sleep and wakeup.
//!
//! A sleeper takes the table lock before it lets go of the lock guarding its
//! condition, and holds it until it is marked SLEEPING. `wakeup` needs the
//! table lock too, so it either runs before the sleeper checked the
//! condition or after the sleeper is visibly asleep; it cannot fall in
//! between.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use spin::MutexGuard;

use super::table::TableGuard;
use super::task::{ProcessState, SlotId};
use crate::kernel::Kernel;

/// Rendezvous token. Two parties meet when they name equal channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// A parent waiting for one of its children to exit.
    Process(SlotId),
    /// The clock.
    Ticks,
    /// Anything else, by agreement between sleeper and waker.
    Token(u64),
}

/// Resolves once a sleeping process has been woken and scheduled again.
///
/// Returned by [`Kernel::sleep`] after the process is already marked
/// SLEEPING; await it straight away.
#[must_use = "a sleeping process must await its Sleep"]
pub struct Sleep<'a> {
    kernel: &'a Kernel,
    slot: SlotId,
    switched: bool,
}

impl Future for Sleep<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if !self.switched {
            self.switched = true;
            return Poll::Pending;
        }
        self.kernel.procs.lock().get_mut(self.slot).chan = None;
        Poll::Ready(())
    }
}

impl Kernel {
    /// Atomically releases `guard` and puts `slot` to sleep on `chan`. The
    /// caller re-takes its own lock after the returned future resolves and
    /// re-checks its condition.
    pub fn sleep<T: ?Sized>(&self, slot: SlotId, chan: Channel, guard: MutexGuard<'_, T>) -> Sleep<'_> {
        let table = self.procs.lock();
        drop(guard);
        self.park(table, slot, chan)
    }

    /// `sleep` for callers whose condition is guarded by the table lock.
    pub fn sleep_locked(&self, slot: SlotId, chan: Channel, table: TableGuard<'_>) -> Sleep<'_> {
        self.park(table, slot, chan)
    }

    fn park(&self, mut table: TableGuard<'_>, slot: SlotId, chan: Channel) -> Sleep<'_> {
        table.get_mut(slot).chan = Some(chan);
        table.transition(slot, ProcessState::Sleeping);
        self.sched(table, slot);
        Sleep {
            kernel: self,
            slot,
            switched: false,
        }
    }

    /// Wakes every process sleeping on `chan`.
    pub fn wakeup(&self, chan: Channel) -> usize {
        self.procs.lock().wakeup(chan)
    }
}
