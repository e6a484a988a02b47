//! Waiting for free events
//!
//! A blocking allocation that finds nothing releases the zone lock and waits
//! here until a free puts a block back at or above the order it needs.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{VmspaceError, VmspaceResult, MAX_ORDER};

/// What a waiting caller does between checks
///
/// This is the scheduler hook: a kernel can yield or sleep the current task
/// here. It is never called with a zone lock held.
pub trait Relax: Sync {
    fn relax(&self);
}

/// Busy-wait with a spin-loop hint
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinRelax;

impl Relax for SpinRelax {
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

pub(crate) static SPIN_RELAX: SpinRelax = SpinRelax;

/// Cancels a blocking allocation from another context
///
/// A timeout is obtained by cancelling the token from a timer.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
}

impl CancelToken {
    pub const fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Per-order free event counters of one zone
///
/// `counters[k]` moves whenever a block of order `k` or higher is put into a
/// bucket. Counters are bumped and sampled with the zone lock held, so a
/// waiter cannot miss a free that happens after it gave up the lock.
pub(crate) struct FreeEvents {
    counters: [AtomicUsize; MAX_ORDER],
}

impl FreeEvents {
    pub const fn new() -> Self {
        Self {
            counters: [const { AtomicUsize::new(0) }; MAX_ORDER],
        }
    }

    pub fn snapshot(&self, order: usize) -> usize {
        self.counters[order].load(Ordering::Acquire)
    }

    /// A block of `order` became free: wake waiters of every order up to it.
    pub fn notify(&self, order: usize) {
        let top = order.min(MAX_ORDER - 1);
        for counter in &self.counters[..=top] {
            counter.fetch_add(1, Ordering::Release);
        }
    }

    /// Wait until the counter for `order` moves past `seen`
    pub fn wait(
        &self,
        order: usize,
        seen: usize,
        relax: &dyn Relax,
        cancel: &CancelToken,
    ) -> VmspaceResult {
        loop {
            if self.counters[order].load(Ordering::Acquire) != seen {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(VmspaceError::Cancelled);
            }
            relax.relax();
        }
    }
}
