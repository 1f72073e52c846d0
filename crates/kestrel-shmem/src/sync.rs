//! Synchronization helpers with timeout support.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Waits on `cond` until `ready` holds or the absolute `deadline` passes.
///
/// The predicate is re-checked after every wake, so spurious wakeups are
/// harmless. Returns the final value of the predicate.
pub fn wait_until<T>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: Option<Instant>,
    mut ready: impl FnMut(&mut T) -> bool,
) -> bool {
    loop {
        if ready(guard) {
            return true;
        }
        match deadline {
            None => cond.wait(guard),
            Some(deadline) => {
                if cond.wait_until(guard, deadline).timed_out() {
                    return ready(guard);
                }
            }
        }
    }
}

/// Outcome of [`Latch::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The latch was set.
    Set,
    /// The timeout elapsed first.
    TimedOut,
}

/// A settable wakeup flag a worker sleeps on.
///
/// Setting an already set latch is a no-op; the sleeper resets it after
/// waking.
#[derive(Debug, Default)]
pub struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Creates an unset latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the latch and wakes every waiter.
    pub fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_all();
    }

    /// Clears the latch.
    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    /// Returns true if the latch is set.
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Blocks until the latch is set or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> WaitResult {
        let mut set = self.set.lock();
        if wait_until(&self.cond, &mut set, Some(Instant::now() + timeout), |s| *s) {
            WaitResult::Set
        } else {
            WaitResult::TimedOut
        }
    }
}
