//! Idle parking for plain schedulers
//!
//! Without a reactor there is nothing to block on, so an idle worker parks
//! on a condition variable. `tickle` signals it; the timeout bounds how
//! long a missed signal can delay a worker.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{Driver, Scheduler};
use crate::fiber::Fiber;

/// Condvar-backed [`Driver`] used by [`Scheduler::new`]
pub struct ParkingDriver {
    lock: Mutex<()>,
    cond: Condvar,
    timeout: Duration,
}

impl ParkingDriver {
    pub fn new(timeout: Duration) -> Self {
        Self { lock: Mutex::new(()), cond: Condvar::new(), timeout }
    }
}

impl Driver for ParkingDriver {
    fn tickle(&self, _scheduler: &Scheduler) {
        let _guard = self.lock.lock();
        self.cond.notify_one();
    }

    fn idle(&self, scheduler: &Arc<Scheduler>) {
        while !scheduler.stopping() {
            {
                let mut guard = self.lock.lock();
                // Checked under the lock so a tickle cannot slip in between
                // the check and the wait.
                if !scheduler.has_queued_work() && !scheduler.stop_requested() {
                    self.cond.wait_for(&mut guard, self.timeout);
                }
            }
            Fiber::yield_now();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
