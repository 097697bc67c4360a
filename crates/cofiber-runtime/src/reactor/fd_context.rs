//! Per-descriptor readiness bookkeeping

use std::os::fd::RawFd;
use std::sync::Arc;

use cofiber_core::{fatal_assert, Interest};
use parking_lot::Mutex;

use crate::fiber::Fiber;
use crate::scheduler::{Callback, Scheduler, Work};

/// What to wake when an armed direction fires
pub(crate) enum Waiter {
    Fiber(Arc<Fiber>),
    Callback(Callback),
}

/// A waiter and the scheduler it goes back to
pub(crate) struct EventContext {
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) waiter: Waiter,
}

impl EventContext {
    fn fire(self) {
        match self.waiter {
            Waiter::Fiber(fiber) => self.scheduler.schedule(fiber, None),
            Waiter::Callback(cb) => self.scheduler.schedule(Work::Callback(cb), None),
        }
    }
}

/// Armed directions and their waiters. Only touched under `FdContext::state`.
#[derive(Default)]
pub(crate) struct FdState {
    pub(crate) events: Interest,
    read: Option<EventContext>,
    write: Option<EventContext>,
}

impl FdState {
    fn slot(&mut self, event: Interest) -> &mut Option<EventContext> {
        if event == Interest::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }

    /// Record a waiter for an unarmed direction
    pub(crate) fn arm(&mut self, event: Interest, ctx: EventContext) {
        self.events |= event;
        *self.slot(event) = Some(ctx);
    }

    /// Disarm `event` and drop its waiter without waking it
    pub(crate) fn disarm(&mut self, event: Interest) {
        self.events = self.events - event;
        self.slot(event).take();
    }

    /// Disarm `event` and hand its waiter back to its scheduler
    pub(crate) fn trigger(&mut self, fd: RawFd, event: Interest) {
        fatal_assert!(
            self.events.contains(event),
            "fd {} triggered for {:?} but armed for {:?}",
            fd,
            event,
            self.events
        );
        self.events = self.events - event;
        if let Some(ctx) = self.slot(event).take() {
            ctx.fire();
        }
    }
}

/// Reactor-side state for one descriptor.
///
/// Lives as long as the reactor; its address is the epoll user data.
pub(crate) struct FdContext {
    pub(crate) fd: RawFd,
    pub(crate) state: Mutex<FdState>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self { fd, state: Mutex::new(FdState::default()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn callback_ctx(scheduler: &Arc<Scheduler>, hits: &Arc<AtomicUsize>) -> EventContext {
        let h = Arc::clone(hits);
        EventContext {
            scheduler: Arc::clone(scheduler),
            waiter: Waiter::Callback(Box::new(move || { h.fetch_add(1, Ordering::SeqCst); })),
        }
    }

    #[test]
    fn test_trigger_clears_only_that_direction() {
        let scheduler = Scheduler::new(1, false, "fdctx").unwrap();
        scheduler.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let ctx = FdContext::new(7);
        {
            let mut state = ctx.state.lock();
            state.arm(Interest::READ, callback_ctx(&scheduler, &hits));
            state.arm(Interest::WRITE, callback_ctx(&scheduler, &hits));
            assert_eq!(state.events, Interest::READ | Interest::WRITE);

            state.trigger(ctx.fd, Interest::READ);
            assert_eq!(state.events, Interest::WRITE);

            state.disarm(Interest::WRITE);
            assert!(state.events.is_empty());
        }

        scheduler.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
