//! Per-thread runtime context
//!
//! Each OS thread carries one [`ThreadContext`]:
//! - the fiber currently running (weak, not an ownership edge)
//! - the thread's implicit main fiber (owned, created on first use)
//! - the dispatch fiber that scheduler-managed fibers swap back to
//! - the scheduler driving this thread (weak)
//! - the hook-enable flag
//!
//! Borrows are always released before a context switch happens.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use cofiber_core::ThreadId;

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

struct ThreadContext {
    current: RefCell<Weak<Fiber>>,
    main: RefCell<Option<Arc<Fiber>>>,
    dispatch: RefCell<Weak<Fiber>>,
    scheduler: RefCell<Weak<Scheduler>>,
    hook_enabled: Cell<bool>,
    tid: Cell<ThreadId>,
}

thread_local! {
    static CONTEXT: ThreadContext = ThreadContext {
        current: RefCell::new(Weak::new()),
        main: RefCell::new(None),
        dispatch: RefCell::new(Weak::new()),
        scheduler: RefCell::new(Weak::new()),
        hook_enabled: Cell::new(false),
        tid: Cell::new(0),
    };
}

/// Kernel thread id of the calling thread (cached)
#[inline]
pub fn thread_id() -> ThreadId {
    CONTEXT.with(|ctx| {
        let cached = ctx.tid.get();
        if cached != 0 {
            return cached;
        }
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as ThreadId;
        ctx.tid.set(tid);
        tid
    })
}

#[inline]
pub(crate) fn current_fiber() -> Option<Arc<Fiber>> {
    CONTEXT.with(|ctx| ctx.current.borrow().upgrade())
}

#[inline]
pub(crate) fn set_current_fiber(fiber: &Arc<Fiber>) {
    CONTEXT.with(|ctx| *ctx.current.borrow_mut() = Arc::downgrade(fiber));
}

#[inline]
pub(crate) fn main_fiber() -> Option<Arc<Fiber>> {
    CONTEXT.with(|ctx| ctx.main.borrow().clone())
}

pub(crate) fn set_main_fiber(fiber: Arc<Fiber>) {
    CONTEXT.with(|ctx| *ctx.main.borrow_mut() = Some(fiber));
}

#[inline]
pub(crate) fn dispatch_fiber() -> Option<Arc<Fiber>> {
    CONTEXT.with(|ctx| ctx.dispatch.borrow().upgrade())
}

pub(crate) fn set_dispatch_fiber(fiber: &Arc<Fiber>) {
    CONTEXT.with(|ctx| *ctx.dispatch.borrow_mut() = Arc::downgrade(fiber));
}

pub(crate) fn clear_dispatch_fiber() {
    CONTEXT.with(|ctx| *ctx.dispatch.borrow_mut() = Weak::new());
}

#[inline]
pub(crate) fn current_scheduler() -> Option<Arc<Scheduler>> {
    CONTEXT.with(|ctx| ctx.scheduler.borrow().upgrade())
}

pub(crate) fn set_current_scheduler(scheduler: Option<&Arc<Scheduler>>) {
    CONTEXT.with(|ctx| {
        *ctx.scheduler.borrow_mut() = scheduler.map(Arc::downgrade).unwrap_or_default();
    });
}

/// Whether hooked calls on this thread take the cooperative path
#[inline]
pub fn hook_enabled() -> bool {
    CONTEXT
        .try_with(|ctx| ctx.hook_enabled.get())
        .unwrap_or(false)
}

#[inline]
pub fn set_hook_enabled(enabled: bool) {
    let _ = CONTEXT.try_with(|ctx| ctx.hook_enabled.set(enabled));
}
