//! Stackful fibers
//!
//! A [`Fiber`] owns a guarded stack, a saved machine context and an entry
//! closure. `resume()` swaps the calling context out and the fiber in;
//! `Fiber::yield_now()` swaps the running fiber back out to whoever
//! resumed it.
//!
//! Which context a fiber swaps with depends on `runs_under_scheduler`:
//!
//! ```text
//!   runs_under_scheduler = true          runs_under_scheduler = false
//!
//!   dispatch fiber ◄──► task fiber       thread main fiber ◄──► fiber
//!   (worker main fiber, or the           (used by a scheduler's root
//!    caller's root fiber)                 fiber on the caller thread)
//! ```
//!
//! Every thread gets an implicit stackless main fiber the first time
//! `Fiber::current()` is called on it.

use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use cofiber_core::{fatal, fatal_assert, FiberId, FiberState, SchedResult};
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::arch::ExecutionContext;
use crate::config::RuntimeConfig;
use crate::current_arch::Registers;
use crate::memory::Stack;
use crate::tls;

type Entry = Box<dyn FnOnce() + Send + 'static>;

static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

/// A stackful, cooperatively scheduled unit of execution
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// Set while the fiber is between "state = Ready" and the end of its
    /// outgoing context switch; its saved registers are not usable yet.
    switching: AtomicBool,
    runs_under_scheduler: bool,
    stack: Option<Stack>,
    context: UnsafeCell<Registers>,
    entry: Mutex<Option<Entry>>,
}

// The context cell is only touched by the thread that is switching into or
// out of the fiber; `switching` orders hand-offs between threads.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a READY fiber that will run `f` on its own stack.
    ///
    /// `stack_size == 0` uses the configured default.
    pub fn new<F>(f: F, stack_size: usize, runs_under_scheduler: bool) -> SchedResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 { RuntimeConfig::global().stack_size } else { stack_size };
        let stack = Stack::new(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready.into()),
            switching: AtomicBool::new(false),
            runs_under_scheduler,
            stack: Some(stack),
            context: UnsafeCell::new(Registers::default()),
            entry: Mutex::new(Some(Box::new(f))),
        });
        fiber.prepare_context();
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        trace!(fiber = %fiber.id, stack = size, "fiber created");
        Ok(fiber)
    }

    /// The stackless fiber standing for a thread's original context
    fn new_main() -> Arc<Fiber> {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Running.into()),
            switching: AtomicBool::new(false),
            runs_under_scheduler: false,
            stack: None,
            context: UnsafeCell::new(Registers::default()),
            entry: Mutex::new(None),
        })
    }

    fn prepare_context(&self) {
        if let Some(stack) = &self.stack {
            // Only called while nobody else can observe the context: right
            // after construction, or on a TERM fiber being reset.
            unsafe {
                *self.context.get() = Registers::create_with_stack(
                    stack.top(),
                    fiber_main,
                    self as *const Fiber as usize,
                );
            }
        }
    }

    /// Reuse a finished fiber's stack for a new closure (TERM -> READY)
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        fatal_assert!(self.stack.is_some(), "fiber {} has no stack and cannot be reset", self.id);
        let state = self.state();
        fatal_assert!(
            state == FiberState::Term,
            "fiber {} reset in state {}",
            self.id,
            state
        );
        *self.entry.lock() = Some(Box::new(f));
        self.prepare_context();
        self.set_state(FiberState::Ready);
    }

    /// Switch into this fiber; returns when it yields or terminates.
    pub fn resume(self: &Arc<Self>) {
        // A fiber that was just re-queued by another thread may still be
        // saving its registers there.
        while self.switching.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        let state = self.state();
        fatal_assert!(
            state == FiberState::Ready,
            "fiber {} resumed in state {}",
            self.id,
            state
        );

        let back = self.return_target();
        tls::set_current_fiber(self);
        self.set_state(FiberState::Running);

        let suspend = back.context.get();
        let resume = self.context.get();
        unsafe { Registers::swap(suspend, resume) };

        // Back on `back`'s stack: the fiber's registers are saved now.
        self.switching.store(false, Ordering::Release);
    }

    /// Yield the currently running fiber back to whoever resumed it.
    ///
    /// Leaves the state READY, or TERM if the closure has finished.
    /// A no-op on a thread's main fiber.
    pub fn yield_now() {
        let Some(current) = tls::current_fiber() else { return };
        if current.stack.is_none() {
            return;
        }
        let state = current.state();
        fatal_assert!(
            state == FiberState::Running || state == FiberState::Term,
            "fiber {} yielded in state {}",
            current.id,
            state
        );

        let back = current.return_target();
        if state != FiberState::Term {
            current.switching.store(true, Ordering::Release);
            current.set_state(FiberState::Ready);
        }
        tls::set_current_fiber(&back);

        let suspend = current.context.get();
        let resume = back.context.get();
        // Both stay alive through their owners (the resumer and the thread
        // context); holding strong refs here would leak them if this stack
        // is never resumed.
        drop(current);
        drop(back);
        unsafe { Registers::swap(suspend, resume) };
    }

    /// The fiber running on this thread, creating the main fiber if needed
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = tls::current_fiber() {
            return fiber;
        }
        let main = Fiber::thread_main();
        tls::set_current_fiber(&main);
        main
    }

    /// Id of the running fiber, or `FiberId::NONE`
    pub fn current_id() -> FiberId {
        tls::current_fiber().map_or(FiberId::NONE, |f| f.id)
    }

    /// True when called from inside a stackful fiber
    pub fn in_fiber() -> bool {
        tls::current_fiber().is_some_and(|f| f.stack.is_some())
    }

    /// Number of fibers alive in the process, main fibers included
    pub fn total() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    fn thread_main() -> Arc<Fiber> {
        if let Some(main) = tls::main_fiber() {
            return main;
        }
        let main = Fiber::new_main();
        tls::set_main_fiber(Arc::clone(&main));
        main
    }

    fn return_target(&self) -> Arc<Fiber> {
        if self.runs_under_scheduler {
            if let Some(dispatch) = tls::dispatch_fiber() {
                return dispatch;
            }
        }
        Fiber::thread_main()
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: FiberState) {
        self.state.store(state.into(), Ordering::Release);
    }

    /// READY with its registers fully saved
    #[inline]
    pub fn is_resumable(&self) -> bool {
        self.state() == FiberState::Ready && !self.switching.load(Ordering::Acquire)
    }

    #[inline]
    pub fn runs_under_scheduler(&self) -> bool {
        self.runs_under_scheduler
    }

    #[inline]
    pub fn has_stack(&self) -> bool {
        self.stack.is_some()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        // Once started, a stackful fiber still holds live frames until it
        // terminates; freeing it here would leak them silently.
        let started = self.entry.get_mut().is_none();
        let state = self.state();
        if self.stack.is_some() && started && state != FiberState::Term {
            fatal!("fiber {} dropped while suspended in state {}", self.id, state);
        }
        trace!(fiber = %self.id, state = %self.state(), "fiber dropped");
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("runs_under_scheduler", &self.runs_under_scheduler)
            .field("stack", &self.stack)
            .finish()
    }
}

/// First frame of every stackful fiber
extern "C" fn fiber_main(raw: usize) -> ! {
    // The resumer holds a strong reference for as long as we run.
    let fiber = unsafe { &*(raw as *const Fiber) };

    let entry = fiber.entry.lock().take();
    if let Some(f) = entry {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            error!(fiber = %fiber.id, "fiber closure panicked: {}", panic_message(&payload));
        }
    }

    fiber.set_state(FiberState::Term);
    Fiber::yield_now();
    fatal!("terminated fiber {} was resumed", fiber.id)
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_resume_yield_sequence() {
        thread::spawn(|| {
            let steps = Arc::new(AtomicUsize::new(0));
            let s = Arc::clone(&steps);
            let fiber = Fiber::new(
                move || {
                    s.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_now();
                    s.fetch_add(1, Ordering::SeqCst);
                },
                0,
                false,
            )
            .unwrap();

            assert_eq!(fiber.state(), FiberState::Ready);
            fiber.resume();
            assert_eq!(steps.load(Ordering::SeqCst), 1);
            assert_eq!(fiber.state(), FiberState::Ready);

            fiber.resume();
            assert_eq!(steps.load(Ordering::SeqCst), 2);
            assert_eq!(fiber.state(), FiberState::Term);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_current_inside_and_outside() {
        thread::spawn(|| {
            let main_id = Fiber::current().id();
            assert!(!Fiber::in_fiber());

            let seen = Arc::new(Mutex::new(FiberId::NONE));
            let s = Arc::clone(&seen);
            let fiber = Fiber::new(
                move || {
                    assert!(Fiber::in_fiber());
                    *s.lock() = Fiber::current_id();
                },
                0,
                false,
            )
            .unwrap();
            fiber.resume();

            assert_eq!(*seen.lock(), fiber.id());
            assert_eq!(Fiber::current_id(), main_id);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_reset_reuses_stack() {
        thread::spawn(|| {
            let hits = Arc::new(AtomicUsize::new(0));
            let h = Arc::clone(&hits);
            let fiber = Fiber::new(move || { h.fetch_add(1, Ordering::SeqCst); }, 0, false).unwrap();
            fiber.resume();
            assert_eq!(fiber.state(), FiberState::Term);

            let first_id = fiber.id();
            let h = Arc::clone(&hits);
            fiber.reset(move || { h.fetch_add(10, Ordering::SeqCst); });
            assert_eq!(fiber.state(), FiberState::Ready);
            fiber.resume();

            assert_eq!(hits.load(Ordering::SeqCst), 11);
            assert_eq!(fiber.id(), first_id);
            assert_eq!(fiber.state(), FiberState::Term);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_panic_still_terminates() {
        thread::spawn(|| {
            let fiber = Fiber::new(|| panic!("boom"), 0, false).unwrap();
            fiber.resume();
            assert_eq!(fiber.state(), FiberState::Term);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_closure_dropped_at_termination() {
        thread::spawn(|| {
            let token = Arc::new(());
            let held = Arc::clone(&token);
            let fiber = Fiber::new(move || { let _keep = &held; }, 0, false).unwrap();
            assert_eq!(Arc::strong_count(&token), 2);
            fiber.resume();
            assert_eq!(Arc::strong_count(&token), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_unstarted_and_finished_fibers_drop_cleanly() {
        thread::spawn(|| {
            let before = Fiber::total();
            let token = Arc::new(());
            let held = Arc::clone(&token);
            let never_run = Fiber::new(move || { let _keep = &held; }, 0, false).unwrap();
            drop(never_run);
            assert_eq!(Arc::strong_count(&token), 1);

            let finished = Fiber::new(|| Fiber::yield_now(), 0, false).unwrap();
            finished.resume();
            finished.resume();
            assert_eq!(finished.state(), FiberState::Term);
            drop(finished);
            assert_eq!(Fiber::total(), before);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_nested_fibers_return_to_main() {
        // A fiber without a dispatch context swaps with the main fiber even
        // when it asked to run under a scheduler.
        thread::spawn(|| {
            let order = Arc::new(Mutex::new(Vec::new()));
            let o = Arc::clone(&order);
            let fiber = Fiber::new(
                move || {
                    o.lock().push("in");
                    Fiber::yield_now();
                    o.lock().push("again");
                },
                0,
                true,
            )
            .unwrap();
            fiber.resume();
            order.lock().push("main");
            fiber.resume();
            assert_eq!(*order.lock(), vec!["in", "main", "again"]);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_yield_on_main_is_noop() {
        thread::spawn(|| {
            let _ = Fiber::current();
            Fiber::yield_now();
            assert_eq!(Fiber::current().state(), FiberState::Running);
        })
        .join()
        .unwrap();
    }
}
