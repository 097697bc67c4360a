//! M:N fiber scheduler
//!
//! # Architecture
//!
//! ```text
//!   schedule(work, affinity) ──► queue: Mutex<VecDeque<Task>>
//!                                    │
//!        ┌───────────────┬───────────┴───────────┐
//!        ▼               ▼                       ▼
//!   worker "name_0"  worker "name_1"  ...   caller thread (use_caller)
//!   run loop on its  run loop on its        run loop inside the root
//!   main fiber       main fiber             fiber, entered from stop()
//!        │
//!        ├─ Work::Fiber     → fiber.resume()
//!        ├─ Work::Callback  → reusable callback fiber
//!        └─ nothing to do   → idle fiber → Driver::idle()
//! ```
//!
//! What "idle" means is delegated to a [`Driver`]: the plain scheduler
//! parks on a condvar, the reactor blocks in `epoll_wait`.

mod parking;

pub use parking::ParkingDriver;

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use cofiber_core::{fatal, fatal_assert, FiberState, SchedError, SchedResult, ThreadId};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::config::RuntimeConfig;
use crate::fiber::Fiber;
use crate::tls;

/// Boxed one-shot task body
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A unit of schedulable work: a fiber to resume or a callback to run
pub enum Work {
    Fiber(Arc<Fiber>),
    Callback(Callback),
}

impl Work {
    /// Wrap a closure
    pub fn call<F>(f: F) -> Work
    where
        F: FnOnce() + Send + 'static,
    {
        Work::Callback(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Work {
    fn from(fiber: Arc<Fiber>) -> Work {
        Work::Fiber(fiber)
    }
}

impl From<Callback> for Work {
    fn from(cb: Callback) -> Work {
        Work::Callback(cb)
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Work::Fiber(fiber) => write!(f, "Work::Fiber({})", fiber.id()),
            Work::Callback(_) => f.write_str("Work::Callback"),
        }
    }
}

struct Task {
    work: Work,
    thread: Option<ThreadId>,
}

/// The overridable half of a scheduler
///
/// A driver decides how an idle worker waits and how a waiting worker is
/// woken. `idle` runs inside each worker's idle fiber and must return only
/// once `scheduler.stopping()` holds, yielding whenever new work may have
/// arrived.
pub trait Driver: Send + Sync + 'static {
    /// Wake one idle worker
    fn tickle(&self, scheduler: &Scheduler);

    /// Body of the idle fiber
    fn idle(&self, scheduler: &Arc<Scheduler>);

    /// Whether the scheduler may shut down now
    fn stopping(&self, scheduler: &Scheduler) -> bool {
        scheduler.base_stopping()
    }

    /// Type-erased handle for `Reactor::current()` style lookups
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Fiber scheduler over a pool of OS threads
pub struct Scheduler {
    name: String,
    driver: Arc<dyn Driver>,
    queue: Mutex<VecDeque<Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<ThreadId>>,
    /// Threads to spawn; excludes the caller in use_caller mode
    worker_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    stop_requested: AtomicBool,
    started: AtomicBool,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    root_thread: Option<ThreadId>,
}

impl Scheduler {
    /// Scheduler whose idle workers park on a condvar.
    ///
    /// With `use_caller`, the calling thread counts as one of `threads` and
    /// runs scheduled work from inside `stop()`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> SchedResult<Arc<Scheduler>> {
        let driver = Arc::new(ParkingDriver::new(RuntimeConfig::global().park_timeout));
        Scheduler::with_driver(threads, use_caller, name, driver)
    }

    /// Scheduler with a custom idle/wakeup strategy
    pub fn with_driver(
        threads: usize,
        use_caller: bool,
        name: &str,
        driver: Arc<dyn Driver>,
    ) -> SchedResult<Arc<Scheduler>> {
        if threads == 0 {
            return Err(SchedError::Config("scheduler needs at least one thread"));
        }

        let mut worker_count = threads;
        let mut root_thread = None;
        if use_caller {
            fatal_assert!(
                tls::current_scheduler().is_none(),
                "thread already belongs to a scheduler; cannot create `{}` with use_caller",
                name
            );
            worker_count -= 1;
            root_thread = Some(tls::thread_id());
        }

        let scheduler = Arc::new(Scheduler {
            name: name.to_string(),
            driver,
            queue: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            worker_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            root_fiber: Mutex::new(None),
            root_thread,
        });

        if let Some(tid) = root_thread {
            // Make sure the caller has a main fiber for the root to swap with
            let _ = Fiber::current();
            let weak: Weak<Scheduler> = Arc::downgrade(&scheduler);
            let root = Fiber::new(
                move || {
                    if let Some(s) = weak.upgrade() {
                        s.run();
                    }
                },
                0,
                false,
            )?;
            tls::set_current_scheduler(Some(&scheduler));
            tls::set_dispatch_fiber(&root);
            *scheduler.root_fiber.lock() = Some(root);
            scheduler.thread_ids.lock().push(tid);
        }

        debug!(scheduler = %scheduler.name, threads, use_caller, "scheduler created");
        Ok(scheduler)
    }

    /// The scheduler driving the calling thread
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::current_scheduler()
    }

    /// Spawn the worker threads
    pub fn start(self: &Arc<Self>) -> SchedResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SchedError::AlreadyStarted(self.name.clone()));
        }

        let mut workers = self.workers.lock();
        for i in 0..self.worker_count {
            let name = format!("{}_{}", self.name, i);
            let this = Arc::clone(self);
            let spawned = thread::Builder::new().name(name.clone()).spawn(move || this.run());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    error!(scheduler = %self.name, thread = %name, %source, "worker spawn failed");
                    // Let the threads already running wind down
                    self.stop_requested.store(true, Ordering::Release);
                    for _ in 0..workers.len() {
                        self.tickle();
                    }
                    return Err(SchedError::Spawn { name, source });
                }
            }
        }
        info!(scheduler = %self.name, workers = self.worker_count, use_caller = self.root_thread.is_some(), "scheduler started");
        Ok(())
    }

    /// Stop accepting idle time, drain remaining work and join the workers.
    ///
    /// Idempotent. In use_caller mode this must be called from the creating
    /// thread, which then runs queued work itself and leaves the scheduler
    /// before returning.
    pub fn stop(self: &Arc<Self>) {
        // The caller thread left the scheduler on its first stop
        if self.root_thread.is_some() && self.stop_requested() && self.root_fiber.lock().is_none() {
            trace!(scheduler = %self.name, "already stopped");
            return;
        }

        let on_self = tls::current_scheduler().is_some_and(|s| Arc::ptr_eq(&s, self));
        match self.root_thread {
            Some(_) => fatal_assert!(
                on_self,
                "scheduler `{}` must be stopped from the thread that created it",
                self.name
            ),
            None => fatal_assert!(
                !on_self,
                "scheduler `{}` cannot be stopped from one of its own workers",
                self.name
            ),
        }

        debug!(scheduler = %self.name, "stop requested");
        self.stop_requested.store(true, Ordering::Release);
        for _ in 0..self.worker_count {
            self.tickle();
        }

        let root = self.root_fiber.lock().take();
        if let Some(root) = root {
            self.tickle();
            if !self.stopping() && root.state() == FiberState::Ready {
                root.resume();
            }
            tls::set_current_scheduler(None);
            tls::clear_dispatch_fiber();
        }

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!(scheduler = %self.name, "worker thread panicked");
            }
        }
        info!(scheduler = %self.name, "scheduler stopped");
    }

    /// Queue work; `thread = None` lets any worker take it
    pub fn schedule(&self, work: impl Into<Work>, thread: Option<ThreadId>) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(Task { work: work.into(), thread });
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Queue a closure for any worker
    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Work::call(f), None);
    }

    /// Queue many items under one lock acquisition, tickling at most once
    pub fn schedule_batch<I>(&self, items: I)
    where
        I: IntoIterator<Item = Work>,
    {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            let before = queue.len();
            queue.extend(items.into_iter().map(|work| Task { work, thread: None }));
            was_empty && queue.len() > before
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Move the running fiber onto `thread` (or any thread) and yield.
    pub fn switch_to(self: &Arc<Self>, thread: Option<ThreadId>) {
        let here = tls::current_scheduler().is_some_and(|s| Arc::ptr_eq(&s, self));
        if here && (thread.is_none() || thread == Some(tls::thread_id())) {
            return;
        }
        self.schedule(Fiber::current(), thread);
        Fiber::yield_now();
    }

    /// Give up the worker and come back later.
    ///
    /// Re-queues the running fiber on its scheduler before yielding. Outside
    /// a scheduler this is a plain [`Fiber::yield_now`].
    pub fn yield_now() {
        if let Some(scheduler) = tls::current_scheduler() {
            if Fiber::in_fiber() {
                scheduler.schedule(Fiber::current(), None);
            }
        }
        Fiber::yield_now();
    }

    /// Per-thread dispatch loop
    fn run(self: &Arc<Self>) {
        let hook_before = tls::hook_enabled();
        tls::set_hook_enabled(true);
        tls::set_current_scheduler(Some(self));

        let me = tls::thread_id();
        if self.root_thread != Some(me) {
            let main = Fiber::current();
            tls::set_dispatch_fiber(&main);
            self.thread_ids.lock().push(me);
        }
        debug!(scheduler = %self.name, thread = me, "run loop entered");

        let weak = Arc::downgrade(self);
        let driver = Arc::clone(&self.driver);
        let idle_fiber = match Fiber::new(
            move || {
                if let Some(s) = weak.upgrade() {
                    driver.idle(&s);
                }
            },
            0,
            true,
        ) {
            Ok(f) => f,
            Err(e) => fatal!("scheduler `{}` cannot allocate an idle fiber: {}", self.name, e),
        };

        let mut callback_fiber: Option<Arc<Fiber>> = None;
        loop {
            let (next, tickle_me) = self.take_task(me);
            if tickle_me {
                self.tickle();
            }

            match next {
                Some(Work::Fiber(fiber)) => {
                    fiber.resume();
                    self.active.fetch_sub(1, Ordering::AcqRel);
                }
                Some(Work::Callback(cb)) => {
                    let fiber = match callback_fiber.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => match Fiber::new(cb, 0, true) {
                            Ok(f) => f,
                            Err(e) => {
                                error!(scheduler = %self.name, error = %e, "dropping callback: no fiber");
                                self.active.fetch_sub(1, Ordering::AcqRel);
                                continue;
                            }
                        },
                    };
                    fiber.resume();
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    // A callback that suspended is owned by whoever will wake
                    // it; it must have been handed to a waiter or re-queued
                    // before yielding, or dropping it here aborts.
                    if fiber.state() == FiberState::Term {
                        callback_fiber = Some(fiber);
                    }
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        debug!(scheduler = %self.name, thread = me, "idle fiber finished");
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::AcqRel);
                    idle_fiber.resume();
                    self.idle.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        tls::set_hook_enabled(hook_before);
        debug!(scheduler = %self.name, thread = me, "run loop exited");
    }

    /// Pop the first task this thread may run.
    ///
    /// Returns the work (if any) and whether another worker should be woken
    /// for entries this thread skipped or left behind.
    fn take_task(&self, me: ThreadId) -> (Option<Work>, bool) {
        let mut queue = self.queue.lock();
        let mut tickle_me = false;
        let mut i = 0;
        while i < queue.len() {
            let task = &queue[i];
            if task.thread.is_some_and(|t| t != me) {
                tickle_me = true;
                i += 1;
                continue;
            }
            if let Work::Fiber(fiber) = &task.work {
                if fiber.state() == FiberState::Term {
                    fatal!("scheduler `{}` queued terminated fiber {}", self.name, fiber.id());
                }
                if !fiber.is_resumable() {
                    // Still switching out on another thread
                    trace!(fiber = %fiber.id(), "skipping fiber in transit");
                    tickle_me = true;
                    i += 1;
                    continue;
                }
            }
            if let Some(task) = queue.remove(i) {
                self.active.fetch_add(1, Ordering::AcqRel);
                tickle_me |= i < queue.len();
                return (Some(task.work), tickle_me);
            }
        }
        (None, tickle_me)
    }

    #[inline]
    pub fn tickle(&self) {
        self.driver.tickle(self);
    }

    /// Whether the run loops may exit
    #[inline]
    pub fn stopping(&self) -> bool {
        self.driver.stopping(self)
    }

    /// Stop requested, queue drained, no task running
    pub fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active.load(Ordering::Acquire) == 0
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_queued_work(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel thread ids of every thread that has entered the run loop
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.thread_ids.lock().clone()
    }

    /// The installed driver, type-erased
    pub fn driver_any(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.driver).into_any()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire) && !self.stop_requested.load(Ordering::Acquire) {
            fatal!("scheduler `{}` dropped without stop()", self.name);
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("workers", &self.worker_count)
            .field("use_caller", &self.root_thread.is_some())
            .field("active", &self.active_count())
            .field("idle", &self.idle.load(Ordering::Relaxed))
            .finish()
    }
}
