//! epoll reactor
//!
//! # Architecture
//!
//! ```text
//!   fiber ── add_event(fd, READ) ──► FdContext[fd] ── epoll_ctl(ADD|MOD, ET)
//!     │                                   ▲
//!     └── yield                           │ user data = &FdContext
//!                                         │
//!   idle fiber (one per worker):     epoll_wait(min(next timer, max wait))
//!     ├─ tickle pipe  → drain
//!     ├─ fd ready     → trigger waiters → Scheduler::schedule
//!     └─ expired timers → Scheduler::schedule_batch
//! ```
//!
//! The reactor is the [`Driver`] of an I/O scheduler: idle workers block in
//! `epoll_wait`, and `tickle` writes a byte to a non-blocking self-pipe.
//! [`IoManager`] ties a reactor and its scheduler together.

mod fd_context;
mod io_manager;

pub use io_manager::IoManager;

use std::any::Any;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use cofiber_core::{fatal_assert, Interest, SchedError, SchedResult, TokenGuard};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use crate::config::{defaults, RuntimeConfig};
use crate::fiber::Fiber;
use crate::scheduler::{Callback, Driver, Scheduler, Work};
use crate::timer::{TimerHandle, TimerManager};

use fd_context::{EventContext, FdContext, Waiter};

/// epoll user data of the tickle pipe; every other entry is an `FdContext`
/// address, which is never null.
const TICKLE_TOKEN: u64 = 0;

/// epoll-backed readiness reactor with an embedded timer manager
pub struct Reactor {
    // Dropped before the pipe its front hook writes to
    timers: TimerManager,
    epoll: OwnedFd,
    tickle_rx: OwnedFd,
    tickle_tx: OwnedFd,
    /// Armed (fd, direction) pairs not yet triggered or cancelled
    pending: AtomicUsize,
    /// Indexed by fd. Entries are never removed, so their addresses stay
    /// valid as epoll user data for the reactor's lifetime.
    contexts: RwLock<Vec<Arc<FdContext>>>,
    scheduler: OnceLock<Weak<Scheduler>>,
    max_wait_ms: u64,
    max_events: usize,
}

impl Reactor {
    /// Create the epoll instance and tickle pipe.
    ///
    /// The reactor does nothing until it is installed as a scheduler's
    /// driver; [`IoManager::new`] does both.
    pub fn new(config: &RuntimeConfig) -> SchedResult<Arc<Reactor>> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(SchedError::EpollCreate(Errno::last()));
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(raw) };

        let (tickle_rx, tickle_tx) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(SchedError::Pipe)?;

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: TICKLE_TOKEN,
        };
        let rc = unsafe {
            libc::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, tickle_rx.as_raw_fd(), &mut ev)
        };
        if rc < 0 {
            return Err(SchedError::EpollCtl {
                op: "ADD",
                fd: tickle_rx.as_raw_fd(),
                events: (libc::EPOLLIN | libc::EPOLLET) as u32,
                source: Errno::last(),
            });
        }

        let contexts = (0..defaults::REACTOR_FD_TABLE as RawFd)
            .map(|fd| Arc::new(FdContext::new(fd)))
            .collect();

        let reactor = Arc::new_cyclic(|weak: &Weak<Reactor>| {
            let weak = weak.clone();
            let timers = TimerManager::with_front_hook(Box::new(move || {
                if let Some(reactor) = weak.upgrade() {
                    reactor.wake();
                }
            }));
            Reactor {
                timers,
                epoll,
                tickle_rx,
                tickle_tx,
                pending: AtomicUsize::new(0),
                contexts: RwLock::new(contexts),
                scheduler: OnceLock::new(),
                max_wait_ms: config.max_wait_ms,
                max_events: config.max_events.max(1),
            }
        });
        debug!(epoll = reactor.epoll.as_raw_fd(), "reactor created");
        Ok(reactor)
    }

    /// The reactor driving the calling thread's scheduler, if any
    pub fn current() -> Option<Arc<Reactor>> {
        Scheduler::current()?.driver_any().downcast::<Reactor>().ok()
    }

    /// Bind the scheduler that owns waiters registered from threads outside
    /// any scheduler. Only the first call has an effect.
    pub fn attach(&self, scheduler: &Arc<Scheduler>) {
        if self.scheduler.set(Arc::downgrade(scheduler)).is_err() {
            warn!(scheduler = %scheduler.name(), "reactor already attached");
        }
    }

    fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.get().and_then(Weak::upgrade)
    }

    /// Arm `event` on `fd` with edge-triggered notification.
    ///
    /// `callback = None` parks the calling fiber as the waiter; the caller
    /// is expected to yield right after. Arming a direction that is already
    /// armed is a fatal error.
    pub fn add_event(&self, fd: RawFd, event: Interest, callback: Option<Callback>) -> SchedResult<()> {
        fatal_assert!(fd >= 0, "add_event on negative fd {}", fd);
        fatal_assert!(event.is_single(), "add_event needs exactly one direction, got {:?}", event);

        let ctx = self.context(fd);
        let mut state = ctx.state.lock();
        fatal_assert!(
            !state.events.intersects(event),
            "fd {} already armed for {:?} (armed: {:?})",
            fd,
            event,
            state.events
        );

        let scheduler = Scheduler::current()
            .or_else(|| self.scheduler())
            .ok_or(SchedError::NoScheduler)?;
        let waiter = match callback {
            Some(cb) => Waiter::Callback(cb),
            None => {
                fatal_assert!(Fiber::in_fiber(), "add_event without callback outside a fiber (fd {})", fd);
                Waiter::Fiber(Fiber::current())
            }
        };

        let op = if state.events.is_empty() { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        self.ctl(op, &ctx, state.events | event)?;

        self.pending.fetch_add(1, Ordering::AcqRel);
        state.arm(event, EventContext { scheduler, waiter });
        trace!(fd, ?event, "event armed");
        Ok(())
    }

    /// Disarm without waking the waiter.
    ///
    /// Meant for callback waiters; dropping a parked fiber this way aborts.
    pub fn del_event(&self, fd: RawFd, event: Interest) -> bool {
        fatal_assert!(event.is_single(), "del_event needs exactly one direction, got {:?}", event);
        let Some(ctx) = self.existing(fd) else { return false };
        let mut state = ctx.state.lock();
        if !state.events.intersects(event) {
            return false;
        }
        let remaining = state.events - event;
        if self.ctl(Self::op_for(remaining), &ctx, remaining).is_err() {
            return false;
        }
        state.disarm(event);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Disarm and wake the waiter as if the event had fired
    pub fn cancel_event(&self, fd: RawFd, event: Interest) -> bool {
        fatal_assert!(event.is_single(), "cancel_event needs exactly one direction, got {:?}", event);
        let Some(ctx) = self.existing(fd) else { return false };
        let mut state = ctx.state.lock();
        if !state.events.intersects(event) {
            return false;
        }
        let remaining = state.events - event;
        if self.ctl(Self::op_for(remaining), &ctx, remaining).is_err() {
            return false;
        }
        state.trigger(fd, event);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Deregister `fd` and wake every waiter on it
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.existing(fd) else { return false };
        let mut state = ctx.state.lock();
        if state.events.is_empty() {
            return false;
        }
        if self.ctl(libc::EPOLL_CTL_DEL, &ctx, Interest::NONE).is_err() {
            return false;
        }
        for event in state.events.iter() {
            state.trigger(fd, event);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        true
    }

    /// Number of armed, untriggered events
    #[inline]
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// The timers fired from this reactor's idle loop
    #[inline]
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub fn add_timer<F>(&self, delay_ms: u64, cb: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(delay_ms, cb, recurring)
    }

    pub fn add_condition_timer<F>(
        &self,
        delay_ms: u64,
        cb: F,
        guard: TokenGuard,
        recurring: bool,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(delay_ms, cb, guard, recurring)
    }

    #[inline]
    fn op_for(remaining: Interest) -> libc::c_int {
        if remaining.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD }
    }

    fn ctl(&self, op: libc::c_int, ctx: &FdContext, events: Interest) -> SchedResult<()> {
        let bits = libc::EPOLLET as u32 | events.bits();
        let mut ev = libc::epoll_event { events: bits, u64: ctx as *const FdContext as u64 };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, ctx.fd, &mut ev) };
        if rc < 0 {
            let source = Errno::last();
            let op = match op {
                libc::EPOLL_CTL_ADD => "ADD",
                libc::EPOLL_CTL_MOD => "MOD",
                _ => "DEL",
            };
            error!(op, fd = ctx.fd, events = bits, %source, "epoll_ctl failed");
            return Err(SchedError::EpollCtl { op, fd: ctx.fd, events: bits, source });
        }
        Ok(())
    }

    /// Context for `fd`, growing the table to 1.5x the fd if needed
    fn context(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        if let Some(ctx) = self.contexts.read().get(idx) {
            return Arc::clone(ctx);
        }
        let mut table = self.contexts.write();
        if idx >= table.len() {
            let new_len = (idx + idx / 2).max(idx + 1);
            let start = table.len() as RawFd;
            table.extend((start..new_len as RawFd).map(|fd| Arc::new(FdContext::new(fd))));
            trace!(len = new_len, "fd context table grown");
        }
        Arc::clone(&table[idx])
    }

    fn existing(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().get(fd as usize).cloned()
    }

    /// Write one byte to the tickle pipe unless nobody is waiting on it
    fn wake(&self) {
        if let Some(scheduler) = self.scheduler() {
            if !scheduler.has_idle_threads() {
                return;
            }
        }
        self.write_tickle();
    }

    fn write_tickle(&self) {
        let rc = unsafe { libc::write(self.tickle_tx.as_raw_fd(), b"T".as_ptr().cast(), 1) };
        if rc < 0 {
            // A full pipe already guarantees a wakeup
            let err = Errno::last();
            if err != Errno::EAGAIN {
                error!(%err, "tickle write failed");
            }
        }
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(self.tickle_rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Hand the events reported for one descriptor to their waiters
    fn dispatch(&self, ctx: &FdContext, reported: u32) {
        let mut state = ctx.state.lock();
        let mut bits = reported;
        // Errors and hangups wake whatever is armed
        if reported & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            bits |= state.events.bits();
        }
        let fired = Interest::from_bits_truncate(bits) & state.events;
        if fired.is_empty() {
            trace!(fd = ctx.fd, events = reported, "event with nothing armed");
            return;
        }

        let remaining = state.events - fired;
        if self.ctl(Self::op_for(remaining), ctx, remaining).is_err() {
            return;
        }
        for event in fired.iter() {
            state.trigger(ctx.fd, event);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: u64) -> usize {
        let timeout = timeout_ms.min(i32::MAX as u64) as i32;
        loop {
            let rc = unsafe {
                libc::epoll_wait(self.epoll.as_raw_fd(), events.as_mut_ptr(), events.len() as i32, timeout)
            };
            if rc >= 0 {
                return rc as usize;
            }
            let err = Errno::last();
            if err != Errno::EINTR {
                error!(%err, "epoll_wait failed");
                return 0;
            }
        }
    }
}

impl Driver for Reactor {
    fn tickle(&self, scheduler: &Scheduler) {
        if scheduler.has_idle_threads() {
            self.write_tickle();
        }
    }

    fn idle(&self, scheduler: &Arc<Scheduler>) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];
        loop {
            if self.stopping(scheduler) {
                debug!(scheduler = %scheduler.name(), "reactor idle loop exiting");
                // Pass the wakeup on to the next idle worker
                self.write_tickle();
                break;
            }

            let timeout = if scheduler.has_queued_work() {
                0
            } else {
                self.timers.next_timeout().map_or(self.max_wait_ms, |ms| ms.min(self.max_wait_ms))
            };
            let n = self.wait(&mut events, timeout);

            let expired = self.timers.list_expired();
            if !expired.is_empty() {
                trace!(count = expired.len(), "timers expired");
                scheduler.schedule_batch(expired.into_iter().map(|cb| Work::call(move || cb())));
            }

            for ev in &events[..n] {
                // epoll_event is packed; copy the fields out
                let (reported, token) = (ev.events, ev.u64);
                if token == TICKLE_TOKEN {
                    self.drain_tickle();
                    continue;
                }
                // Table entries are never removed while the reactor lives
                let ctx = unsafe { &*(token as *const FdContext) };
                self.dispatch(ctx, reported);
            }

            Fiber::yield_now();
        }
    }

    fn stopping(&self, scheduler: &Scheduler) -> bool {
        self.timers.is_empty() && self.pending_event_count() == 0 && scheduler.base_stopping()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("epoll", &self.epoll.as_raw_fd())
            .field("pending", &self.pending_event_count())
            .field("timers", &self.timers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    fn flag_cb(flag: &Arc<AtomicBool>) -> Option<Callback> {
        let f = Arc::clone(flag);
        Some(Box::new(move || f.store(true, Ordering::SeqCst)))
    }

    #[test]
    fn test_cancel_event_wakes_parked_fiber_once() {
        let iom = IoManager::new(2, false, "cancel").unwrap();
        let (a, b) = socketpair();
        let woke = Arc::new(AtomicUsize::new(0));

        let w = Arc::clone(&woke);
        iom.schedule_fn(move || {
            let reactor = Reactor::current().unwrap();
            reactor.add_event(a, Interest::READ, None).unwrap();
            Fiber::yield_now();
            w.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(|| iom.pending_event_count() == 1));
        assert!(iom.cancel_event(a, Interest::READ));
        assert!(!iom.cancel_event(a, Interest::READ));
        assert!(wait_until(|| woke.load(Ordering::SeqCst) == 1));
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        assert_eq!(woke.load(Ordering::SeqCst), 1);
        close(a);
        close(b);
    }

    #[test]
    fn test_cancel_event_runs_callback_once() {
        let iom = IoManager::new(2, false, "cancel-cb").unwrap();
        let (a, b) = socketpair();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        iom.add_event(a, Interest::READ, Some(Box::new(move || { c.fetch_add(1, Ordering::SeqCst); })))
            .unwrap();
        assert_eq!(iom.pending_event_count(), 1);

        assert!(iom.cancel_event(a, Interest::READ));
        assert!(!iom.cancel_event(a, Interest::READ));
        assert_eq!(iom.pending_event_count(), 0);
        assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1));

        // The fd turning readable later must not fire the disarmed waiter
        unsafe { libc::write(b, b"x".as_ptr().cast(), 1) };
        std::thread::sleep(Duration::from_millis(30));
        assert!(!iom.cancel_event(a, Interest::READ));

        iom.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        close(a);
        close(b);
    }

    #[test]
    fn test_readable_fd_resumes_fiber() {
        let iom = IoManager::new(2, false, "readable").unwrap();
        let (a, b) = socketpair();
        let got = Arc::new(AtomicUsize::new(0));

        let g = Arc::clone(&got);
        iom.schedule_fn(move || {
            Reactor::current().unwrap().add_event(a, Interest::READ, None).unwrap();
            Fiber::yield_now();
            let mut buf = [0u8; 8];
            let n = unsafe { libc::read(a, buf.as_mut_ptr().cast(), buf.len()) };
            g.store(n as usize, Ordering::SeqCst);
        });

        assert!(wait_until(|| iom.pending_event_count() == 1));
        let rc = unsafe { libc::write(b, b"ping".as_ptr().cast(), 4) };
        assert_eq!(rc, 4);
        assert!(wait_until(|| got.load(Ordering::SeqCst) == 4));

        iom.stop();
        close(a);
        close(b);
    }

    #[test]
    fn test_callback_event_from_outside_scheduler() {
        let iom = IoManager::new(1, false, "callback").unwrap();
        let (a, b) = socketpair();
        let fired = Arc::new(AtomicBool::new(false));

        // A fresh socket is writable right away
        iom.add_event(a, Interest::WRITE, flag_cb(&fired)).unwrap();
        assert!(wait_until(|| fired.load(Ordering::SeqCst)));
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        close(a);
        close(b);
    }

    #[test]
    fn test_hangup_wakes_both_directions() {
        let iom = IoManager::new(2, false, "hangup").unwrap();
        let (a, b) = socketpair();

        // Fill the send buffer so WRITE is not ready on its own
        let chunk = [0u8; 4096];
        while unsafe { libc::write(a, chunk.as_ptr().cast(), chunk.len()) } > 0 {}

        let read_fired = Arc::new(AtomicBool::new(false));
        let write_fired = Arc::new(AtomicBool::new(false));
        iom.add_event(a, Interest::READ, flag_cb(&read_fired)).unwrap();
        iom.add_event(a, Interest::WRITE, flag_cb(&write_fired)).unwrap();
        assert_eq!(iom.pending_event_count(), 2);

        close(b);
        assert!(wait_until(|| read_fired.load(Ordering::SeqCst) && write_fired.load(Ordering::SeqCst)));
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        close(a);
    }

    #[test]
    fn test_del_event_drops_waiter() {
        let iom = IoManager::new(1, false, "del").unwrap();
        let (a, b) = socketpair();
        let fired = Arc::new(AtomicBool::new(false));

        iom.add_event(a, Interest::READ, flag_cb(&fired)).unwrap();
        assert!(iom.del_event(a, Interest::READ));
        assert!(!iom.del_event(a, Interest::READ));
        assert_eq!(iom.pending_event_count(), 0);

        unsafe { libc::write(b, b"x".as_ptr().cast(), 1) };
        std::thread::sleep(Duration::from_millis(30));
        assert!(!fired.load(Ordering::SeqCst));

        iom.stop();
        close(a);
        close(b);
    }

    #[test]
    fn test_cancel_all_and_large_fd() {
        let iom = IoManager::new(1, false, "cancel-all").unwrap();
        let (a, b) = socketpair();
        let high = unsafe { libc::fcntl(a, libc::F_DUPFD_CLOEXEC, 200) };
        assert!(high >= 200);

        let fired = Arc::new(AtomicBool::new(false));
        iom.add_event(high, Interest::READ, flag_cb(&fired)).unwrap();
        assert!(iom.cancel_all(high));
        assert!(!iom.cancel_all(high));
        assert!(wait_until(|| fired.load(Ordering::SeqCst)));

        iom.stop();
        close(high);
        close(a);
        close(b);
    }

    #[test]
    fn test_timer_wakes_blocked_worker() {
        let iom = IoManager::new(1, false, "timer").unwrap();
        // let the worker settle into epoll_wait
        std::thread::sleep(Duration::from_millis(20));

        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        let start = Instant::now();
        iom.add_timer(30, move || f.store(true, Ordering::SeqCst), false);
        assert!(wait_until(|| fired.load(Ordering::SeqCst)));
        assert!(start.elapsed() < Duration::from_millis(1000));

        iom.stop();
    }

    #[test]
    fn test_stop_waits_for_timers() {
        let iom = IoManager::new(2, false, "stop-timers").unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        iom.add_timer(50, move || f.store(true, Ordering::SeqCst), false);
        iom.stop();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unattached_reactor_has_no_owner() {
        let reactor = Reactor::new(RuntimeConfig::global()).unwrap();
        let (a, b) = socketpair();
        let fired = Arc::new(AtomicBool::new(false));
        let err = reactor.add_event(a, Interest::READ, flag_cb(&fired)).unwrap_err();
        assert!(matches!(err, SchedError::NoScheduler));
        assert_eq!(reactor.pending_event_count(), 0);
        assert!(Reactor::current().is_none());
        close(a);
        close(b);
    }
}
