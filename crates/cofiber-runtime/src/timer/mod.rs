//! Deadline-ordered timers
//!
//! # Architecture
//!
//! ```text
//!   TimerManager ──► Arc<TimerCore>
//!                       ├─ RwLock<TimerSet>
//!                       │     ├─ order:   BTreeSet<(deadline_ms, id)>
//!                       │     └─ entries: HashMap<id, Entry>
//!                       ├─ clock: Arc<dyn Clock>
//!                       └─ on_front: Option<Box<dyn Fn()>>   (reactor wakeup)
//!
//!   TimerHandle { id, Weak<TimerCore> }  ── cancel / refresh / reset
//! ```
//!
//! The `(deadline, id)` key gives a strict order in which two timers with
//! the same deadline never collide. Every mutation removes, edits and
//! re-inserts an entry under one write-lock acquisition.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use cofiber_core::TokenGuard;
use parking_lot::RwLock;
use tracing::warn;

use crate::config::RuntimeConfig;

/// Timer body. Shared because recurring timers fire more than once.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Called (outside the lock) when a new timer becomes the earliest one
pub type FrontHook = Box<dyn Fn() + Send + Sync + 'static>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct Entry {
    deadline: u64,
    period: u64,
    recurring: bool,
    callback: TimerCallback,
}

#[derive(Default)]
struct TimerSet {
    order: BTreeSet<(u64, u64)>,
    entries: HashMap<u64, Entry>,
    previous_ms: u64,
    /// Front hook already fired and not yet observed via `next_timeout`
    tickled: bool,
}

impl TimerSet {
    /// Insert and report whether the front hook should fire
    fn insert(&mut self, id: u64, entry: Entry) -> bool {
        let key = (entry.deadline, id);
        self.order.insert(key);
        self.entries.insert(id, entry);
        let at_front = self.order.first() == Some(&key) && !self.tickled;
        if at_front {
            self.tickled = true;
        }
        at_front
    }
}

struct TimerCore {
    set: RwLock<TimerSet>,
    clock: Arc<dyn Clock>,
    on_front: Option<FrontHook>,
    rollback_ms: u64,
}

impl TimerCore {
    fn notify_front(&self) {
        if let Some(hook) = &self.on_front {
            hook();
        }
    }
}

/// Owner of a set of timers
pub struct TimerManager {
    core: Arc<TimerCore>,
}

/// Handle to one timer; all operations return `false` once it is gone
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    core: Weak<TimerCore>,
}

impl TimerManager {
    /// System clock, no front hook
    pub fn new() -> Self {
        Self::with_parts(Arc::new(SystemClock), None)
    }

    /// System clock, calling `hook` whenever a timer lands at the front
    pub fn with_front_hook(hook: FrontHook) -> Self {
        Self::with_parts(Arc::new(SystemClock), Some(hook))
    }

    pub fn with_parts(clock: Arc<dyn Clock>, on_front: Option<FrontHook>) -> Self {
        let previous_ms = clock.now_ms();
        Self {
            core: Arc::new(TimerCore {
                set: RwLock::new(TimerSet { previous_ms, ..TimerSet::default() }),
                clock,
                on_front,
                rollback_ms: RuntimeConfig::global().rollback_ms,
            }),
        }
    }

    /// Fire `cb` after `delay_ms`, and every `delay_ms` after that if
    /// `recurring`
    pub fn add_timer<F>(&self, delay_ms: u64, cb: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(delay_ms, Arc::new(cb), recurring)
    }

    /// Like `add_timer`, but the callback is skipped once `guard` is no
    /// longer live
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
        self.add_timer(
            delay_ms,
            move || {
                if guard.is_live() {
                    cb();
                }
            },
            recurring,
        )
    }

    fn insert(&self, delay_ms: u64, callback: TimerCallback, recurring: bool) -> TimerHandle {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let deadline = self.core.clock.now_ms().saturating_add(delay_ms);
        let at_front = self.core.set.write().insert(
            id,
            Entry { deadline, period: delay_ms, recurring, callback },
        );
        if at_front {
            self.core.notify_front();
        }
        TimerHandle { id, core: Arc::downgrade(&self.core) }
    }

    /// Milliseconds until the earliest deadline (0 if already due), or
    /// `None` with no timers. Re-arms the front hook.
    pub fn next_timeout(&self) -> Option<u64> {
        let mut set = self.core.set.write();
        set.tickled = false;
        let &(deadline, _) = set.order.first()?;
        let now = self.core.clock.now_ms();
        Some(deadline.saturating_sub(now))
    }

    /// Pop every due timer and return their callbacks.
    ///
    /// Recurring timers are re-inserted at `now + period`. If the clock has
    /// jumped back by more than the rollback threshold, every timer counts
    /// as due.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = self.core.clock.now_ms();
        let mut set = self.core.set.write();
        if set.entries.is_empty() {
            return Vec::new();
        }

        let rollback = now < set.previous_ms.saturating_sub(self.core.rollback_ms);
        set.previous_ms = now;
        if rollback {
            warn!(now, "clock rolled back; expiring all timers");
        }

        let due: Vec<(u64, u64)> = if rollback {
            set.order.iter().copied().collect()
        } else {
            set.order.range(..=(now, u64::MAX)).copied().collect()
        };

        let mut callbacks = Vec::with_capacity(due.len());
        for key in due {
            set.order.remove(&key);
            let (_, id) = key;
            let Some(entry) = set.entries.get_mut(&id) else { continue };
            callbacks.push(Arc::clone(&entry.callback));
            if entry.recurring {
                entry.deadline = now.saturating_add(entry.period);
                let next = (entry.deadline, id);
                set.order.insert(next);
            } else {
                set.entries.remove(&id);
            }
        }
        callbacks
    }

    pub fn has_timer(&self) -> bool {
        !self.core.set.read().entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.core.set.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerHandle {
    /// Remove the timer; its callback will not run afterwards
    pub fn cancel(&self) -> bool {
        let Some(core) = self.core.upgrade() else { return false };
        let mut set = core.set.write();
        match set.entries.remove(&self.id) {
            Some(entry) => {
                set.order.remove(&(entry.deadline, self.id));
                true
            }
            None => false,
        }
    }

    /// Push the deadline out to `now + period`
    pub fn refresh(&self) -> bool {
        let Some(core) = self.core.upgrade() else { return false };
        let now = core.clock.now_ms();
        let mut set = core.set.write();
        let Some(entry) = set.entries.get_mut(&self.id) else { return false };
        let old = (entry.deadline, self.id);
        entry.deadline = now.saturating_add(entry.period);
        let new = (entry.deadline, self.id);
        set.order.remove(&old);
        set.order.insert(new);
        true
    }

    /// Change the period to `ms`.
    ///
    /// `from_now` restarts the period at the current time; otherwise the
    /// original start point is kept and only the period changes.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(core) = self.core.upgrade() else { return false };
        let now = core.clock.now_ms();
        let at_front = {
            let mut set = core.set.write();
            let Some(mut entry) = set.entries.remove(&self.id) else { return false };
            if entry.period == ms && !from_now {
                set.entries.insert(self.id, entry);
                return true;
            }
            set.order.remove(&(entry.deadline, self.id));
            let start = if from_now { now } else { entry.deadline.saturating_sub(entry.period) };
            entry.period = ms;
            entry.deadline = start.saturating_add(ms);
            set.insert(self.id, entry)
        };
        if at_front {
            core.notify_front();
        }
        true
    }

    /// Whether the timer is still scheduled
    pub fn is_active(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.set.read().entries.contains_key(&self.id))
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cofiber_core::CancellationToken;
    use std::sync::atomic::AtomicUsize;

    fn manual(start: u64) -> (Arc<ManualClock>, TimerManager) {
        let clock = Arc::new(ManualClock::new(start));
        let mgr = TimerManager::with_parts(clock.clone(), None);
        (clock, mgr)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (hits, move || { h.fetch_add(1, Ordering::SeqCst); })
    }

    fn fire(mgr: &TimerManager) -> usize {
        let cbs = mgr.list_expired();
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    #[test]
    fn test_fires_no_earlier_than_delay() {
        let (clock, mgr) = manual(1_000);
        let (hits, cb) = counter();
        mgr.add_timer(100, cb, false);

        clock.advance(99);
        assert_eq!(fire(&mgr), 0);
        assert_eq!(mgr.next_timeout(), Some(1));

        clock.advance(1);
        assert_eq!(fire(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timer());
        assert_eq!(mgr.next_timeout(), None);
    }

    #[test]
    fn test_equal_deadlines_do_not_collide() {
        let (clock, mgr) = manual(0);
        let (hits, cb) = counter();
        let cb = Arc::new(cb);
        for _ in 0..3 {
            let cb = Arc::clone(&cb);
            mgr.add_timer(10, move || cb(), false);
        }
        assert_eq!(mgr.len(), 3);
        clock.advance(10);
        assert_eq!(fire(&mgr), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancel_before_fire() {
        let (clock, mgr) = manual(0);
        let (hits, cb) = counter();
        let handle = mgr.add_timer(5, cb, false);
        assert!(handle.cancel());
        assert!(!handle.cancel());
        clock.advance(10);
        assert_eq!(fire(&mgr), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let (clock, mgr) = manual(0);
        let (hits, cb) = counter();
        let handle = mgr.add_timer(5, cb, false);
        clock.advance(5);
        assert_eq!(fire(&mgr), 1);
        assert!(!handle.cancel());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_racing_expiry_fires_at_most_once() {
        for _ in 0..200 {
            let (clock, mgr) = manual(0);
            let (hits, cb) = counter();
            let handle = mgr.add_timer(5, cb, false);
            clock.advance(5);

            let barrier = std::sync::Barrier::new(2);
            let cancelled = std::thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    fire(&mgr);
                });
                let canceller = s.spawn(|| {
                    barrier.wait();
                    handle.cancel()
                });
                canceller.join().unwrap()
            });

            // Exactly one side wins the entry
            let fired = hits.load(Ordering::SeqCst);
            assert!(fired <= 1);
            assert_eq!(fired == 1, !cancelled);
            assert!(!handle.cancel());
            assert_eq!(fire(&mgr), 0);
        }
    }

    #[test]
    fn test_recurring_period_counts_from_actual_fire() {
        let (clock, mgr) = manual(0);
        let (hits, cb) = counter();
        let handle = mgr.add_timer(100, cb, true);

        // fired late: next deadline is relative to the late fire time
        clock.set(250);
        assert_eq!(fire(&mgr), 1);
        assert_eq!(mgr.next_timeout(), Some(100));

        clock.set(350);
        assert_eq!(fire(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(handle.is_active());
        assert!(handle.cancel());
    }

    #[test]
    fn test_refresh_and_reset() {
        let (clock, mgr) = manual(0);
        let (_hits, cb) = counter();
        let handle = mgr.add_timer(100, cb, false);

        clock.set(60);
        assert!(handle.refresh());
        assert_eq!(mgr.next_timeout(), Some(100));

        // keep phase: start = 160 - 100 = 60, new deadline 60 + 30
        assert!(handle.reset(30, false));
        assert_eq!(mgr.next_timeout(), Some(30));

        // from now
        clock.set(70);
        assert!(handle.reset(30, true));
        assert_eq!(mgr.next_timeout(), Some(30));

        // same period without from_now is a no-op
        assert!(handle.reset(30, false));
        assert_eq!(mgr.next_timeout(), Some(30));

        assert!(handle.cancel());
        assert!(!handle.reset(10, true));
        assert!(!handle.refresh());
    }

    #[test]
    fn test_rollback_expires_everything() {
        let (clock, mgr) = manual(10 * 3_600_000);
        let (hits, cb) = counter();
        mgr.add_timer(60_000, cb, false);
        assert_eq!(fire(&mgr), 0);

        // two hours backwards
        clock.set(8 * 3_600_000);
        assert_eq!(fire(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_small_backward_step_is_not_rollback() {
        let (clock, mgr) = manual(10 * 3_600_000);
        let (_hits, cb) = counter();
        mgr.add_timer(60_000, cb, false);
        assert_eq!(fire(&mgr), 0);
        clock.set(10 * 3_600_000 - 1_000);
        assert_eq!(fire(&mgr), 0);
        assert!(mgr.has_timer());
    }

    #[test]
    fn test_front_hook_fires_once_until_observed() {
        let fronts = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fronts);
        let clock = Arc::new(ManualClock::new(0));
        let mgr = TimerManager::with_parts(
            clock,
            Some(Box::new(move || { f.fetch_add(1, Ordering::SeqCst); })),
        );

        mgr.add_timer(100, || {}, false);
        assert_eq!(fronts.load(Ordering::SeqCst), 1);

        // earlier again, but the previous front is not observed yet
        mgr.add_timer(50, || {}, false);
        assert_eq!(fronts.load(Ordering::SeqCst), 1);

        mgr.next_timeout();
        mgr.add_timer(10, || {}, false);
        assert_eq!(fronts.load(Ordering::SeqCst), 2);

        // not at the front
        mgr.next_timeout();
        mgr.add_timer(500, || {}, false);
        assert_eq!(fronts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_condition_timer_skipped_after_token_drop() {
        let (clock, mgr) = manual(0);
        let (hits, cb) = counter();
        let cb = Arc::new(cb);

        let live = CancellationToken::new();
        let c = Arc::clone(&cb);
        mgr.add_condition_timer(10, move || c(), live.guard(), false);

        let dead = CancellationToken::new();
        let c = Arc::clone(&cb);
        mgr.add_condition_timer(10, move || c(), dead.guard(), false);
        drop(dead);

        clock.advance(10);
        assert_eq!(fire(&mgr), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recurring_schedule_with_mid_course_reset() {
        let (clock, mgr) = manual(0);
        let (hits, cb) = counter();
        let handle = mgr.add_timer(1_000, cb, true);

        let mut now = 0;
        for round in 1..=10 {
            now += if round <= 5 { 1_000 } else { 2_000 };
            clock.set(now);
            assert_eq!(fire(&mgr), 1, "round {round}");
            if round == 5 {
                assert!(handle.reset(2_000, true));
            }
        }
        assert!(handle.cancel());
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }
}
