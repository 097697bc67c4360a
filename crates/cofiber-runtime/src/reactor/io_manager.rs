//! Scheduler + reactor bundle

use std::ops::Deref;
use std::sync::Arc;

use cofiber_core::{SchedResult, ThreadId};
use tracing::info;

use super::Reactor;
use crate::config::RuntimeConfig;
use crate::scheduler::{Scheduler, Work};

/// A started scheduler whose idle workers block in the reactor.
///
/// Derefs to [`Reactor`] for event and timer registration. Dropping it
/// stops the scheduler.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    reactor: Arc<Reactor>,
}

impl IoManager {
    /// Create and start an I/O scheduler with the global configuration
    pub fn new(threads: usize, use_caller: bool, name: &str) -> SchedResult<IoManager> {
        Self::with_config(threads, use_caller, name, RuntimeConfig::global())
    }

    pub fn with_config(
        threads: usize,
        use_caller: bool,
        name: &str,
        config: &RuntimeConfig,
    ) -> SchedResult<IoManager> {
        let reactor = Reactor::new(config)?;
        let scheduler = Scheduler::with_driver(threads, use_caller, name, reactor.clone())?;
        reactor.attach(&scheduler);
        scheduler.start()?;
        info!(scheduler = %name, threads, "io manager started");
        Ok(IoManager { scheduler, reactor })
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[inline]
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn schedule(&self, work: impl Into<Work>, thread: Option<ThreadId>) {
        self.scheduler.schedule(work, thread);
    }

    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule_fn(f);
    }

    /// Drain queued work, pending events and timers, then join the workers
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl Deref for IoManager {
    type Target = Reactor;

    fn deref(&self) -> &Reactor {
        &self.reactor
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("reactor", &self.reactor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::tls;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_use_caller_with_reactor() {
        std::thread::spawn(|| {
            let iom = IoManager::new(1, true, "iom-caller").unwrap();
            let caller = tls::thread_id();
            let seen = Arc::new(Mutex::new(Vec::new()));
            for _ in 0..4 {
                let s = Arc::clone(&seen);
                iom.schedule_fn(move || {
                    assert!(Reactor::current().is_some());
                    s.lock().unwrap().push(tls::thread_id());
                });
            }
            iom.stop();
            assert_eq!(*seen.lock().unwrap(), vec![caller; 4]);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_timer_inside_fiber_reschedules_it() {
        let iom = IoManager::new(2, false, "iom-sleep").unwrap();
        let rounds = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&rounds);
        iom.schedule_fn(move || {
            let reactor = Reactor::current().unwrap();
            let scheduler = Scheduler::current().unwrap();
            for _ in 0..3 {
                let fiber = Fiber::current();
                let s = Arc::clone(&scheduler);
                let slot = Mutex::new(Some(fiber));
                reactor.add_timer(
                    10,
                    move || {
                        if let Some(f) = slot.lock().unwrap().take() {
                            s.schedule(f, None);
                        }
                    },
                    false,
                );
                Fiber::yield_now();
                r.fetch_add(1, Ordering::SeqCst);
            }
        });
        drop(iom);
        assert_eq!(rounds.load(Ordering::SeqCst), 3);
    }
}
