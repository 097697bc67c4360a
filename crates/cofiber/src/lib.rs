//! # cofiber - stackful fibers for blocking-style network code
//!
//! Fibers are cooperatively scheduled onto a pool of worker threads. When
//! a fiber calls a socket function that would block, the call parks the
//! fiber on an epoll reactor and the worker moves on to other work.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cofiber::{hook, IoManager};
//!
//! fn main() -> cofiber::SchedResult<()> {
//!     cofiber::init_logging();
//!
//!     let iom = IoManager::new(2, false, "app")?;
//!     iom.schedule_fn(|| {
//!         hook::sleep(1);            // parks this fiber, not the thread
//!         cofiber::yield_now();      // back of the run queue
//!     });
//!     iom.add_timer(500, || tracing::info!("tick"), true);
//!     iom.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │         schedule_fn(), yield_now(), hook::read() ...        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Scheduler (run queue, affinity)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ idle
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │       Reactor: epoll_wait + self-pipe + TimerManager        │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ EAGAIN ─► add_event + yield
//! ┌─────────────────────────────────────────────────────────────┐
//! │         hook: read/write/connect/sleep interception         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Logging
//!
//! The runtime logs through `tracing` and never installs a subscriber.
//! Binaries can call [`init_logging`], which reads `COFIBER_LOG`.

// Re-export core types
pub use cofiber_core::{
    fatal, fatal_assert, CancellationToken, FiberId, FiberState, Interest, MemoryError,
    SchedError, SchedResult, ThreadId, TokenGuard,
};

// Re-export runtime types
pub use cofiber_runtime::{
    Callback, Clock, Driver, Fiber, IoManager, ManualClock, ParkingDriver, Reactor, RuntimeConfig,
    Scheduler, SystemClock, TimerCallback, TimerHandle, TimerManager, Work,
};

pub use cofiber_runtime::{config, hook, timer};

use tracing_subscriber::EnvFilter;

/// Env var holding the `EnvFilter` directives for [`init_logging`]
pub const LOG_ENV: &str = "COFIBER_LOG";

/// Install a fmt subscriber filtered by `COFIBER_LOG` (default `info`).
///
/// Safe to call more than once; only the first call installs anything.
/// Returns `false` if a global subscriber was already set.
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Reschedule the current fiber with affinity to `thread` and yield.
///
/// Does nothing outside a scheduler.
pub fn switch_to(thread: Option<ThreadId>) {
    if let Some(scheduler) = Scheduler::current() {
        scheduler.switch_to(thread);
    }
}

/// Re-queue the current fiber and yield the worker to other work.
///
/// Outside a scheduler this only switches back to the resumer.
pub fn yield_now() {
    Scheduler::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        assert!(!init_logging());
    }

    #[test]
    fn test_switch_to_outside_scheduler_is_noop() {
        assert!(Scheduler::current().is_none());
        switch_to(None);
    }

    #[test]
    fn test_yield_now_outside_scheduler_is_noop() {
        std::thread::spawn(yield_now).join().unwrap();
    }
}
