//! # cofiber-runtime
//!
//! Linux implementation of the cofiber runtime.
//!
//! This crate provides:
//! - Stackful fibers with hand-written context switching
//! - An M:N scheduler with a pluggable idle [`Driver`]
//! - Timers ordered by absolute deadline
//! - An epoll reactor that doubles as the scheduler's idle driver
//! - Syscall hooks that turn blocking socket calls into fiber suspensions

#[cfg(not(target_os = "linux"))]
compile_error!("cofiber-runtime needs epoll; only Linux is supported");

pub mod arch;
pub mod config;
pub mod fiber;
pub mod hook;
pub mod memory;
pub mod reactor;
pub mod scheduler;
pub mod timer;
pub mod tls;

// Re-exports
pub use config::RuntimeConfig;
pub use fiber::Fiber;
pub use reactor::{IoManager, Reactor};
pub use scheduler::{Callback, Driver, ParkingDriver, Scheduler, Work};
pub use timer::{Clock, ManualClock, SystemClock, TimerCallback, TimerHandle, TimerManager};

pub use cofiber_core::{
    CancellationToken, FiberId, FiberState, Interest, SchedError, SchedResult, ThreadId,
    TokenGuard,
};

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub(crate) use arch::x86_64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
