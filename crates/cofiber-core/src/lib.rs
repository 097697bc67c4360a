//! # cofiber-core
//!
//! Core types shared by the cofiber runtime.
//!
//! This crate contains no context-switching or reactor code. Everything
//! OS- or architecture-specific lives in `cofiber-runtime`.
//!
//! ## Modules
//!
//! - `id` - fiber and thread identifiers
//! - `state` - fiber lifecycle state
//! - `interest` - READ/WRITE readiness mask
//! - `cancel` - cancellation token with generation-checked guards
//! - `error` - error types

pub mod id;
pub mod state;
pub mod interest;
pub mod cancel;
pub mod error;

// Re-exports for convenience
pub use id::{FiberId, ThreadId};
pub use state::FiberState;
pub use interest::Interest;
pub use cancel::{CancellationToken, TokenGuard};
pub use error::{MemoryError, SchedError, SchedResult};

#[doc(hidden)]
pub use tracing as __tracing;

/// Log an invariant violation and abort the process.
///
/// Scheduler misuse (resuming a finished fiber, arming an event twice,
/// dropping a running scheduler) is a broken caller, not a runtime
/// condition, so there is nothing to unwind to.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        $crate::__tracing::error!($($arg)+);
        ::std::process::abort()
    }};
}

/// `assert!` counterpart of [`fatal!`].
#[macro_export]
macro_rules! fatal_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal!($($arg)+);
        }
    };
}
