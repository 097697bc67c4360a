//! Fiber and thread identifiers

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// OS thread id as reported by `gettid(2)`.
///
/// Scheduler task affinity is expressed as `Option<ThreadId>`; `None`
/// means any worker may run the task.
pub type ThreadId = i32;

/// Unique identifier for a fiber
///
/// Ids are handed out from a process-wide monotonic counter starting at 1.
/// Zero is reserved for "no fiber".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    /// Sentinel for "no fiber is running"
    pub const NONE: FiberId = FiberId(0);

    /// Allocate the next id
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> u64 {
        id.0
    }
}
