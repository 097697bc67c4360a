//! Error types for the cofiber runtime
//!
//! Only operational failures live here. Invariant violations go through
//! [`fatal!`](crate::fatal) instead of being returned.

use nix::errno::Errno;
use thiserror::Error;

/// Result type for scheduler and reactor operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors surfaced to callers of the runtime
#[derive(Debug, Error)]
pub enum SchedError {
    /// `epoll_create1` failed
    #[error("epoll instance creation failed: {0}")]
    EpollCreate(#[source] Errno),

    /// `epoll_ctl` rejected a registration change
    #[error("epoll_ctl({op}) on fd {fd} with events {events:#x} failed: {source}")]
    EpollCtl {
        op: &'static str,
        fd: i32,
        events: u32,
        #[source]
        source: Errno,
    },

    /// The reactor's wakeup pipe could not be created
    #[error("tickle pipe creation failed: {0}")]
    Pipe(#[source] Errno),

    /// Fiber stack mapping failed
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    /// A worker thread could not be spawned
    #[error("failed to spawn worker thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// `start()` called twice
    #[error("scheduler `{0}` already started")]
    AlreadyStarted(String),

    /// Event registration from a thread with no scheduler to own the waiter
    #[error("no scheduler is available to own the waiter")]
    NoScheduler,

    /// Rejected configuration value
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl SchedError {
    /// The OS error behind this failure, if there is one
    pub fn errno(&self) -> Option<Errno> {
        match self {
            SchedError::EpollCreate(e) | SchedError::Pipe(e) => Some(*e),
            SchedError::EpollCtl { source, .. } => Some(*source),
            SchedError::Memory(m) => m.errno(),
            SchedError::Spawn { source, .. } => source.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }
}

/// Stack allocation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// mmap of the stack region failed
    #[error("mapping a {size}-byte stack failed: {errno}")]
    MapFailed { size: usize, errno: Errno },

    /// mprotect of the guard page failed
    #[error("guard page protection failed: {0}")]
    GuardFailed(Errno),

    /// Requested size below the minimum usable stack
    #[error("stack size {0} is below the minimum")]
    TooSmall(usize),
}

impl MemoryError {
    pub fn errno(&self) -> Option<Errno> {
        match self {
            MemoryError::MapFailed { errno, .. } => Some(*errno),
            MemoryError::GuardFailed(e) => Some(*e),
            MemoryError::TooSmall(_) => None,
        }
    }
}
