//! Cancellation token for guarding deferred callbacks
//!
//! A `CancellationToken` is owned by the operation being guarded. Anything
//! that may fire later (a timeout timer, a deferred wakeup) holds a
//! `TokenGuard` snapshot instead, and checks `is_live()` before acting.
//!
//! A guard is live while the token has not been cancelled *and* the token's
//! generation still equals the generation captured when the guard was
//! taken. Dropping the token cancels it, so a guard can never outlive the
//! operation it protects. `rearm()` lets one token protect successive
//! attempts: it clears the flag but bumps the generation, which kills every
//! guard handed out for earlier attempts.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

struct TokenState {
    cancelled: AtomicBool,
    generation: AtomicU64,
}

/// Owning side of a cancellation pair
///
/// Deliberately not `Clone`: there is exactly one owner, and its drop is
/// the cancellation signal.
pub struct CancellationToken {
    state: Arc<TokenState>,
}

/// Observing side of a cancellation pair
#[derive(Clone)]
pub struct TokenGuard {
    state: Arc<TokenState>,
    generation: u64,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Take a guard bound to the current generation
    pub fn guard(&self) -> TokenGuard {
        TokenGuard {
            state: Arc::clone(&self.state),
            generation: self.state.generation.load(Ordering::Acquire),
        }
    }

    /// Request cancellation. Idempotent.
    #[inline]
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.state.generation.load(Ordering::Acquire)
    }

    /// Start a new generation and clear the cancelled flag.
    ///
    /// Guards taken before this call stay dead.
    pub fn rearm(&self) {
        self.state.generation.fetch_add(1, Ordering::AcqRel);
        self.state.cancelled.store(false, Ordering::Release);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationToken {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl TokenGuard {
    /// True while the owning token is alive, uncancelled, and still on the
    /// generation this guard was taken from
    #[inline]
    pub fn is_live(&self) -> bool {
        !self.state.cancelled.load(Ordering::Acquire)
            && self.state.generation.load(Ordering::Acquire) == self.generation
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl core::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("generation", &self.generation())
            .finish()
    }
}

impl core::fmt::Debug for TokenGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TokenGuard")
            .field("generation", &self.generation)
            .field("live", &self.is_live())
            .finish()
    }
}
