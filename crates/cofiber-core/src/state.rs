//! Fiber lifecycle state

use core::fmt;

/// State of a fiber
///
/// ```text
///   new/reset ──► Ready ──resume──► Running ──yield──► Ready
///                                      │
///                                      └──closure done──► Term ──reset──► Ready
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Suspended (or never started) and may be resumed
    Ready = 0,

    /// Currently executing on some thread
    Running = 1,

    /// Closure finished; only `reset` may bring it back
    Term = 2,
}

impl FiberState {
    /// Whether `resume` is legal in this state
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Term)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberState::Ready => "READY",
            FiberState::Running => "RUNNING",
            FiberState::Term => "TERM",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [FiberState::Ready, FiberState::Running, FiberState::Term] {
            assert_eq!(FiberState::from(u8::from(state)), state);
        }
    }

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Ready.is_resumable());
        assert!(!FiberState::Running.is_resumable());
        assert!(!FiberState::Term.is_resumable());
        assert!(FiberState::Term.is_terminated());
        assert_eq!(FiberState::Running.to_string(), "RUNNING");
    }
}
