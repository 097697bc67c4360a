//! Readiness interest mask
//!
//! The bit values match `EPOLLIN` and `EPOLLOUT` so the reactor can hand
//! a mask straight to `epoll_ctl`.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign, Sub};

/// Set of I/O directions a waiter is interested in
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u32);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0x1);
    pub const WRITE: Interest = Interest(0x4);

    const ALL: u32 = Self::READ.0 | Self::WRITE.0;

    /// Keep only the READ/WRITE bits of a raw event mask
    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Interest(bits & Self::ALL)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    /// True for exactly READ or exactly WRITE
    #[inline]
    pub const fn is_single(self) -> bool {
        self.0 == Self::READ.0 || self.0 == Self::WRITE.0
    }

    /// Iterate the single directions contained in this mask, READ first
    pub fn iter(self) -> impl Iterator<Item = Interest> {
        [Interest::READ, Interest::WRITE]
            .into_iter()
            .filter(move |d| self.contains(*d))
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Interest;
    fn bitand(self, rhs: Interest) -> Interest {
        Interest(self.0 & rhs.0)
    }
}

impl Sub for Interest {
    type Output = Interest;
    fn sub(self, rhs: Interest) -> Interest {
        Interest(self.0 & !rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Interest::READ), self.contains(Interest::WRITE)) {
            (true, true) => f.write_str("READ|WRITE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (false, false) => f.write_str("NONE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_ops() {
        let both = Interest::READ | Interest::WRITE;
        assert!(both.contains(Interest::READ));
        assert!(both.contains(Interest::WRITE));
        assert_eq!(both - Interest::READ, Interest::WRITE);
        assert_eq!(both & Interest::WRITE, Interest::WRITE);
        assert!((both - both).is_empty());
        assert!(!Interest::READ.intersects(Interest::WRITE));
    }

    #[test]
    fn test_truncate_drops_foreign_bits() {
        // 0x8 | 0x10 are EPOLLERR | EPOLLHUP
        let mask = Interest::from_bits_truncate(0x1 | 0x8 | 0x10);
        assert_eq!(mask, Interest::READ);
    }

    #[test]
    fn test_single_and_iter() {
        assert!(Interest::READ.is_single());
        assert!(!(Interest::READ | Interest::WRITE).is_single());
        assert!(!Interest::NONE.is_single());
        let dirs: Vec<_> = (Interest::WRITE | Interest::READ).iter().collect();
        assert_eq!(dirs, vec![Interest::READ, Interest::WRITE]);
        assert_eq!(format!("{:?}", Interest::WRITE), "WRITE");
    }
}
