//! Virtual time.
//!
//! Round, start, and finish numbers live on a wrapping 64-bit circle. Two values are only
//! compared through their signed difference, so ordering stays correct across wraparound as
//! long as the values being compared are less than half the circle apart.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in virtual time, in nanoseconds of service at full link bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VirtualTime(u64);

impl VirtualTime {
    pub const ZERO: VirtualTime = VirtualTime(0);

    pub const fn from_raw(raw: u64) -> VirtualTime {
        VirtualTime(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Signed distance from `other` to `self`.
    pub const fn since(self, other: VirtualTime) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }

    /// `self` lies strictly after `other`.
    pub const fn is_ahead_of(self, other: VirtualTime) -> bool {
        self.since(other) > 0
    }

    /// `self` lies at or after `other`.
    pub const fn is_at_or_after(self, other: VirtualTime) -> bool {
        self.since(other) >= 0
    }

    pub const fn wrapping_add(self, delta: u64) -> VirtualTime {
        VirtualTime(self.0.wrapping_add(delta))
    }

    pub const fn wrapping_sub(self, delta: u64) -> VirtualTime {
        VirtualTime(self.0.wrapping_sub(delta))
    }
}

impl fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_plain_away_from_the_wrap() {
        let a = VirtualTime::from_raw(10);
        let b = VirtualTime::from_raw(20);
        assert!(b.is_ahead_of(a));
        assert!(!a.is_ahead_of(b));
        assert!(!a.is_ahead_of(a));
        assert!(a.is_at_or_after(a));
        assert_eq!(b.since(a), 10);
        assert_eq!(a.since(b), -10);
    }

    #[test]
    fn ordering_survives_wraparound() {
        let before = VirtualTime::from_raw(u64::MAX - 5);
        let after = before.wrapping_add(10);
        assert_eq!(after.raw(), 4);
        assert!(after.is_ahead_of(before));
        assert!(!before.is_ahead_of(after));
        assert_eq!(after.since(before), 10);
        assert_eq!(after.wrapping_sub(10), before);
    }
}
