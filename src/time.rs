// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Monotonic time support.
//!
//! All timers are expressed as absolute deadlines internally (design notes
//! §9, "Time") and converted to durations only at arm time. Arithmetic
//! saturates so that `now > deadline` is always well defined without a
//! `REL_TIME_0` sentinel.

use std::time::Duration;

/// A monotonic instant, expressed in nanoseconds since an arbitrary epoch.
///
/// Not [`std::time::Instant`] because the dataplane's event loop and tests
/// both need to construct arbitrary instants deterministically (property
/// tests drive scenarios by literal millisecond offsets, see `spec.md` §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(u64);

impl Time {
    pub const ZERO: Time = Time(0);

    pub fn from_nanos(nanos: u64) -> Self {
        Time(nanos)
    }

    pub fn from_millis(millis: u64) -> Self {
        Time(millis.saturating_mul(1_000_000))
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Saturating forward step; never panics or wraps.
    pub fn saturating_add(self, d: Duration) -> Self {
        Time(self.0.saturating_add(d.as_nanos() as u64))
    }

    /// Signed distance `self - earlier`, saturating at zero if `self` is not
    /// actually later (mirrors the "floored at zero" language in §4.3/§4.8).
    pub fn saturating_since(self, earlier: Time) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Unsaturated signed distance in nanoseconds, used for the extended
    /// sequence number's nearest-rollover arithmetic and for histogram
    /// bucketing where negative durations are meaningful inputs (clamped by
    /// the caller).
    pub fn signed_diff_nanos(self, other: Time) -> i64 {
        self.0 as i64 - other.0 as i64
    }
}

/// An absolute deadline for a timer. `None` means "not armed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(pub Time);

impl Deadline {
    /// Computes an absolute deadline `base + offset - now`, floored so the
    /// deadline is never in the past relative to `now` by more than zero
    /// (the "floored at zero" idiom used throughout §4.8's entry actions).
    pub fn at_least_now(now: Time, base: Time, offset: Duration) -> Deadline {
        let target = base.saturating_add(offset);
        if target < now {
            Deadline(now)
        } else {
            Deadline(target)
        }
    }

    pub fn has_passed(self, now: Time) -> bool {
        now >= self.0
    }

    pub fn remaining(self, now: Time) -> Duration {
        self.0.saturating_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_since_floors_at_zero() {
        let earlier = Time::from_millis(100);
        let later = Time::from_millis(50);
        assert_eq!(later.saturating_since(earlier), Duration::ZERO);
    }

    #[test]
    fn deadline_at_least_now_floors() {
        let now = Time::from_millis(1000);
        let base = Time::from_millis(10);
        let d = Deadline::at_least_now(now, base, Duration::from_millis(5));
        assert_eq!(d.0, now);
    }

    #[test]
    fn deadline_has_passed() {
        let d = Deadline(Time::from_millis(100));
        assert!(!d.has_passed(Time::from_millis(99)));
        assert!(d.has_passed(Time::from_millis(100)));
        assert!(d.has_passed(Time::from_millis(101)));
    }
}
