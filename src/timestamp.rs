// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime};

/// Unix timestamp in milliseconds since epoch, used as the score for the
/// deferred and recurring sorted sets.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Debug, Serialize, Deserialize, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Current timestamp.
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("now() is never before UNIX_EPOCH")
            .as_millis();
        Self(ms as i64)
    }

    /// Milliseconds elapsed since Unix epoch.
    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => Self(d.as_millis() as i64),
            // Allow times before the epoch to come through as negative scores
            // rather than panicking. A caller deferring "into the past" just
            // becomes immediately eligible.
            Err(e) => Self(-(e.duration().as_millis() as i64)),
        }
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        Self(self.0.saturating_sub(rhs.as_millis() as i64))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0.saturating_add(rhs.as_millis() as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_positive_and_monotonic_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.as_millis() > 0);
        assert!(b >= a);
    }

    #[test]
    fn add_and_sub_duration() {
        let t = Timestamp::from_millis(1_000);
        assert_eq!((t + Duration::from_millis(500)).as_millis(), 1_500);
        assert_eq!((t - Duration::from_millis(500)).as_millis(), 500);
        // i64-backed, so going below the epoch yields a negative score
        // rather than panicking.
        assert_eq!((t - Duration::from_millis(5_000)).as_millis(), -4_000);
    }
}
