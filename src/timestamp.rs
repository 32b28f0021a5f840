//! Engine time. The receive loop passes an explicit `now` into every entry
//! point so the whole engine can be driven deterministically in tests.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// An absolute point in engine time with microsecond resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1_000_000)
    }

    /// Builds a timestamp from the split seconds/microseconds form used by
    /// packet capture headers.
    pub const fn from_parts(secs: u64, micros: u64) -> Self {
        Self(secs * 1_000_000 + micros)
    }

    /// Time elapsed since `earlier`, saturating to zero if `earlier` is in
    /// the future.
    pub fn since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_micros() as u64))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.since(rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        let t = Timestamp::from_secs(3);
        assert_eq!(t + Duration::from_millis(500), Timestamp::from_micros(3_500_000));
        assert_eq!(t.since(Timestamp::from_secs(1)), Duration::from_secs(2));
        // The future does not produce negative ages.
        assert_eq!(t.since(Timestamp::from_secs(5)), Duration::ZERO);
        assert_eq!(Timestamp::from_parts(1, 250_000), Timestamp::from_micros(1_250_000));
    }
}
