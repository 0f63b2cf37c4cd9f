use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Duration;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A point on the system's monotonic clock.
///
/// Stored as a `(seconds, nanoseconds)` pair. The pair is kept normalized:
/// both fields share a sign, with `0 <= nanos < 10^9` for non-negative points
/// and `-10^9 < nanos <= 0` for negative ones. Unlike `std::time::Instant`
/// the representation is transparent, which is what lets the run loop program
/// the kernel timer in absolute mode and compare deadlines without a syscall.
///
/// Ordering is lexicographic over the normalized pair. The clock never goes
/// backwards and is unaffected by wall-clock adjustments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimePoint {
    seconds: i64,
    nanos: i64,
}

impl TimePoint {
    /// The latest representable point; used by operations that never fire.
    pub const MAX: TimePoint = TimePoint {
        seconds: i64::MAX,
        nanos: NANOS_PER_SEC - 1,
    };

    /// The earliest representable point.
    pub const MIN: TimePoint = TimePoint {
        seconds: i64::MIN,
        nanos: -(NANOS_PER_SEC - 1),
    };

    /// The current reading of `CLOCK_MONOTONIC`.
    pub fn now() -> TimePoint {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // The monotonic clock is always available on the supported kernels;
        // `clock_gettime` can only fail here on an invalid clock id.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        TimePoint::from_parts(ts.tv_sec as i64, ts.tv_nsec as i64)
    }

    /// Build a time-point from raw seconds and nanoseconds, normalizing the
    /// pair.
    pub fn from_parts(seconds: i64, nanos: i64) -> TimePoint {
        let mut tp = TimePoint { seconds, nanos };
        tp.normalize();
        tp
    }

    /// The seconds part of the normalized pair.
    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    /// The nanoseconds part of the normalized pair.
    pub fn subsec_nanos(&self) -> i64 {
        self.nanos
    }

    /// The time elapsed from `earlier` to `self`, or zero if `earlier` is
    /// later.
    pub fn saturating_duration_since(&self, earlier: TimePoint) -> Duration {
        if *self <= earlier {
            return Duration::ZERO;
        }
        let mut seconds = self.seconds - earlier.seconds;
        let mut nanos = self.nanos - earlier.nanos;
        if nanos < 0 {
            seconds -= 1;
            nanos += NANOS_PER_SEC;
        }
        Duration::new(seconds as u64, nanos as u32)
    }

    // Move whole seconds out of the nanoseconds field and make the signs
    // agree.
    fn normalize(&mut self) {
        let extra_seconds = self.nanos / NANOS_PER_SEC;
        self.seconds += extra_seconds;
        self.nanos -= extra_seconds * NANOS_PER_SEC;
        if self.seconds < 0 && self.nanos > 0 {
            self.seconds += 1;
            self.nanos -= NANOS_PER_SEC;
        } else if self.seconds > 0 && self.nanos < 0 {
            self.seconds -= 1;
            self.nanos += NANOS_PER_SEC;
        }
    }
}

impl PartialOrd for TimePoint {
    fn partial_cmp(&self, other: &TimePoint) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimePoint {
    fn cmp(&self, other: &TimePoint) -> Ordering {
        // Lexicographic; valid because the pair is normalized.
        (self.seconds, self.nanos).cmp(&(other.seconds, other.nanos))
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;

    fn add(self, d: Duration) -> TimePoint {
        TimePoint::from_parts(
            self.seconds.wrapping_add(d.as_secs() as i64),
            self.nanos + d.subsec_nanos() as i64,
        )
    }
}

impl AddAssign<Duration> for TimePoint {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

impl Sub<Duration> for TimePoint {
    type Output = TimePoint;

    fn sub(self, d: Duration) -> TimePoint {
        TimePoint::from_parts(
            self.seconds.wrapping_sub(d.as_secs() as i64),
            self.nanos - d.subsec_nanos() as i64,
        )
    }
}

impl SubAssign<Duration> for TimePoint {
    fn sub_assign(&mut self, d: Duration) {
        *self = *self - d;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TimePoint;

    #[test]
    fn now_is_monotonic() {
        let a = TimePoint::now();
        let b = TimePoint::now();
        assert!(a <= b);
    }

    #[test]
    fn normalization_carries_nanoseconds() {
        let tp = TimePoint::from_parts(1, 2_500_000_000);
        assert_eq!(tp.seconds(), 3);
        assert_eq!(tp.subsec_nanos(), 500_000_000);
    }

    #[test]
    fn normalization_keeps_signs_agreeing() {
        // 2s - 0.5s
        let tp = TimePoint::from_parts(2, -500_000_000);
        assert_eq!(tp.seconds(), 1);
        assert_eq!(tp.subsec_nanos(), 500_000_000);

        // -2s + 0.5s
        let tp = TimePoint::from_parts(-2, 500_000_000);
        assert_eq!(tp.seconds(), -1);
        assert_eq!(tp.subsec_nanos(), -500_000_000);
    }

    #[test]
    fn ordering_is_lexicographic() {
        let base = TimePoint::from_parts(10, 0);
        assert!(base < TimePoint::from_parts(10, 1));
        assert!(base < TimePoint::from_parts(11, 0));
        assert!(base > TimePoint::from_parts(9, 999_999_999));
        assert!(TimePoint::MIN < base);
        assert!(base < TimePoint::MAX);
    }

    #[test]
    fn duration_arithmetic_round_trips() {
        let base = TimePoint::from_parts(5, 100);
        let later = base + Duration::from_millis(1500);
        assert_eq!(later.seconds(), 6);
        assert_eq!(later.subsec_nanos(), 500_000_100);
        assert_eq!(later - Duration::from_millis(1500), base);
        assert_eq!(
            later.saturating_duration_since(base),
            Duration::from_millis(1500)
        );
        assert_eq!(base.saturating_duration_since(later), Duration::ZERO);
    }

    #[test]
    fn subtraction_can_cross_zero() {
        let tp = TimePoint::from_parts(0, 100) - Duration::from_secs(1);
        assert_eq!(tp.seconds(), 0);
        assert_eq!(tp.subsec_nanos(), -999_999_900);
    }
}
