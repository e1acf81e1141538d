//! Monotonic high-resolution timestamps.
//!
//! A [`Timestamp`] is a raw tick count paired with the tick frequency of the
//! clock that produced it. On Windows the ticks come from the performance
//! counter; elsewhere they are nanoseconds since the clock was created.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

pub const NANOSECONDS_PER_SECOND: i64 = 1_000_000_000;

/// A point on a monotonic clock.
///
/// Timestamps are only comparable with timestamps from the same clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    ticks: i64,
    frequency: i64,
}

impl Timestamp {
    pub const fn new(ticks: i64, frequency: i64) -> Self {
        Self { ticks, frequency }
    }

    /// Build a timestamp `seconds` after the clock's origin.
    pub fn from_secs_f64(seconds: f64, frequency: i64) -> Self {
        Self {
            ticks: (seconds * frequency as f64).round() as i64,
            frequency,
        }
    }

    pub const fn ticks(&self) -> i64 {
        self.ticks
    }

    pub const fn frequency(&self) -> i64 {
        self.frequency
    }

    /// Seconds from `earlier` to `self`. Negative when `earlier` is later.
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        debug_assert_eq!(self.frequency, earlier.frequency);
        (self.ticks - earlier.ticks) as f64 / self.frequency as f64
    }

    pub fn millis_since(&self, earlier: Timestamp) -> f64 {
        self.seconds_since(earlier) * 1000.0
    }

    /// True once at least `interval` has passed since `earlier`.
    pub fn has_elapsed(&self, earlier: Timestamp, interval: Duration) -> bool {
        self.ticks - earlier.ticks >= duration_to_ticks(interval, self.frequency)
    }

    pub fn saturating_sub(&self, duration: Duration) -> Timestamp {
        Self {
            ticks: self
                .ticks
                .saturating_sub(duration_to_ticks(duration, self.frequency)),
            frequency: self.frequency,
        }
    }

    pub fn saturating_add(&self, duration: Duration) -> Timestamp {
        Self {
            ticks: self
                .ticks
                .saturating_add(duration_to_ticks(duration, self.frequency)),
            frequency: self.frequency,
        }
    }
}

/// Convert a duration to ticks at `frequency` without intermediate overflow.
pub fn duration_to_ticks(duration: Duration, frequency: i64) -> i64 {
    let whole = (duration.as_secs() as i64).saturating_mul(frequency);
    let fraction = mul_div_i64(duration.subsec_nanos() as i64, frequency, NANOSECONDS_PER_SECOND);
    whole.saturating_add(fraction)
}

/// Scale without overflow as long as the result and n * d do not overflow.
fn mul_div_i64(v: i64, n: i64, d: i64) -> i64 {
    let q = v / d;
    let r = v % d;

    q * n + r * n / d
}

/// Source of [`Timestamp`]s.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;

    fn frequency(&self) -> i64;
}

/// Portable clock backed by [`Instant`], ticking in nanoseconds.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.origin.elapsed().as_nanos().min(i64::MAX as u128) as i64;
        Timestamp::new(elapsed, NANOSECONDS_PER_SECOND)
    }

    fn frequency(&self) -> i64 {
        NANOSECONDS_PER_SECOND
    }
}

/// Clock that only moves when told to. Used to drive timing code in tests and
/// to replay externally timestamped events.
#[derive(Debug)]
pub struct ManualClock {
    ticks: AtomicI64,
    frequency: i64,
}

impl ManualClock {
    pub fn new(frequency: i64) -> Self {
        Self {
            ticks: AtomicI64::new(0),
            frequency,
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.ticks
            .fetch_add(duration_to_ticks(duration, self.frequency), Ordering::SeqCst);
    }

    pub fn set(&self, at: Timestamp) {
        debug_assert_eq!(at.frequency(), self.frequency);
        self.ticks.store(at.ticks(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.ticks.load(Ordering::SeqCst), self.frequency)
    }

    fn frequency(&self) -> i64 {
        self.frequency
    }
}

#[cfg(windows)]
pub use qpc::QpcClock;

#[cfg(windows)]
mod qpc {
    use super::{Clock, Timestamp};
    use windows::Win32::System::Performance::{QueryPerformanceCounter, QueryPerformanceFrequency};

    /// The Windows performance counter.
    #[derive(Debug, Clone, Copy)]
    pub struct QpcClock {
        frequency: i64,
    }

    impl QpcClock {
        /// Returns `None` only on systems without a performance counter.
        pub fn new() -> Option<Self> {
            let mut frequency = 0;
            unsafe { QueryPerformanceFrequency(&mut frequency) }.ok()?;
            (frequency > 0).then_some(Self { frequency })
        }
    }

    impl Clock for QpcClock {
        fn now(&self) -> Timestamp {
            let mut ticks = 0;
            // Cannot fail on any system where QueryPerformanceFrequency succeeded.
            let _ = unsafe { QueryPerformanceCounter(&mut ticks) };
            Timestamp::new(ticks, self.frequency)
        }

        fn frequency(&self) -> i64 {
            self.frequency
        }
    }
}

/// The best clock available on this platform.
pub fn system_clock() -> Box<dyn Clock> {
    #[cfg(windows)]
    {
        if let Some(clock) = QpcClock::new() {
            return Box::new(clock);
        }
    }
    Box::new(MonotonicClock::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    const QPC_HZ: i64 = 10_000_000;

    #[test]
    fn duration_conversion_is_exact_for_common_frequencies() {
        assert_eq!(duration_to_ticks(Duration::from_secs(2), QPC_HZ), 20_000_000);
        assert_eq!(duration_to_ticks(Duration::from_millis(16), QPC_HZ), 160_000);
        assert_eq!(
            duration_to_ticks(Duration::from_nanos(1_500), NANOSECONDS_PER_SECOND),
            1_500
        );
    }

    #[test]
    fn elapsed_checks_use_tick_arithmetic() {
        let start = Timestamp::new(1_000, QPC_HZ);
        let later = start.saturating_add(Duration::from_millis(200));
        assert!(later.has_elapsed(start, Duration::from_millis(200)));
        assert!(!later.has_elapsed(start, Duration::from_millis(201)));
        assert!((later.millis_since(start) - 200.0).abs() < 1e-9);
    }

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new(QPC_HZ);
        let first = clock.now();
        assert_eq!(clock.now(), first);
        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now().seconds_since(first), 1.0);
    }

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
