//! Time as seen by the limiter.
//!
//! Every window, block and bucket is measured against a monotonic
//! [`Instant`]. The controller reads its [`Clock`] to stamp request
//! descriptors and the janitor reads it to decide what has expired, so
//! swapping the clock moves both together. [`MockClock`] is compiled for
//! this crate's tests and for dependents that enable `test-helpers`.

use std::fmt::Debug;
use std::time::Instant;

/// Monotonic time source shared by admission and cleanup.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;
}

/// Reads `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(any(test, feature = "test-helpers"))]
pub use mock::MockClock;

#[cfg(any(test, feature = "test-helpers"))]
mod mock {
    use super::Clock;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    /// Hand-driven clock for replaying traffic at exact offsets.
    ///
    /// Clones share one instant, so a test can keep a handle while the
    /// controller owns another.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        current: Arc<Mutex<Instant>>,
    }

    impl MockClock {
        pub fn new(start: Instant) -> Self {
            Self {
                current: Arc::new(Mutex::new(start)),
            }
        }

        /// Start `history` after the real present, so that window cutoffs
        /// up to `history` in the past are representable from the first
        /// request on.
        pub fn starting_after(history: Duration) -> Self {
            Self::new(Instant::now() + history)
        }

        pub fn advance(&self, duration: Duration) {
            *self.current.lock() += duration;
        }

        /// Jump to `instant`. Moving backwards is allowed and models
        /// out-of-order arrivals.
        pub fn set(&self, instant: Instant) {
            *self.current.lock() = instant;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.current.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_system_clock_never_goes_backwards() {
        let clock = SystemClock::new();
        let readings: Vec<Instant> = (0..100).map(|_| clock.now()).collect();
        assert!(readings.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn test_starting_after_keeps_hour_cutoff_representable() {
        let clock = MockClock::starting_after(HOUR);
        assert!(clock.now().checked_sub(HOUR).is_some());
    }

    #[test]
    fn test_handle_moves_time_seen_through_trait_object() {
        let handle = MockClock::starting_after(HOUR);
        let start = handle.now();
        let shared: Arc<dyn Clock> = Arc::new(handle.clone());

        handle.advance(Duration::from_secs(61));
        assert_eq!(shared.now(), start + Duration::from_secs(61));

        // Out-of-order arrival
        handle.set(start);
        assert_eq!(shared.now(), start);
    }
}
