//! Local clock sources for the CUESYNC time engine

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cuesync_core::LocalTime;

/// Source of local monotonic time.
/// INVARIANT: successive readings never decrease
pub trait LocalClock: Send + Sync {
    fn now(&self) -> LocalTime;
}

impl<C: LocalClock + ?Sized> LocalClock for Arc<C> {
    fn now(&self) -> LocalTime {
        (**self).now()
    }
}

/// Monotonic clock backed by the OS monotonic source, zero at creation
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    reference: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            reference: Instant::now(),
        }
    }

    /// Elapsed time since the clock was created
    pub fn elapsed(&self) -> Duration {
        self.reference.elapsed()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalClock for MonotonicClock {
    fn now(&self) -> LocalTime {
        let micros = i64::try_from(self.elapsed().as_micros()).unwrap_or(i64::MAX);
        LocalTime::from_micros(micros)
    }
}

/// Manually driven clock for simulation and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    value: AtomicI64,
}

impl ManualClock {
    pub fn new(start: LocalTime) -> Self {
        ManualClock {
            value: AtomicI64::new(start.as_micros()),
        }
    }

    /// Advance the clock, returning the new reading
    pub fn advance(&self, dt: Duration) -> LocalTime {
        let micros = i64::try_from(dt.as_micros()).unwrap_or(i64::MAX);
        let prev = self.value.fetch_add(micros, Ordering::SeqCst);
        LocalTime::from_micros(prev.saturating_add(micros))
    }

    /// Move the clock to `target`. Only allowed to move forward.
    pub fn advance_to(&self, target: LocalTime) {
        self.value.fetch_max(target.as_micros(), Ordering::SeqCst);
    }
}

impl LocalClock for ManualClock {
    fn now(&self) -> LocalTime {
        LocalTime::from_micros(self.value.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();

        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.now();

        assert!(t2 > t1);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(LocalTime::from_millis(100));
        assert_eq!(clock.now(), LocalTime::from_millis(100));

        let t = clock.advance(Duration::from_millis(25));
        assert_eq!(t, LocalTime::from_millis(125));

        // Never moves backwards
        clock.advance_to(LocalTime::from_millis(50));
        assert_eq!(clock.now(), LocalTime::from_millis(125));
        clock.advance_to(LocalTime::from_millis(400));
        assert_eq!(clock.now(), LocalTime::from_millis(400));
    }

    #[test]
    fn test_shared_clock() {
        let clock = Arc::new(ManualClock::new(LocalTime::ZERO));
        let shared: Arc<dyn LocalClock> = clock.clone();
        clock.advance(Duration::from_millis(3));
        assert_eq!(shared.now(), LocalTime::from_millis(3));
    }
}
