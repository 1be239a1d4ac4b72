//! Clock offset estimates

use std::time::Duration;

use crate::{ClockOffset, Epoch, LocalTime};

/// Estimated clock relationship between a remote node and the local clock
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OffsetEstimate {
    /// Node clock minus local clock at `measured_at`
    pub offset: ClockOffset,
    /// Drift of the node clock against ours, parts per million
    pub drift_ppm: f64,
    /// Half-width of the confidence interval around `offset`
    pub confidence: Duration,
    /// Accepted samples backing the estimate
    pub samples: usize,
    /// Local instant of the newest accepted sample
    pub measured_at: LocalTime,
    /// Authority epoch the estimate belongs to
    pub epoch: Epoch,
}

impl OffsetEstimate {
    /// Offset extrapolated to `now` using the drift estimate
    pub fn offset_at(&self, now: LocalTime) -> ClockOffset {
        let elapsed_us = now.micros_since(self.measured_at) as f64;
        let drift_us = elapsed_us * self.drift_ppm / 1_000_000.0;
        self.offset + ClockOffset::from_micros(drift_us.round() as i64)
    }

    /// Age of the estimate at `now`
    pub fn age(&self, now: LocalTime) -> Duration {
        now - self.measured_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_extrapolation() {
        let estimate = OffsetEstimate {
            offset: ClockOffset::from_millis(100),
            drift_ppm: 50.0,
            confidence: Duration::from_millis(2),
            samples: 5,
            measured_at: LocalTime::from_millis(1_000),
            epoch: Epoch::INITIAL,
        };

        // 10 seconds at 50ppm drifts 500us
        let later = LocalTime::from_millis(11_000);
        assert_eq!(estimate.offset_at(later), ClockOffset::from_micros(100_500));
        assert_eq!(estimate.age(later), Duration::from_secs(10));
    }
}
