//! Round-trip probe samples
//!
//! ```text
//! Local                           Node
//!   |--- Probe (t1) --------------->|  (node records t2)
//!   |<-- ProbeReply (t1, t2, t3) ---|  (node records t3)
//!   | (local records t4)            |
//!
//!   offset = ((t2 - t1) + (t3 - t4)) / 2
//!   delay  = (t4 - t1) - (t3 - t2)
//! ```

use std::time::Duration;

use cuesync_core::{ClockOffset, Epoch, LocalTime, NodeTime, SyncError, SyncResult};

/// One completed probe exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundTripSample {
    /// Local send time
    pub t1: LocalTime,
    /// Node receive time
    pub t2: NodeTime,
    /// Node reply time
    pub t3: NodeTime,
    /// Local receive time
    pub t4: LocalTime,
    /// Authority epoch the probe was sent under
    pub epoch: Epoch,
}

impl RoundTripSample {
    pub fn new(t1: LocalTime, t2: NodeTime, t3: NodeTime, t4: LocalTime, epoch: Epoch) -> Self {
        RoundTripSample {
            t1,
            t2,
            t3,
            t4,
            epoch,
        }
    }

    /// Reject samples whose timestamps cannot come from a real exchange
    pub fn validate(&self) -> SyncResult<()> {
        if self.t4 < self.t1 || self.t3 < self.t2 {
            return Err(SyncError::NonCausalSample);
        }
        if self.t4.micros_since(self.t1) < self.t3.micros_since(self.t2) {
            return Err(SyncError::NonCausalSample);
        }
        Ok(())
    }

    /// Offset assuming a symmetric path
    pub fn offset(&self) -> ClockOffset {
        self.offset_with_asymmetry(ClockOffset::ZERO)
    }

    /// Offset corrected for a known path asymmetry (forward minus return delay)
    pub fn offset_with_asymmetry(&self, asymmetry: ClockOffset) -> ClockOffset {
        let forward = self.t2.as_micros() as i128 - self.t1.as_micros() as i128;
        let backward = self.t3.as_micros() as i128 - self.t4.as_micros() as i128;
        let sum = forward + backward - asymmetry.as_micros() as i128;
        ClockOffset::from_micros((sum / 2) as i64)
    }

    /// Network round-trip delay excluding node processing time
    pub fn delay(&self) -> Duration {
        let total = self.t4.micros_since(self.t1);
        let processing = self.t3.micros_since(self.t2);
        Duration::from_micros(total.saturating_sub(processing).max(0) as u64)
    }

    /// Upper bound on the offset error of this sample alone
    pub fn uncertainty(&self) -> Duration {
        self.delay() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Node clock `offset_ms` ahead, one-way delays `fwd_ms` / `ret_ms`,
    /// node processing `proc_ms`
    fn exchange(offset_ms: i64, fwd_ms: i64, ret_ms: i64, proc_ms: i64) -> RoundTripSample {
        let t1 = 1_000;
        let t2 = t1 + fwd_ms + offset_ms;
        let t3 = t2 + proc_ms;
        let t4 = t3 - offset_ms + ret_ms;
        RoundTripSample::new(
            LocalTime::from_millis(t1),
            NodeTime::from_millis(t2),
            NodeTime::from_millis(t3),
            LocalTime::from_millis(t4),
            Epoch::INITIAL,
        )
    }

    #[test]
    fn test_symmetric_offset_and_delay() {
        let sample = exchange(120, 5, 5, 2);
        assert_eq!(sample.offset(), ClockOffset::from_millis(120));
        assert_eq!(sample.delay(), Duration::from_millis(10));
        assert_eq!(sample.uncertainty(), Duration::from_millis(5));
        assert!(sample.validate().is_ok());
    }

    #[test]
    fn test_asymmetric_path_bias_and_correction() {
        // Forward 9ms, return 3ms: uncorrected estimate is off by 3ms
        let sample = exchange(-40, 9, 3, 1);
        assert_eq!(sample.offset(), ClockOffset::from_millis(-37));
        assert_eq!(
            sample.offset_with_asymmetry(ClockOffset::from_millis(6)),
            ClockOffset::from_millis(-40)
        );
    }

    #[test]
    fn test_non_causal_rejected() {
        let mut sample = exchange(0, 5, 5, 2);
        sample.t4 = LocalTime::from_millis(900);
        assert_eq!(sample.validate(), Err(SyncError::NonCausalSample));

        // Node claims to have spent longer than the whole round trip
        let mut sample = exchange(0, 1, 1, 2);
        sample.t3 = sample.t2 + Duration::from_millis(50);
        assert_eq!(sample.validate(), Err(SyncError::NonCausalSample));
    }
}
