//! Node clock model: a fixed offset plus a constant drift against true time
//!
//! True time is the conductor's local clock. Drift accumulates from true
//! time zero.

use cuesync_core::{AuthorityTime, ClockOffset, LocalTime, NodeTime};

/// Clock of a simulated node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockModel {
    /// Node clock minus true time at true time zero
    pub offset: ClockOffset,
    /// Parts per million; positive runs fast
    pub drift_ppm: f64,
}

impl Default for ClockModel {
    fn default() -> Self {
        Self::perfect()
    }
}

impl ClockModel {
    pub fn new(offset: ClockOffset, drift_ppm: f64) -> Self {
        ClockModel { offset, drift_ppm }
    }

    /// Same clock as the conductor
    pub fn perfect() -> Self {
        Self::new(ClockOffset::ZERO, 0.0)
    }

    pub fn offset_ms(millis: i64) -> Self {
        Self::new(ClockOffset::from_millis(millis), 0.0)
    }

    pub fn with_drift_ppm(mut self, drift_ppm: f64) -> Self {
        self.drift_ppm = drift_ppm;
        self
    }

    /// Node clock reading at true time `t`
    pub fn read(&self, t: LocalTime) -> NodeTime {
        let drift = (t.as_micros() as f64 * self.drift_ppm / 1_000_000.0).round() as i64;
        NodeTime::from_micros(t.as_micros() + self.offset.as_micros() + drift)
    }

    /// True time at which the node clock reads `n`
    pub fn true_time_of(&self, n: NodeTime) -> LocalTime {
        let rate = 1.0 + self.drift_ppm / 1_000_000.0;
        let micros = (n.as_micros() - self.offset.as_micros()) as f64 / rate;
        LocalTime::from_micros(micros.round() as i64)
    }

    /// Offset against true time at true time `t`
    pub fn offset_at(&self, t: LocalTime) -> ClockOffset {
        ClockOffset::from_micros(self.read(t).as_micros() - t.as_micros())
    }

    /// Reading of this clock as an authority clock
    pub fn read_authority(&self, t: LocalTime) -> AuthorityTime {
        AuthorityTime::from_micros(self.read(t).as_micros())
    }

    /// True time at which this authority clock reads `a`
    pub fn true_time_of_authority(&self, a: AuthorityTime) -> LocalTime {
        self.true_time_of(NodeTime::from_micros(a.as_micros()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_only() {
        let clock = ClockModel::offset_ms(120);
        let t = LocalTime::from_millis(5_000);
        assert_eq!(clock.read(t), NodeTime::from_millis(5_120));
        assert_eq!(clock.true_time_of(NodeTime::from_millis(5_120)), t);
        assert_eq!(clock.offset_at(t), ClockOffset::from_millis(120));
    }

    #[test]
    fn test_drift_accumulates() {
        let clock = ClockModel::perfect().with_drift_ppm(100.0);
        // 100 ppm over 10 s is 1 ms
        let t = LocalTime::from_millis(10_000);
        assert_eq!(clock.offset_at(t), ClockOffset::from_millis(1));

        let back = clock.true_time_of(clock.read(t));
        assert!((back.as_micros() - t.as_micros()).abs() <= 1);
    }
}
