//! Time primitives for CUESYNC
//!
//! Every timestamp is signed microseconds in one of three bases:
//! - `LocalTime`: this process's monotonic clock
//! - `AuthorityTime`: the current time authority's clock (cue targets)
//! - `NodeTime`: a remote node's own clock (probe echoes, execution instants)
//!
//! Conversions between bases go through a `ClockOffset` (remote minus local).

use std::ops::{Add, Neg, Sub};
use std::time::Duration;

macro_rules! timestamp {
    ($name:ident, $label:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub i64);

        impl $name {
            pub const ZERO: $name = $name(0);
            pub const MAX: $name = $name(i64::MAX);

            #[inline]
            pub fn from_micros(micros: i64) -> Self {
                $name(micros)
            }

            #[inline]
            pub fn from_millis(millis: i64) -> Self {
                $name(millis * 1000)
            }

            #[inline]
            pub fn from_secs_f64(secs: f64) -> Self {
                $name((secs * 1_000_000.0) as i64)
            }

            #[inline]
            pub fn as_micros(self) -> i64 {
                self.0
            }

            #[inline]
            pub fn as_millis(self) -> i64 {
                self.0 / 1000
            }

            #[inline]
            pub fn as_secs_f64(self) -> f64 {
                self.0 as f64 / 1_000_000.0
            }

            /// Signed microseconds from `earlier` to `self`
            #[inline]
            pub fn micros_since(self, earlier: $name) -> i64 {
                self.0.saturating_sub(earlier.0)
            }

            #[inline]
            pub fn saturating_add(self, duration: Duration) -> Self {
                $name(self.0.saturating_add(duration_micros(duration)))
            }

            #[inline]
            pub fn saturating_sub(self, duration: Duration) -> Self {
                $name(self.0.saturating_sub(duration_micros(duration)))
            }
        }

        impl Add<Duration> for $name {
            type Output = $name;

            #[inline]
            fn add(self, rhs: Duration) -> Self::Output {
                self.saturating_add(rhs)
            }
        }

        impl Sub<Duration> for $name {
            type Output = $name;

            #[inline]
            fn sub(self, rhs: Duration) -> Self::Output {
                self.saturating_sub(rhs)
            }
        }

        /// Elapsed duration, zero when `rhs` is later
        impl Sub<$name> for $name {
            type Output = Duration;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                let diff = self.0.saturating_sub(rhs.0);
                if diff >= 0 {
                    Duration::from_micros(diff as u64)
                } else {
                    Duration::ZERO
                }
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($label, "({:.3}ms)"), self.0 as f64 / 1000.0)
            }
        }
    };
}

timestamp!(LocalTime, "local");
timestamp!(AuthorityTime, "auth");
timestamp!(NodeTime, "node");

#[inline]
fn duration_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

impl LocalTime {
    /// Read this instant on a remote clock with the given offset
    #[inline]
    pub fn to_node(self, node_offset: ClockOffset) -> NodeTime {
        NodeTime(self.0.saturating_add(node_offset.0))
    }

    /// Read this instant on the authority clock
    #[inline]
    pub fn to_authority(self, authority_offset: ClockOffset) -> AuthorityTime {
        AuthorityTime(self.0.saturating_add(authority_offset.0))
    }
}

impl AuthorityTime {
    /// The local instant at which the authority clock reads `self`
    #[inline]
    pub fn to_local(self, authority_offset: ClockOffset) -> LocalTime {
        LocalTime(self.0.saturating_sub(authority_offset.0))
    }

    /// The node-clock reading at the instant the authority clock reads `self`.
    /// `relative` is the node offset minus the authority offset.
    #[inline]
    pub fn to_node(self, relative: ClockOffset) -> NodeTime {
        NodeTime(self.0.saturating_add(relative.0))
    }
}

impl NodeTime {
    #[inline]
    pub fn to_local(self, node_offset: ClockOffset) -> LocalTime {
        LocalTime(self.0.saturating_sub(node_offset.0))
    }
}

/// Signed clock offset in microseconds: remote clock minus local clock
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClockOffset(pub i64);

impl ClockOffset {
    pub const ZERO: ClockOffset = ClockOffset(0);

    #[inline]
    pub fn from_micros(micros: i64) -> Self {
        ClockOffset(micros)
    }

    #[inline]
    pub fn from_millis(millis: i64) -> Self {
        ClockOffset(millis * 1000)
    }

    #[inline]
    pub fn as_micros(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn as_millis(self) -> i64 {
        self.0 / 1000
    }

    /// Magnitude as a duration
    #[inline]
    pub fn magnitude(self) -> Duration {
        Duration::from_micros(self.0.unsigned_abs())
    }
}

impl Add for ClockOffset {
    type Output = ClockOffset;

    #[inline]
    fn add(self, rhs: ClockOffset) -> Self::Output {
        ClockOffset(self.0.saturating_add(rhs.0))
    }
}

impl Sub for ClockOffset {
    type Output = ClockOffset;

    #[inline]
    fn sub(self, rhs: ClockOffset) -> Self::Output {
        ClockOffset(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for ClockOffset {
    type Output = ClockOffset;

    #[inline]
    fn neg(self) -> Self::Output {
        ClockOffset(self.0.saturating_neg())
    }
}

impl std::fmt::Debug for ClockOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "offset({:+.3}ms)", self.0 as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_local_time_arithmetic() {
        let t1 = LocalTime::from_millis(100);
        let t2 = t1 + Duration::from_millis(10);

        assert!(t2 > t1);
        assert_eq!(t2 - t1, Duration::from_millis(10));
        assert_eq!(t1 - t2, Duration::ZERO);
        assert_eq!(t1.micros_since(t2), -10_000);
    }

    #[test]
    fn test_authority_local_conversion() {
        // Authority clock runs 250ms ahead of ours
        let authority_offset = ClockOffset::from_millis(250);
        let target = AuthorityTime::from_millis(10_000);

        let local = target.to_local(authority_offset);
        assert_eq!(local, LocalTime::from_millis(9_750));
        assert_eq!(local.to_authority(authority_offset), target);
    }

    #[test]
    fn test_authority_node_conversion() {
        let authority_offset = ClockOffset::from_millis(250);
        let node_offset = ClockOffset::from_millis(120);
        let target = AuthorityTime::from_millis(10_000);

        let on_node = target.to_node(node_offset - authority_offset);
        assert_eq!(on_node, NodeTime::from_millis(9_870));

        // Same instant viewed through the local clock
        let local = target.to_local(authority_offset);
        assert_eq!(local.to_node(node_offset), on_node);
        assert_eq!(on_node.to_local(node_offset), local);
    }

    #[test]
    fn test_offset_magnitude() {
        assert_eq!(ClockOffset::from_millis(-7).magnitude(), Duration::from_millis(7));
        assert_eq!(-ClockOffset::from_micros(5), ClockOffset::from_micros(-5));
    }

    proptest! {
        #[test]
        fn prop_node_instant_consistent_across_bases(
            target_us in -1_000_000_000_000i64..1_000_000_000_000,
            authority_us in -10_000_000i64..10_000_000,
            node_us in -10_000_000i64..10_000_000,
        ) {
            let authority_offset = ClockOffset::from_micros(authority_us);
            let node_offset = ClockOffset::from_micros(node_us);
            let target = AuthorityTime::from_micros(target_us);

            let via_relative = target.to_node(node_offset - authority_offset);
            let via_local = target.to_local(authority_offset).to_node(node_offset);
            prop_assert_eq!(via_relative, via_local);
        }
    }
}
