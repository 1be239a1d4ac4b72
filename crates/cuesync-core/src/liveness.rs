//! Node liveness states
//!
//! Active --(missed heartbeats)--> Suspect --(grace elapsed)--> Departed
//! Suspect --(heartbeat)--> Active
//! Suspect for a clock fault --(fresh estimate)--> Active
//! Departed is terminal for a registration.

use std::fmt;

/// Liveness of a registered node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Liveness {
    Active,
    Suspect,
    Departed,
}

impl Liveness {
    #[inline]
    pub fn is_active(self) -> bool {
        self == Liveness::Active
    }

    /// Whether a transition from `self` to `next` is a legal state machine edge
    pub fn can_transition_to(self, next: Liveness) -> bool {
        matches!(
            (self, next),
            (Liveness::Active, Liveness::Suspect)
                | (Liveness::Suspect, Liveness::Active)
                | (Liveness::Suspect, Liveness::Departed)
                | (Liveness::Active, Liveness::Departed)
        )
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Liveness::Active => "active",
            Liveness::Suspect => "suspect",
            Liveness::Departed => "departed",
        };
        f.write_str(name)
    }
}

/// Why a liveness transition happened
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionReason {
    /// Heartbeats missed beyond the configured threshold
    MissedHeartbeats(u32),
    /// Grace period elapsed while suspect
    GraceExpired,
    /// Heartbeat received while suspect
    HeartbeatResumed,
    /// Clock samples rejected too often
    ClockRejections,
    /// Offset estimate exceeded its max age
    StaleClock,
    /// Fresh offset estimate after a clock fault
    ClockRecovered,
    /// Explicit removal
    Removed,
    /// Marked suspect by an external collaborator
    External(String),
}

impl TransitionReason {
    /// Suspicion raised by the clock sync engine rather than by silence
    pub fn is_clock_fault(&self) -> bool {
        matches!(self, TransitionReason::ClockRejections | TransitionReason::StaleClock)
    }
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionReason::MissedHeartbeats(n) => write!(f, "{n} heartbeats missed"),
            TransitionReason::GraceExpired => f.write_str("grace period expired"),
            TransitionReason::HeartbeatResumed => f.write_str("heartbeat resumed"),
            TransitionReason::ClockRejections => f.write_str("clock sample rejection rate"),
            TransitionReason::StaleClock => f.write_str("clock estimate stale"),
            TransitionReason::ClockRecovered => f.write_str("clock estimate recovered"),
            TransitionReason::Removed => f.write_str("removed"),
            TransitionReason::External(reason) => f.write_str(reason),
        }
    }
}
