//! Cue definitions and per-dispatch status
//!
//! A cue is an immutable, time-targeted action created by the authoring
//! layer. The core never looks inside the payload.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::{
    AuthorityTime, Capabilities, CapabilityPredicate, CueId, CueKind, IdempotencyKey, Liveness,
    NodeId,
};

/// Default delivery tolerance when the authoring layer does not set one
pub const DEFAULT_TOLERANCE: Duration = Duration::from_millis(20);

/// Which nodes a cue targets
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeSelector {
    /// An explicit set of node ids
    Explicit(BTreeSet<NodeId>),
    /// Every registered node whose capabilities match
    Matching(CapabilityPredicate),
}

impl NodeSelector {
    pub fn nodes<I: IntoIterator<Item = NodeId>>(nodes: I) -> Self {
        NodeSelector::Explicit(nodes.into_iter().collect())
    }

    /// Select a node given its id and capabilities
    pub fn selects(&self, node: NodeId, caps: &Capabilities) -> bool {
        match self {
            NodeSelector::Explicit(set) => set.contains(&node),
            NodeSelector::Matching(predicate) => predicate.matches(caps),
        }
    }
}

/// A scheduled, time-targeted action
#[derive(Clone, Debug)]
pub struct Cue {
    pub id: CueId,
    pub kind: CueKind,
    /// Intended execution instant on the authority clock
    pub target_time: AuthorityTime,
    pub selector: NodeSelector,
    /// Opaque to the core
    pub payload: Bytes,
    /// Maximum acceptable timing error
    pub tolerance: Duration,
    pub idempotency_key: IdempotencyKey,
}

impl Cue {
    /// Create a cue. The idempotency key defaults to the cue id.
    pub fn new(
        id: CueId,
        kind: CueKind,
        target_time: AuthorityTime,
        selector: NodeSelector,
        payload: impl Into<Bytes>,
    ) -> Self {
        Cue {
            id,
            kind,
            target_time,
            selector,
            payload: payload.into(),
            tolerance: DEFAULT_TOLERANCE,
            idempotency_key: IdempotencyKey::new(format!("cue-{}", id.0)),
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<IdempotencyKey>) -> Self {
        self.idempotency_key = key.into();
        self
    }
}

/// Lifecycle of one (cue, node) dispatch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatchStatus {
    Pending,
    Sent,
    Acknowledged,
    Missed,
    Cancelled,
}

impl DispatchStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DispatchStatus::Acknowledged | DispatchStatus::Missed | DispatchStatus::Cancelled
        )
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::Sent => "sent",
            DispatchStatus::Acknowledged => "acknowledged",
            DispatchStatus::Missed => "missed",
            DispatchStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why a dispatch ended `Missed`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MissReason {
    /// Send time was already past tolerance when the cue was scheduled
    PastDeadline,
    /// Execution window passed before the dispatch could be sent
    Late,
    /// No acknowledgment within execution time plus tolerance
    AckTimeout,
    /// Transport refused or failed the send
    Transport(String),
    /// Node rejected the dispatch
    Rejected(String),
    /// Target node departed before acknowledging
    NodeDeparted,
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissReason::PastDeadline => f.write_str("send time already past tolerance"),
            MissReason::Late => f.write_str("execution window elapsed before send"),
            MissReason::AckTimeout => f.write_str("no acknowledgment within tolerance"),
            MissReason::Transport(reason) => write!(f, "transport failure: {reason}"),
            MissReason::Rejected(reason) => write!(f, "rejected by node: {reason}"),
            MissReason::NodeDeparted => f.write_str("node departed"),
        }
    }
}

/// Why a resolved node was left out of a cue's delivery set
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExclusionReason {
    /// Node is not `Active`
    NotActive(Liveness),
    /// Node does not declare the cue kind
    UnsupportedKind(CueKind),
    /// No usable offset estimate
    NoClockData,
    /// Offset confidence wider than the cue tolerance
    ConfidenceTooWide {
        confidence: Duration,
        tolerance: Duration,
    },
    /// Explicitly targeted node is not registered
    Unknown,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::NotActive(state) => write!(f, "node is {state}"),
            ExclusionReason::UnsupportedKind(kind) => write!(f, "{kind} cues not supported"),
            ExclusionReason::NoClockData => f.write_str("no clock estimate"),
            ExclusionReason::ConfidenceTooWide {
                confidence,
                tolerance,
            } => write!(
                f,
                "confidence ±{:?} exceeds tolerance {:?}",
                confidence, tolerance
            ),
            ExclusionReason::Unknown => f.write_str("node not registered"),
        }
    }
}
