//! Status events
//!
//! Every state transition the core makes is published as a `CoreEvent` on
//! an `EventBus`. The authoring layer and external observability sinks
//! subscribe; the core never waits on them.

use tokio::sync::broadcast;

use crate::{
    Authority, CueId, DispatchStatus, Epoch, ExclusionReason, Liveness, MissReason, NodeId,
    TransitionReason,
};

/// Default bus capacity; slow subscribers lag rather than block publishers
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Structured status event
#[derive(Clone, Debug, PartialEq)]
pub enum CoreEvent {
    /// Node registered (or re-registered after departing)
    NodeRegistered { node: NodeId },
    /// Node liveness changed
    LivenessChanged {
        node: NodeId,
        from: Liveness,
        to: Liveness,
        reason: TransitionReason,
    },
    /// Node removed from the registry
    NodeRemoved { node: NodeId },
    /// A new time authority was assigned
    AuthorityChanged {
        previous: Authority,
        current: Authority,
        epoch: Epoch,
    },
    /// New cue submissions are refused until the new authority is probed
    SubmissionsPaused { epoch: Epoch },
    /// Submissions accepted again
    SubmissionsResumed { epoch: Epoch },
    /// Cue accepted for delivery
    CueScheduled {
        cue: CueId,
        included: usize,
        excluded: usize,
    },
    /// A resolved node was left out of a cue
    DegradedDelivery {
        cue: CueId,
        node: NodeId,
        reason: ExclusionReason,
    },
    /// One (cue, node) dispatch changed status
    DispatchStatusChanged {
        cue: CueId,
        node: NodeId,
        status: DispatchStatus,
        reason: Option<MissReason>,
    },
    /// Every dispatch of a cue is terminal and its window has closed
    CueClosed { cue: CueId },
}

impl CoreEvent {
    /// Node the event concerns, if any
    pub fn node(&self) -> Option<NodeId> {
        match self {
            CoreEvent::NodeRegistered { node }
            | CoreEvent::LivenessChanged { node, .. }
            | CoreEvent::NodeRemoved { node }
            | CoreEvent::DegradedDelivery { node, .. }
            | CoreEvent::DispatchStatusChanged { node, .. } => Some(*node),
            _ => None,
        }
    }

    /// Cue the event concerns, if any
    pub fn cue(&self) -> Option<CueId> {
        match self {
            CoreEvent::CueScheduled { cue, .. }
            | CoreEvent::DegradedDelivery { cue, .. }
            | CoreEvent::DispatchStatusChanged { cue, .. }
            | CoreEvent::CueClosed { cue } => Some(*cue),
            _ => None,
        }
    }
}

/// Broadcast bus for status events. Cloning shares the channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
