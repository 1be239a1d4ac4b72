//! Time Authority Arbitration - which clock is the zero-offset reference
//!
//! Policy: the lowest node id among active nodes that declare authority
//! eligibility, falling back to the local process. Every assignment bumps
//! the epoch. Submissions pause until the new authority has been probed.
//!
//! Scheduling holds a shared guard on the authority state for its whole
//! computation. Elections take it exclusively and reset the clock state
//! for the new epoch before releasing it.

use parking_lot::{RwLock, RwLockReadGuard};

use cuesync_core::{Authority, CoreEvent, Epoch, EventBus, Liveness};

use crate::Node;

/// A completed authority reassignment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthorityChange {
    pub previous: Authority,
    pub current: Authority,
    pub epoch: Epoch,
}

#[derive(Debug)]
struct AuthorityState {
    authority: Authority,
    epoch: Epoch,
    paused: bool,
}

/// Shared view of the authority state, held across one submission
pub struct AuthorityGuard<'a> {
    state: RwLockReadGuard<'a, AuthorityState>,
}

impl AuthorityGuard<'_> {
    pub fn authority(&self) -> Authority {
        self.state.authority
    }

    pub fn epoch(&self) -> Epoch {
        self.state.epoch
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused
    }
}

/// Time Authority Arbitration
pub struct AuthorityArbiter {
    state: RwLock<AuthorityState>,
    events: EventBus,
}

impl AuthorityArbiter {
    pub fn new(events: EventBus) -> Self {
        AuthorityArbiter {
            state: RwLock::new(AuthorityState {
                authority: Authority::Local,
                epoch: Epoch::INITIAL,
                paused: false,
            }),
            events,
        }
    }

    pub fn current_authority(&self) -> Authority {
        self.state.read().authority
    }

    pub fn epoch(&self) -> Epoch {
        self.state.read().epoch
    }

    pub fn is_paused(&self) -> bool {
        self.state.read().paused
    }

    /// Shared guard; elections wait until it is dropped
    pub fn read(&self) -> AuthorityGuard<'_> {
        AuthorityGuard {
            state: self.state.read(),
        }
    }

    /// Candidate the policy picks for this snapshot
    pub fn choose(snapshot: &[Node]) -> Authority {
        snapshot
            .iter()
            .filter(|node| node.liveness == Liveness::Active && node.is_authority_eligible())
            .map(|node| node.id)
            .min()
            .map(Authority::Node)
            .unwrap_or(Authority::Local)
    }

    /// Re-run the election. Returns the change if the authority moved.
    ///
    /// `commit` runs with the authority state still exclusively held, so
    /// no submission observes the new epoch before the clock state that
    /// belongs to it.
    pub fn elect<F>(&self, snapshot: &[Node], commit: F) -> Option<AuthorityChange>
    where
        F: FnOnce(&AuthorityChange),
    {
        let candidate = Self::choose(snapshot);
        if self.current_authority() == candidate {
            return None;
        }

        let mut state = self.state.write();
        if state.authority == candidate {
            return None;
        }

        let previous = state.authority;
        let was_paused = state.paused;
        state.authority = candidate;
        state.epoch = state.epoch.next();
        state.paused = candidate.node().is_some();
        let epoch = state.epoch;
        let change = AuthorityChange {
            previous,
            current: candidate,
            epoch,
        };
        commit(&change);
        drop(state);

        tracing::info!(
            previous = %previous,
            current = %candidate,
            epoch = %epoch,
            "time authority changed"
        );
        self.events.publish(CoreEvent::AuthorityChanged {
            previous,
            current: candidate,
            epoch,
        });
        if candidate.node().is_some() {
            tracing::info!(epoch = %epoch, "cue submissions paused until authority is probed");
            self.events.publish(CoreEvent::SubmissionsPaused { epoch });
        } else if was_paused {
            self.events.publish(CoreEvent::SubmissionsResumed { epoch });
        }

        Some(change)
    }

    /// Lift the submission pause once the authority has an accepted sample
    /// under the current epoch. Returns true if the pause was lifted.
    pub fn maybe_resume(&self, accepted_since_epoch: u64) -> bool {
        if !self.is_paused() || accepted_since_epoch == 0 {
            return false;
        }

        let mut state = self.state.write();
        if !state.paused {
            return false;
        }
        state.paused = false;
        let epoch = state.epoch;
        drop(state);

        tracing::info!(epoch = %epoch, "cue submissions resumed");
        self.events.publish(CoreEvent::SubmissionsResumed { epoch });
        true
    }
}
