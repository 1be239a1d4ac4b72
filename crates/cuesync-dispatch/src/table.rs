//! Dispatch table - scheduled cues and their per-node dispatch records
//!
//! Written by the scheduler, driven by the coordinator. Each cue's dispatch
//! set has its own lock. Cancellation is a flag the coordinator picks up on
//! its next tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use cuesync_core::{
    AuthorityTime, Cue, CueId, DispatchStatus, Epoch, ExclusionReason, IdempotencyKey, LocalTime,
    MissReason, NodeId, NodeTime,
};

/// Delivery record for one (cue, node) pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledDispatch {
    pub node: NodeId,
    /// Local instant the dispatch is handed to the transport
    pub send_at: LocalTime,
    /// Expected execution instant on the node's clock
    pub execute_at_node: NodeTime,
    /// Expected execution instant on the local clock
    pub execute_at_local: LocalTime,
    pub status: DispatchStatus,
    pub reason: Option<MissReason>,
    pub sent_at: Option<LocalTime>,
    pub acked_at: Option<LocalTime>,
}

impl ScheduledDispatch {
    pub fn new(
        node: NodeId,
        send_at: LocalTime,
        execute_at_node: NodeTime,
        execute_at_local: LocalTime,
    ) -> Self {
        ScheduledDispatch {
            node,
            send_at,
            execute_at_node,
            execute_at_local,
            status: DispatchStatus::Pending,
            reason: None,
            sent_at: None,
            acked_at: None,
        }
    }

    /// Local instant after which the dispatch can no longer be on time
    pub fn deadline(&self, tolerance: Duration) -> LocalTime {
        self.execute_at_local + tolerance
    }
}

/// Handle returned from a submission
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleHandle {
    pub cue: CueId,
    pub epoch: Epoch,
    /// Nodes with a live dispatch, ordered by id
    pub included: Vec<NodeId>,
    /// Nodes whose dispatch was missed at creation time
    pub missed: Vec<NodeId>,
    /// Resolved nodes left out of the delivery set
    pub excluded: Vec<(NodeId, ExclusionReason)>,
    /// True when an earlier submission with the same idempotency key was returned
    pub duplicate: bool,
}

/// A scheduled cue
#[derive(Debug)]
pub struct CueRecord {
    pub cue: Cue,
    /// Submission order, ties between equal target times
    pub seq: u64,
    handle: ScheduleHandle,
    dispatches: Mutex<Vec<ScheduledDispatch>>,
    cancelled: AtomicBool,
}

impl CueRecord {
    pub fn handle(&self) -> ScheduleHandle {
        self.handle.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Run `f` with exclusive access to this cue's dispatches
    pub fn with_dispatches<R>(&self, f: impl FnOnce(&mut Vec<ScheduledDispatch>) -> R) -> R {
        f(&mut self.dispatches.lock())
    }

    pub fn dispatches(&self) -> Vec<ScheduledDispatch> {
        self.dispatches.lock().clone()
    }

    /// Queue placement key
    pub fn order(&self) -> (AuthorityTime, u64) {
        (self.cue.target_time, self.seq)
    }
}

/// Outcome of inserting a new cue
pub enum Insert {
    Inserted(Arc<CueRecord>),
    /// The idempotency key is taken by a live cue
    Existing(Arc<CueRecord>),
    /// The cue id is taken by a cue with another key
    IdTaken,
}

/// Live cues and the idempotency index
#[derive(Default)]
pub struct DispatchTable {
    cues: RwLock<HashMap<CueId, Arc<CueRecord>>>,
    keys: Mutex<HashMap<IdempotencyKey, CueId>>,
    next_seq: AtomicU64,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cue: CueId) -> Option<Arc<CueRecord>> {
        self.cues.read().get(&cue).cloned()
    }

    /// Live cue registered under `key`
    pub fn by_key(&self, key: &IdempotencyKey) -> Option<Arc<CueRecord>> {
        let id = *self.keys.lock().get(key)?;
        self.get(id)
    }

    /// Insert a cue and its dispatches, unless its key or id is already live
    pub fn insert(
        &self,
        cue: Cue,
        mut handle: ScheduleHandle,
        dispatches: Vec<ScheduledDispatch>,
    ) -> Insert {
        let mut keys = self.keys.lock();
        if let Some(existing) = keys.get(&cue.idempotency_key).and_then(|id| self.get(*id)) {
            return Insert::Existing(existing);
        }
        if self.cues.read().contains_key(&cue.id) {
            return Insert::IdTaken;
        }

        handle.duplicate = false;
        let record = Arc::new(CueRecord {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            handle,
            dispatches: Mutex::new(dispatches),
            cancelled: AtomicBool::new(false),
            cue,
        });
        keys.insert(record.cue.idempotency_key.clone(), record.cue.id);
        self.cues.write().insert(record.cue.id, Arc::clone(&record));
        Insert::Inserted(record)
    }

    /// Flag a cue cancelled. Returns false for unknown or already cancelled cues.
    pub fn cancel(&self, cue: CueId) -> bool {
        match self.get(cue) {
            Some(record) => !record.cancelled.swap(true, Ordering::AcqRel),
            None => false,
        }
    }

    /// Drop a cue and release its idempotency key
    pub fn remove(&self, cue: CueId) -> Option<Arc<CueRecord>> {
        // Same lock order as insert: keys, then cues
        let mut keys = self.keys.lock();
        let record = self.cues.write().remove(&cue)?;
        if keys.get(&record.cue.idempotency_key) == Some(&cue) {
            keys.remove(&record.cue.idempotency_key);
        }
        Some(record)
    }

    /// Live cues in queue order: target time, then submission order
    pub fn ordered(&self) -> Vec<Arc<CueRecord>> {
        let mut records: Vec<Arc<CueRecord>> = self.cues.read().values().cloned().collect();
        records.sort_by_key(|record| record.order());
        records
    }

    pub fn len(&self) -> usize {
        self.cues.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuesync_core::{CueKind, NodeSelector};

    fn cue(id: u64, target_ms: i64) -> Cue {
        Cue::new(
            CueId::new(id),
            CueKind::Trigger,
            AuthorityTime::from_millis(target_ms),
            NodeSelector::nodes([NodeId::new(1)]),
            &b"x"[..],
        )
    }

    fn handle(id: u64) -> ScheduleHandle {
        ScheduleHandle {
            cue: CueId::new(id),
            epoch: Epoch::INITIAL,
            included: vec![NodeId::new(1)],
            missed: Vec::new(),
            excluded: Vec::new(),
            duplicate: false,
        }
    }

    #[test]
    fn test_idempotency_key_held_until_removed() {
        let table = DispatchTable::new();
        assert!(matches!(
            table.insert(cue(1, 100), handle(1), Vec::new()),
            Insert::Inserted(_)
        ));

        let again = cue(2, 100).with_idempotency_key("cue-1");
        match table.insert(again.clone(), handle(2), Vec::new()) {
            Insert::Existing(record) => assert_eq!(record.cue.id, CueId::new(1)),
            _ => panic!("expected existing cue"),
        }

        table.remove(CueId::new(1));
        assert!(table.by_key(&IdempotencyKey::from("cue-1")).is_none());
        assert!(matches!(
            table.insert(again, handle(2), Vec::new()),
            Insert::Inserted(_)
        ));
    }

    #[test]
    fn test_id_taken_under_other_key() {
        let table = DispatchTable::new();
        table.insert(cue(1, 100), handle(1), Vec::new());
        let clash = cue(1, 100).with_idempotency_key("other");
        assert!(matches!(
            table.insert(clash, handle(1), Vec::new()),
            Insert::IdTaken
        ));
    }

    #[test]
    fn test_queue_order_ties_by_submission() {
        let table = DispatchTable::new();
        table.insert(cue(5, 200), handle(5), Vec::new());
        table.insert(cue(3, 100), handle(3), Vec::new());
        table.insert(cue(4, 100), handle(4), Vec::new());

        let order: Vec<u64> = table.ordered().iter().map(|r| r.cue.id.0).collect();
        assert_eq!(order, vec![3, 4, 5]);
    }

    #[test]
    fn test_cancel_once() {
        let table = DispatchTable::new();
        table.insert(cue(1, 100), handle(1), Vec::new());
        assert!(table.cancel(CueId::new(1)));
        assert!(!table.cancel(CueId::new(1)));
        assert!(!table.cancel(CueId::new(9)));
        assert!(table.get(CueId::new(1)).unwrap().is_cancelled());
    }
}
