//! Cue Scheduler - per-node send times for a cue
//!
//! ```text
//! target_local  = target - authority_offset
//! execute_node  = target + node_offset - authority_offset
//! send_at       = max(target_local - lead, now)
//! lead          = transit + max(dispatch_margin, latency_budget)
//! ```
//!
//! Submission holds the authority guard for its whole computation, so an
//! election can never interleave with one cue's planning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cuesync_core::{
    ConfigError, ConfigResult, CoreEvent, Cue, CueId, DispatchStatus, Epoch, EventBus,
    ExclusionReason, Liveness, LocalTime, MissReason, NodeId, NodeSelector, OffsetEstimate,
    SchedulingError, SchedulingResult,
};
use cuesync_peer::{AuthorityArbiter, Node, PeerRegistry};
use cuesync_time::ClockSyncEngine;
use cuesync_wire::{MAX_DISPATCH_PAYLOAD, MAX_DISPATCH_TOLERANCE};

use crate::{DispatchTable, Insert, ScheduleHandle, ScheduledDispatch};

/// Cue scheduler configuration
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Minimum time between hand-off to the transport and execution
    pub dispatch_margin: Duration,
    /// Fixed lead time per node, replacing the computed one
    pub lead_overrides: HashMap<NodeId, Duration>,
    /// Tightest tolerance that can be honored (the coordinator tick interval)
    pub min_precision: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            dispatch_margin: Duration::from_millis(10),
            lead_overrides: HashMap::new(),
            min_precision: Duration::from_millis(2),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_precision.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "scheduler.min_precision",
            });
        }
        Ok(())
    }
}

/// Cue Scheduler
pub struct CueScheduler {
    config: SchedulerConfig,
    registry: Arc<PeerRegistry>,
    sync: Arc<ClockSyncEngine>,
    arbiter: Arc<AuthorityArbiter>,
    table: Arc<DispatchTable>,
    events: EventBus,
}

impl CueScheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<PeerRegistry>,
        sync: Arc<ClockSyncEngine>,
        arbiter: Arc<AuthorityArbiter>,
        table: Arc<DispatchTable>,
        events: EventBus,
    ) -> Self {
        CueScheduler {
            config,
            registry,
            sync,
            arbiter,
            table,
            events,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Schedule a cue for delivery
    pub fn submit(&self, cue: Cue, now: LocalTime) -> SchedulingResult<ScheduleHandle> {
        let guard = self.arbiter.read();
        if guard.is_paused() {
            return Err(SchedulingError::SubmissionsPaused(guard.epoch()));
        }
        self.validate(&cue)?;

        if let Some(existing) = self.table.by_key(&cue.idempotency_key) {
            return Ok(duplicate(existing.handle()));
        }

        let epoch = guard.epoch();
        let authority = self
            .sync
            .authority_estimate(now)
            .filter(|estimate| estimate.epoch == epoch);
        let snapshot = self.registry.snapshot();
        let targets = resolve(&cue.selector, &snapshot);

        let mut dispatches = Vec::with_capacity(targets.len());
        let mut included = Vec::new();
        let mut missed = Vec::new();
        let mut excluded = Vec::new();

        for (id, node) in targets {
            let planned = match node {
                None => Err(ExclusionReason::Unknown),
                Some(node) if node.liveness != Liveness::Active => {
                    Err(ExclusionReason::NotActive(node.liveness))
                }
                Some(node) if !node.capabilities.supports(cue.kind) => {
                    Err(ExclusionReason::UnsupportedKind(cue.kind))
                }
                Some(node) => match &authority {
                    Some(authority) => self.plan(&cue, node, authority, epoch, now),
                    None => Err(ExclusionReason::NoClockData),
                },
            };

            match planned {
                Ok(dispatch) => {
                    if dispatch.status == DispatchStatus::Missed {
                        missed.push(id);
                    } else {
                        included.push(id);
                    }
                    dispatches.push(dispatch);
                }
                Err(reason) => {
                    tracing::debug!(cue = %cue.id, node = %id, reason = %reason, "node excluded");
                    excluded.push((id, reason));
                }
            }
        }

        if included.is_empty() {
            tracing::warn!(
                cue = %cue.id,
                missed = missed.len(),
                excluded = excluded.len(),
                "no eligible nodes"
            );
            return Err(SchedulingError::NoEligibleNodes(cue.id));
        }

        let cue_id = cue.id;
        let handle = ScheduleHandle {
            cue: cue_id,
            epoch: guard.epoch(),
            included,
            missed,
            excluded,
            duplicate: false,
        };

        match self.table.insert(cue, handle.clone(), dispatches) {
            Insert::Inserted(record) => {
                self.announce(&handle, &record.dispatches());
                Ok(handle)
            }
            Insert::Existing(existing) => Ok(duplicate(existing.handle())),
            Insert::IdTaken => Err(SchedulingError::DuplicateCueId(cue_id)),
        }
    }

    /// Cancel a cue. Dispatches not yet sent are suppressed.
    pub fn cancel(&self, cue: CueId) -> bool {
        let cancelled = self.table.cancel(cue);
        if cancelled {
            tracing::info!(cue = %cue, "cue cancelled");
        }
        cancelled
    }

    fn validate(&self, cue: &Cue) -> SchedulingResult<()> {
        if cue.tolerance < self.config.min_precision {
            return Err(SchedulingError::InvalidTolerance {
                requested: cue.tolerance,
                minimum: self.config.min_precision,
            });
        }
        if cue.tolerance > MAX_DISPATCH_TOLERANCE {
            return Err(SchedulingError::ToleranceTooLarge {
                requested: cue.tolerance,
                maximum: MAX_DISPATCH_TOLERANCE,
            });
        }
        if cue.payload.is_empty() {
            return Err(SchedulingError::EmptyPayload(cue.id));
        }
        if cue.payload.len() > MAX_DISPATCH_PAYLOAD {
            return Err(SchedulingError::PayloadTooLarge {
                cue: cue.id,
                size: cue.payload.len(),
                max: MAX_DISPATCH_PAYLOAD,
            });
        }
        Ok(())
    }

    /// Lead time between hand-off and execution for `node`
    pub fn lead(&self, node: &Node) -> Duration {
        if let Some(lead) = self.config.lead_overrides.get(&node.id) {
            return *lead;
        }
        let transit = self.sync.transit(node.id).unwrap_or(Duration::ZERO);
        transit + self.config.dispatch_margin.max(node.capabilities.latency_budget)
    }

    fn plan(
        &self,
        cue: &Cue,
        node: &Node,
        authority: &OffsetEstimate,
        epoch: Epoch,
        now: LocalTime,
    ) -> Result<ScheduledDispatch, ExclusionReason> {
        // Both offsets must be measured against the same authority
        let estimate = self
            .sync
            .estimate(node.id, now)
            .filter(|estimate| estimate.epoch == epoch)
            .ok_or(ExclusionReason::NoClockData)?;

        let confidence = estimate.confidence + authority.confidence;
        if confidence > cue.tolerance {
            return Err(ExclusionReason::ConfidenceTooWide {
                confidence,
                tolerance: cue.tolerance,
            });
        }

        let authority_offset = authority.offset_at(now);
        let node_offset = estimate.offset_at(now);
        let execute_at_local = cue.target_time.to_local(authority_offset);
        let execute_at_node = cue.target_time.to_node(node_offset - authority_offset);

        let ideal_send = execute_at_local - self.lead(node);
        let send_at = ideal_send.max(now);

        let mut dispatch = ScheduledDispatch::new(node.id, send_at, execute_at_node, execute_at_local);
        if now - ideal_send > cue.tolerance {
            dispatch.status = DispatchStatus::Missed;
            dispatch.reason = Some(MissReason::PastDeadline);
        }
        Ok(dispatch)
    }

    fn announce(&self, handle: &ScheduleHandle, dispatches: &[ScheduledDispatch]) {
        tracing::info!(
            cue = %handle.cue,
            epoch = %handle.epoch,
            included = handle.included.len(),
            missed = handle.missed.len(),
            excluded = handle.excluded.len(),
            "cue scheduled"
        );
        self.events.publish(CoreEvent::CueScheduled {
            cue: handle.cue,
            included: handle.included.len(),
            excluded: handle.excluded.len(),
        });

        for (node, reason) in &handle.excluded {
            self.events.publish(CoreEvent::DegradedDelivery {
                cue: handle.cue,
                node: *node,
                reason: reason.clone(),
            });
        }

        for dispatch in dispatches.iter().filter(|d| d.status == DispatchStatus::Missed) {
            tracing::warn!(
                cue = %handle.cue,
                node = %dispatch.node,
                "dispatch missed: send time already past tolerance"
            );
            self.events.publish(CoreEvent::DispatchStatusChanged {
                cue: handle.cue,
                node: dispatch.node,
                status: DispatchStatus::Missed,
                reason: dispatch.reason.clone(),
            });
        }
    }
}

fn duplicate(mut handle: ScheduleHandle) -> ScheduleHandle {
    handle.duplicate = true;
    handle
}

/// Resolve a selector against a snapshot ordered by node id.
/// Capability selectors never pick departed nodes.
fn resolve<'a>(selector: &NodeSelector, snapshot: &'a [Node]) -> Vec<(NodeId, Option<&'a Node>)> {
    match selector {
        NodeSelector::Explicit(ids) => ids
            .iter()
            .map(|id| {
                let node = snapshot
                    .binary_search_by_key(id, |node| node.id)
                    .ok()
                    .map(|index| &snapshot[index]);
                (*id, node)
            })
            .collect(),
        NodeSelector::Matching(_) => snapshot
            .iter()
            .filter(|node| node.liveness != Liveness::Departed)
            .filter(|node| selector.selects(node.id, &node.capabilities))
            .map(|node| (node.id, Some(node)))
            .collect(),
    }
}
