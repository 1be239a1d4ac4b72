//! Dispatch Coordinator - drives scheduled dispatches through the transport
//!
//! ```text
//! Pending --(send_at reached)--> Sent --(ack)--> Acknowledged
//!    |                             |
//!    |                             +--(deadline passed)--> Missed
//!    +--(window passed)--> Missed (Late)
//!    +--(cue cancelled)--> Cancelled
//! ```
//!
//! The deadline of a dispatch is its local execution instant plus the cue
//! tolerance. Misses come from elapsed-time comparison only and are never
//! retried.

use std::sync::Arc;
use std::time::Duration;

use cuesync_core::{
    ConfigError, ConfigResult, CoreEvent, CueId, DispatchStatus, EventBus, LocalTime, MissReason,
    NodeId, TransportError,
};
use cuesync_transport::Transport;
use cuesync_wire::{encode, DispatchBody, Message};

use crate::{CueRecord, DispatchTable, ScheduledDispatch};

/// Dispatch coordinator configuration
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Interval between coordinator ticks; also the finest achievable precision
    pub tick_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            tick_interval: Duration::from_millis(2),
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "dispatch.tick_interval",
            });
        }
        Ok(())
    }
}

/// What one tick did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sent: Vec<(CueId, NodeId)>,
    pub missed: Vec<(CueId, NodeId, MissReason)>,
    pub cancelled: Vec<(CueId, NodeId)>,
    pub closed: Vec<CueId>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.sent.is_empty()
            && self.missed.is_empty()
            && self.cancelled.is_empty()
            && self.closed.is_empty()
    }
}

/// Dispatch Coordinator
pub struct DispatchCoordinator<T: Transport> {
    config: DispatchConfig,
    /// Source id stamped on outgoing frames
    local_id: NodeId,
    table: Arc<DispatchTable>,
    transport: T,
    events: EventBus,
}

impl<T: Transport> DispatchCoordinator<T> {
    pub fn new(
        config: DispatchConfig,
        local_id: NodeId,
        table: Arc<DispatchTable>,
        transport: T,
        events: EventBus,
    ) -> Self {
        DispatchCoordinator {
            config,
            local_id,
            table,
            transport,
            events,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Advance every live cue to `now`
    pub fn tick(&self, now: LocalTime) -> TickReport {
        let mut report = TickReport::default();

        for record in self.table.ordered() {
            let cue = record.cue.id;
            let tolerance = record.cue.tolerance;
            let cancelled = record.is_cancelled();

            let closable = record.with_dispatches(|dispatches| {
                for dispatch in dispatches.iter_mut() {
                    let deadline = dispatch.deadline(tolerance);
                    match dispatch.status {
                        DispatchStatus::Pending if cancelled => {
                            self.set_status(cue, dispatch, DispatchStatus::Cancelled, None);
                            report.cancelled.push((cue, dispatch.node));
                        }
                        DispatchStatus::Pending if now > deadline => {
                            self.miss(cue, dispatch, MissReason::Late, &mut report);
                        }
                        DispatchStatus::Pending if now >= dispatch.send_at => {
                            match self.send(&record, dispatch, deadline) {
                                Ok(()) => {
                                    dispatch.sent_at = Some(now);
                                    self.set_status(cue, dispatch, DispatchStatus::Sent, None);
                                    report.sent.push((cue, dispatch.node));
                                }
                                Err(e) => {
                                    let reason = MissReason::Transport(e.to_string());
                                    self.miss(cue, dispatch, reason, &mut report);
                                }
                            }
                        }
                        DispatchStatus::Sent if now > deadline => {
                            self.miss(cue, dispatch, MissReason::AckTimeout, &mut report);
                        }
                        _ => {}
                    }
                }

                let settled = dispatches.iter().all(|d| d.status.is_terminal());
                let window_end = dispatches.iter().map(|d| d.deadline(tolerance)).max();
                settled && (cancelled || window_end.map_or(true, |end| now > end))
            });

            if closable {
                self.table.remove(cue);
                tracing::debug!(cue = %cue, "cue window closed");
                self.events.publish(CoreEvent::CueClosed { cue });
                report.closed.push(cue);
            }
        }

        report
    }

    fn send(
        &self,
        record: &CueRecord,
        dispatch: &ScheduledDispatch,
        deadline: LocalTime,
    ) -> Result<(), TransportError> {
        let message = Message::Dispatch(DispatchBody {
            cue: record.cue.id,
            kind: record.cue.kind,
            execute_at: dispatch.execute_at_node,
            tolerance: record.cue.tolerance,
            payload: record.cue.payload.clone(),
        });
        let bytes = encode(self.local_id, message)
            .map_err(|e| TransportError::Io(format!("encode failed: {e}")))?;
        self.transport.send(dispatch.node, bytes, deadline)
    }

    fn set_status(
        &self,
        cue: CueId,
        dispatch: &mut ScheduledDispatch,
        status: DispatchStatus,
        reason: Option<MissReason>,
    ) {
        dispatch.status = status;
        dispatch.reason = reason.clone();
        tracing::debug!(cue = %cue, node = %dispatch.node, status = %status, "dispatch status");
        self.events.publish(CoreEvent::DispatchStatusChanged {
            cue,
            node: dispatch.node,
            status,
            reason,
        });
    }

    fn miss(
        &self,
        cue: CueId,
        dispatch: &mut ScheduledDispatch,
        reason: MissReason,
        report: &mut TickReport,
    ) {
        tracing::warn!(cue = %cue, node = %dispatch.node, reason = %reason, "dispatch missed");
        report.missed.push((cue, dispatch.node, reason.clone()));
        self.set_status(cue, dispatch, DispatchStatus::Missed, Some(reason));
    }

    /// Apply `f` to the open dispatch of `cue` for `node`
    fn with_open_dispatch(
        &self,
        cue: CueId,
        node: NodeId,
        f: impl FnOnce(&mut ScheduledDispatch, Duration) -> bool,
    ) -> bool {
        let Some(record) = self.table.get(cue) else {
            tracing::debug!(cue = %cue, node = %node, "report for unknown cue");
            return false;
        };
        let tolerance = record.cue.tolerance;
        record.with_dispatches(|dispatches| {
            match dispatches
                .iter_mut()
                .find(|d| d.node == node && !d.status.is_terminal())
            {
                Some(dispatch) => f(dispatch, tolerance),
                None => {
                    tracing::debug!(cue = %cue, node = %node, "report for settled dispatch ignored");
                    false
                }
            }
        })
    }

    /// Node acknowledged receipt. Returns true if the dispatch was acknowledged.
    pub fn on_ack(&self, node: NodeId, cue: CueId, now: LocalTime) -> bool {
        self.with_open_dispatch(cue, node, |dispatch, tolerance| {
            if dispatch.status != DispatchStatus::Sent {
                return false;
            }
            if now > dispatch.deadline(tolerance) {
                let reason = MissReason::AckTimeout;
                tracing::warn!(cue = %cue, node = %node, reason = %reason, "dispatch missed");
                self.set_status(cue, dispatch, DispatchStatus::Missed, Some(reason));
                return false;
            }
            dispatch.acked_at = Some(now);
            self.set_status(cue, dispatch, DispatchStatus::Acknowledged, None);
            true
        })
    }

    /// Node refused the dispatch
    pub fn on_nack(&self, node: NodeId, cue: CueId, reason: String) -> bool {
        self.with_open_dispatch(cue, node, |dispatch, _| {
            let reason = MissReason::Rejected(reason);
            tracing::warn!(cue = %cue, node = %node, reason = %reason, "dispatch missed");
            self.set_status(cue, dispatch, DispatchStatus::Missed, Some(reason));
            true
        })
    }

    /// The transport reported a delivery failure for one dispatch
    pub fn on_transport_failure(&self, node: NodeId, cue: CueId, reason: TransportError) -> bool {
        self.with_open_dispatch(cue, node, |dispatch, _| {
            let reason = MissReason::Transport(reason.to_string());
            tracing::warn!(cue = %cue, node = %node, reason = %reason, "dispatch missed");
            self.set_status(cue, dispatch, DispatchStatus::Missed, Some(reason));
            true
        })
    }

    /// Invalidate every open dispatch of a departed node.
    /// Returns the number of dispatches marked missed.
    pub fn on_node_departed(&self, node: NodeId) -> usize {
        let mut count = 0;
        for record in self.table.ordered() {
            let cue = record.cue.id;
            record.with_dispatches(|dispatches| {
                for dispatch in dispatches
                    .iter_mut()
                    .filter(|d| d.node == node && !d.status.is_terminal())
                {
                    self.set_status(
                        cue,
                        dispatch,
                        DispatchStatus::Missed,
                        Some(MissReason::NodeDeparted),
                    );
                    count += 1;
                }
            });
        }
        if count > 0 {
            tracing::warn!(node = %node, dispatches = count, "open dispatches lost to departed node");
        }
        count
    }

    /// Cancel a cue; takes effect on the next tick
    pub fn cancel(&self, cue: CueId) -> bool {
        self.table.cancel(cue)
    }

    /// Dispatch records of a live cue
    pub fn status(&self, cue: CueId) -> Option<Vec<ScheduledDispatch>> {
        self.table.get(cue).map(|record| record.dispatches())
    }

    /// Dispatches not yet in a terminal status
    pub fn pending_count(&self) -> usize {
        self.table
            .ordered()
            .iter()
            .map(|record| {
                record.with_dispatches(|dispatches| {
                    dispatches.iter().filter(|d| !d.status.is_terminal()).count()
                })
            })
            .sum()
    }
}
