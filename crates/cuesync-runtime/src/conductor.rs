//! Conductor - the runtime loop wiring every CUESYNC component
//!
//! One conductor process owns the registry, the clock sync engine, the
//! authority arbiter and the dispatch pipeline. Its loop has four sources:
//! 1. Dispatch tick: due dispatches go out, expired ones are missed
//! 2. Probe round: every live node gets a clock probe
//! 3. Evaluation: liveness timeouts, stale clocks, re-election
//! 4. Incoming frames: hello, heartbeat, probe replies, acks
//!
//! Every component call is synchronous; only the loop itself awaits.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;

use cuesync_core::{
    CapabilityDescriptor, ConfigResult, CoreEvent, Cue, CueId, Epoch, EventBus, Liveness,
    LocalTime, NodeId, NodeTime, SchedulingResult, TransitionReason, TransportError,
};
use cuesync_dispatch::{
    CueScheduler, DispatchCoordinator, DispatchTable, ScheduleHandle, ScheduledDispatch,
    TickReport,
};
use cuesync_peer::{
    AuthorityArbiter, AuthorityChange, LivenessTransition, PeerRegistry, Registration,
};
use cuesync_time::{ClockSyncEngine, LocalClock, RoundTripSample, SampleVerdict};
use cuesync_transport::Transport;
use cuesync_wire::{encode, Frame, Message};

use crate::{ConductorConfig, ConductorError, ConductorResult};

/// Counters for the conductor loop
#[derive(Clone, Debug, Default)]
pub struct ConductorStats {
    pub ticks: u64,
    pub frames_in: u64,
    pub frames_dropped: u64,
    pub probes_sent: u64,
    pub probe_failures: u64,
    pub samples_accepted: u64,
    pub samples_rejected: u64,
    pub evaluations: u64,
    pub authority_changes: u64,
}

/// Result of one probe round, in node id order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProbeRound {
    pub epoch: Epoch,
    pub sent: Vec<NodeId>,
    pub failed: Vec<(NodeId, TransportError)>,
}

/// Result of one evaluation pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Evaluation {
    pub transitions: Vec<LivenessTransition>,
    pub authority_change: Option<AuthorityChange>,
    /// Departed nodes dropped from the registry
    pub pruned: Vec<NodeId>,
}

#[derive(Clone, Copy, Debug)]
struct PendingProbe {
    node: NodeId,
    t1: LocalTime,
    epoch: Epoch,
}

/// Outstanding probes by sequence number
#[derive(Debug, Default)]
struct ProbeBook {
    next_seq: u32,
    pending: HashMap<u32, PendingProbe>,
}

impl ProbeBook {
    fn open(&mut self, node: NodeId, t1: LocalTime, epoch: Epoch) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.pending.insert(seq, PendingProbe { node, t1, epoch });
        seq
    }

    /// Drop probes sent before `cutoff`; their replies would be useless
    fn expire(&mut self, cutoff: LocalTime) {
        self.pending.retain(|_, probe| probe.t1 >= cutoff);
    }
}

/// The CUESYNC conductor
pub struct Conductor<T: Transport> {
    config: ConductorConfig,
    clock: Arc<dyn LocalClock>,
    events: EventBus,
    registry: Arc<PeerRegistry>,
    sync: Arc<ClockSyncEngine>,
    arbiter: Arc<AuthorityArbiter>,
    table: Arc<DispatchTable>,
    scheduler: CueScheduler,
    coordinator: DispatchCoordinator<T>,
    probes: Mutex<ProbeBook>,
    /// When the current authority was elected
    elected_at: Mutex<LocalTime>,
    stats: Mutex<ConductorStats>,
}

impl<T: Transport> Conductor<T> {
    /// Wire up every component. Fails if the configuration is invalid.
    pub fn new(config: ConductorConfig, transport: T, clock: Arc<dyn LocalClock>) -> ConfigResult<Self> {
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let registry = Arc::new(PeerRegistry::new(config.registry.clone(), events.clone()));
        let sync = Arc::new(ClockSyncEngine::new(config.sync.clone()));
        let arbiter = Arc::new(AuthorityArbiter::new(events.clone()));
        let table = Arc::new(DispatchTable::new());
        let scheduler = CueScheduler::new(
            config.scheduler.clone(),
            Arc::clone(&registry),
            Arc::clone(&sync),
            Arc::clone(&arbiter),
            Arc::clone(&table),
            events.clone(),
        );
        let coordinator = DispatchCoordinator::new(
            config.dispatch.clone(),
            config.node_id,
            Arc::clone(&table),
            transport,
            events.clone(),
        );

        Ok(Conductor {
            config,
            clock: Arc::clone(&clock),
            events,
            registry,
            sync,
            arbiter,
            table,
            scheduler,
            coordinator,
            probes: Mutex::new(ProbeBook::default()),
            elected_at: Mutex::new(clock.now()),
            stats: Mutex::new(ConductorStats::default()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn now(&self) -> LocalTime {
        self.clock.now()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn sync(&self) -> &Arc<ClockSyncEngine> {
        &self.sync
    }

    pub fn arbiter(&self) -> &Arc<AuthorityArbiter> {
        &self.arbiter
    }

    pub fn coordinator(&self) -> &DispatchCoordinator<T> {
        &self.coordinator
    }

    pub fn stats(&self) -> ConductorStats {
        self.stats.lock().clone()
    }

    /// Schedule a cue against the current clock
    pub fn submit(&self, cue: Cue) -> SchedulingResult<ScheduleHandle> {
        self.scheduler.submit(cue, self.now())
    }

    pub fn cancel(&self, cue: CueId) -> bool {
        self.scheduler.cancel(cue)
    }

    /// Dispatch records of a cue whose window is still open
    pub fn status(&self, cue: CueId) -> Option<Vec<ScheduledDispatch>> {
        self.coordinator.status(cue)
    }

    /// Number of cues whose window is still open
    pub fn live_cues(&self) -> usize {
        self.table.len()
    }

    /// Drive the dispatch coordinator to the current instant
    pub fn tick(&self) -> TickReport {
        let report = self.coordinator.tick(self.now());
        self.stats.lock().ticks += 1;
        report
    }

    /// Handle one frame received from `from`
    pub fn handle_incoming(&self, from: NodeId, bytes: Bytes) -> ConductorResult<()> {
        let now = self.now();
        self.stats.lock().frames_in += 1;

        let frame = match Frame::parse(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.lock().frames_dropped += 1;
                return Err(e.into());
            }
        };

        match frame.message {
            Message::Hello { capabilities } => self.on_hello(from, capabilities, now),
            Message::Heartbeat => {
                self.registry.heartbeat(from, now)?;
                Ok(())
            }
            Message::Probe { seq, epoch, t1 } => self.answer_probe(from, seq, epoch, t1, now),
            Message::ProbeReply {
                seq,
                epoch,
                t1,
                t2,
                t3,
            } => self.on_probe_reply(from, seq, epoch, t1, t2, t3, now),
            Message::Ack { cue } => {
                if !self.coordinator.on_ack(from, cue, now) {
                    tracing::debug!(node = %from, cue = %cue, "ack for no open dispatch");
                }
                Ok(())
            }
            Message::Nack { cue, reason } => {
                self.coordinator.on_nack(from, cue, reason);
                Ok(())
            }
            message @ Message::Dispatch(_) => Err(ConductorError::UnexpectedMessage {
                kind: message.kind(),
                node: from,
            }),
        }
    }

    fn on_hello(
        &self,
        from: NodeId,
        capabilities: CapabilityDescriptor,
        now: LocalTime,
    ) -> ConductorResult<()> {
        if self.registry.register(from, capabilities, now)? == Registration::Fresh {
            // A returning id starts over with no clock history
            self.sync.forget(from);
        }
        Ok(())
    }

    /// Nodes may measure the conductor clock too
    fn answer_probe(
        &self,
        from: NodeId,
        seq: u32,
        epoch: Epoch,
        t1: LocalTime,
        now: LocalTime,
    ) -> ConductorResult<()> {
        let stamp = NodeTime::from_micros(now.as_micros());
        let reply = Message::ProbeReply {
            seq,
            epoch,
            t1,
            t2: stamp,
            t3: stamp,
        };
        let bytes = encode(self.config.node_id, reply)?;
        self.coordinator
            .transport()
            .send(from, bytes, now + self.config.probe_interval)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_probe_reply(
        &self,
        from: NodeId,
        seq: u32,
        epoch: Epoch,
        t1: LocalTime,
        t2: NodeTime,
        t3: NodeTime,
        t4: LocalTime,
    ) -> ConductorResult<()> {
        let pending = {
            let mut book = self.probes.lock();
            match book.pending.get(&seq) {
                Some(p) if p.node == from && p.t1 == t1 && p.epoch == epoch => {
                    book.pending.remove(&seq)
                }
                _ => None,
            }
        };
        let Some(probe) = pending else {
            return Err(ConductorError::UnknownProbe { seq, node: from });
        };

        let sample = RoundTripSample::new(probe.t1, t2, t3, t4, probe.epoch);
        let outcome = self.sync.update(from, sample)?;
        {
            let mut stats = self.stats.lock();
            match outcome.verdict {
                SampleVerdict::Rejected(_) => stats.samples_rejected += 1,
                SampleVerdict::Accepted | SampleVerdict::ClockStep => stats.samples_accepted += 1,
            }
        }

        self.registry.record_estimate(from, outcome.estimate)?;
        if outcome.suspect {
            self.registry
                .mark_suspect(from, TransitionReason::ClockRejections, t4)?;
        } else if outcome.estimate.is_some() {
            self.registry.clock_recovered(from, t4)?;
        }

        if self.arbiter.current_authority().node() == Some(from) {
            self.arbiter
                .maybe_resume(self.sync.accepted_since_epoch(from));
        }
        Ok(())
    }

    /// Probe every live node, in node id order
    pub fn probe_round(&self) -> ProbeRound {
        let now = self.now();
        let epoch = self.sync.epoch();
        let deadline = now + self.config.probe_interval;

        let targets: Vec<NodeId> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|node| node.liveness != Liveness::Departed)
            .map(|node| node.id)
            .collect();

        let seqs: Vec<u32> = {
            let mut book = self.probes.lock();
            book.expire(now.saturating_sub(self.config.sync.max_age));
            targets
                .iter()
                .map(|node| book.open(*node, now, epoch))
                .collect()
        };

        let mut results: Vec<Option<TransportError>> = vec![None; targets.len()];
        for (index, (node, seq)) in targets.iter().zip(&seqs).enumerate() {
            let probe = Message::Probe {
                seq: *seq,
                epoch,
                t1: now,
            };
            let sent = encode(self.config.node_id, probe)
                .map_err(|e| TransportError::Io(e.to_string()))
                .and_then(|bytes| self.coordinator.transport().send(*node, bytes, deadline));
            if let Err(e) = sent {
                results[index] = Some(e);
            }
        }

        let mut round = ProbeRound {
            epoch,
            ..ProbeRound::default()
        };
        let mut book = self.probes.lock();
        for (index, result) in results.into_iter().enumerate() {
            let node = targets[index];
            match result {
                None => round.sent.push(node),
                Some(e) => {
                    book.pending.remove(&seqs[index]);
                    tracing::debug!(node = %node, error = %e, "probe send failed");
                    round.failed.push((node, e));
                }
            }
        }
        drop(book);

        let mut stats = self.stats.lock();
        stats.probes_sent += round.sent.len() as u64;
        stats.probe_failures += round.failed.len() as u64;
        round
    }

    /// Apply liveness timeouts and stale clocks, route departures, re-elect
    pub fn evaluate(&self) -> Evaluation {
        let now = self.now();
        let mut transitions = self.registry.evaluate(now);

        let mut stale = self.sync.stale_nodes(now);
        if let Some(authority) = self.unproven_authority(now) {
            if !stale.contains(&authority) {
                stale.push(authority);
            }
        }
        for node in stale {
            match self
                .registry
                .mark_suspect(node, TransitionReason::StaleClock, now)
            {
                Ok(Some(transition)) => transitions.push(transition),
                Ok(None) => {}
                Err(e) => tracing::debug!(node = %node, error = %e, "stale clock for unknown node"),
            }
        }

        for transition in transitions.iter().filter(|t| t.to == Liveness::Departed) {
            let lost = self.coordinator.on_node_departed(transition.node);
            self.sync.forget(transition.node);
            tracing::debug!(node = %transition.node, dispatches = lost, "departure routed");
        }

        let authority_change = self.reelect(now);
        let pruned = self.registry.prune_departed();

        let mut stats = self.stats.lock();
        stats.evaluations += 1;
        if authority_change.is_some() {
            stats.authority_changes += 1;
        }

        Evaluation {
            transitions,
            authority_change,
            pruned,
        }
    }

    /// Authority that has not had one sample accepted within max age of
    /// its election
    fn unproven_authority(&self, now: LocalTime) -> Option<NodeId> {
        let id = self.arbiter.current_authority().node()?;
        let elected_at = *self.elected_at.lock();
        let overdue = now - elected_at > self.config.sync.max_age;
        (overdue && self.sync.accepted_since_epoch(id) == 0).then_some(id)
    }

    /// Re-run the election unless the current authority is still registered
    /// and eligible. A suspect authority keeps its role until it departs.
    fn reelect(&self, now: LocalTime) -> Option<AuthorityChange> {
        let snapshot = self.registry.snapshot();
        let standing = self.arbiter.current_authority().node().is_some_and(|id| {
            snapshot.iter().any(|node| {
                node.id == id && node.liveness != Liveness::Departed && node.is_authority_eligible()
            })
        });
        if standing {
            return None;
        }

        let change = self.arbiter.elect(&snapshot, |change| {
            self.sync.authority_changed(change.current, change.epoch);
            self.registry.clear_estimates();
            // Replies to probes of the old epoch would be refused anyway
            self.probes.lock().pending.clear();
        })?;
        *self.elected_at.lock() = now;
        Some(change)
    }

    /// Run until `shutdown` resolves or the transport closes
    pub async fn run<F>(&self, shutdown: F) -> ConductorResult<()>
    where
        F: Future<Output = ()>,
    {
        let mut incoming = self.coordinator.transport().subscribe_incoming()?;

        let mut tick = tokio::time::interval(self.config.dispatch.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut probe = tokio::time::interval(self.config.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut evaluate = tokio::time::interval(self.config.evaluate_interval);
        evaluate.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        tracing::info!(node = %self.config.node_id, "conductor running");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(
                        node = %self.config.node_id,
                        open_dispatches = self.coordinator.pending_count(),
                        "conductor shutting down"
                    );
                    return Ok(());
                }
                _ = tick.tick() => {
                    let started = Instant::now();
                    let report = self.tick();
                    if !report.is_idle() {
                        tracing::trace!(
                            sent = report.sent.len(),
                            missed = report.missed.len(),
                            closed = report.closed.len(),
                            elapsed_us = started.elapsed().as_micros() as u64,
                            "dispatch tick"
                        );
                    }
                }
                _ = probe.tick() => {
                    self.probe_round();
                }
                _ = evaluate.tick() => {
                    let evaluation = self.evaluate();
                    if evaluation.authority_change.is_some() {
                        // Probe right away so submissions resume quickly
                        self.probe_round();
                    }
                }
                received = incoming.recv() => match received {
                    Some((from, bytes)) => {
                        if let Err(e) = self.handle_incoming(from, bytes) {
                            tracing::debug!(node = %from, error = %e, "incoming frame dropped");
                        }
                    }
                    None => {
                        tracing::warn!("transport closed");
                        return Err(TransportError::Closed.into());
                    }
                },
            }
        }
    }
}
