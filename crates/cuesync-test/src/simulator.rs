//! Network simulator for CUESYNC end-to-end testing
//!
//! A real `Conductor` runs against simulated nodes. Time advances in fixed
//! steps on a manual clock; each step delivers due frames, emits node
//! heartbeats, runs evaluation and probe rounds when due, then ticks the
//! dispatch coordinator. Frames cross seeded `LinkModel`s in both directions.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::mpsc;

use cuesync_core::{
    Authority, AuthorityTime, CapabilityDescriptor, CoreEvent, CueId, CueKind, LocalTime, NodeId,
    NodeTime, TransportError, TransportResult,
};
use cuesync_runtime::{Conductor, ConductorConfig, ConductorResult, Evaluation};
use cuesync_time::{LocalClock, ManualClock};
use cuesync_transport::{Incoming, IncomingReceiver, Transport, INCOMING_CHANNEL_CAPACITY};
use cuesync_wire::{encode, Frame, Message};

use crate::clock::ClockModel;
use crate::link::{LinkConfig, LinkModel};

/// Node id of the simulated conductor
pub const SIM_CONDUCTOR: NodeId = NodeId(0xC0);

/// Frames the conductor handed to its transport, awaiting the simulator
type Outbox = Arc<Mutex<Vec<(NodeId, Bytes)>>>;

/// Conductor side of the simulated network
pub struct SimTransport {
    clock: Arc<ManualClock>,
    outbox: Outbox,
    incoming: Mutex<Option<IncomingReceiver>>,
}

impl Transport for SimTransport {
    fn send(&self, node: NodeId, bytes: Bytes, deadline: LocalTime) -> TransportResult<()> {
        if self.clock.now() > deadline {
            return Err(TransportError::DeadlineExceeded);
        }
        self.outbox.lock().push((node, bytes));
        Ok(())
    }

    fn subscribe_incoming(&self) -> TransportResult<IncomingReceiver> {
        self.incoming.lock().take().ok_or(TransportError::Closed)
    }
}

/// Description of a node to add
#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub id: NodeId,
    pub clock: ClockModel,
    pub link: LinkConfig,
    pub authority: bool,
    pub kinds: Vec<CueKind>,
    pub latency_budget: Option<Duration>,
    /// Replies to clock probes
    pub answers_probes: bool,
}

impl NodeSpec {
    pub fn new(id: u64) -> Self {
        NodeSpec {
            id: NodeId::new(id),
            clock: ClockModel::perfect(),
            link: LinkConfig::lan(),
            authority: false,
            kinds: vec![CueKind::Trigger],
            latency_budget: None,
            answers_probes: true,
        }
    }

    pub fn clock(mut self, clock: ClockModel) -> Self {
        self.clock = clock;
        self
    }

    pub fn link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn authority(mut self) -> Self {
        self.authority = true;
        self
    }

    pub fn kinds(mut self, kinds: &[CueKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn latency_budget(mut self, budget: Duration) -> Self {
        self.latency_budget = Some(budget);
        self
    }

    /// Never answers probes, so it never has clock data
    pub fn without_probe_replies(mut self) -> Self {
        self.answers_probes = false;
        self
    }

    fn descriptor(&self) -> CapabilityDescriptor {
        let mut descriptor = CapabilityDescriptor::new().with_time_authority(self.authority);
        for kind in &self.kinds {
            descriptor = descriptor.with_cue_kind(*kind);
        }
        if let Some(budget) = self.latency_budget {
            descriptor = descriptor.with_latency_budget(budget);
        }
        descriptor
    }
}

/// A dispatch as seen by a node
#[derive(Clone, Debug, PartialEq)]
pub struct Execution {
    pub cue: CueId,
    /// Execution instant on the node clock
    pub execute_at: NodeTime,
    /// True time the dispatch arrived
    pub received_at: LocalTime,
    /// True time the node clock reaches `execute_at`
    pub executes_at: LocalTime,
}

/// Simulated node
pub struct SimNode {
    pub id: NodeId,
    pub clock: ClockModel,
    /// Node to conductor
    pub uplink: LinkModel,
    /// Conductor to node
    pub downlink: LinkModel,
    pub descriptor: CapabilityDescriptor,
    pub answers_probes: bool,
    pub sends_heartbeats: bool,
    pub sends_acks: bool,
    /// Refuse dispatches with this reason
    pub rejects: Option<String>,
    next_heartbeat: LocalTime,
    executions: Vec<Execution>,
}

impl SimNode {
    pub fn executions(&self) -> &[Execution] {
        &self.executions
    }

    pub fn executed(&self, cue: CueId) -> Option<&Execution> {
        self.executions.iter().find(|e| e.cue == cue)
    }

    /// Stop talking entirely, as if unplugged
    pub fn go_silent(&mut self) {
        self.sends_heartbeats = false;
        self.answers_probes = false;
        self.sends_acks = false;
    }

    fn receive(&mut self, bytes: Bytes, now: LocalTime) -> Vec<Message> {
        let Ok(frame) = Frame::parse(bytes) else {
            return Vec::new();
        };
        match frame.message {
            Message::Probe { seq, epoch, t1 } if self.answers_probes => {
                let stamp = self.clock.read(now);
                vec![Message::ProbeReply {
                    seq,
                    epoch,
                    t1,
                    t2: stamp,
                    t3: stamp,
                }]
            }
            Message::Dispatch(body) => {
                self.executions.push(Execution {
                    cue: body.cue,
                    execute_at: body.execute_at,
                    received_at: now,
                    executes_at: self.clock.true_time_of(body.execute_at),
                });
                if let Some(reason) = &self.rejects {
                    vec![Message::Nack {
                        cue: body.cue,
                        reason: reason.clone(),
                    }]
                } else if self.sends_acks {
                    vec![Message::Ack { cue: body.cue }]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Destination {
    Conductor,
    Node(NodeId),
}

#[derive(Debug)]
struct InFlight {
    at: LocalTime,
    seq: u64,
    from: NodeId,
    to: Destination,
    bytes: Bytes,
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}

impl Eq for InFlight {}

impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InFlight {
    // Min-heap on delivery time, then send order
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

/// Simulation configuration
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub seed: u64,
    /// Simulation step
    pub step: Duration,
    pub start: LocalTime,
    pub conductor: ConductorConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            seed: 0x5EED,
            step: Duration::from_millis(1),
            start: LocalTime::from_millis(1_000),
            conductor: ConductorConfig {
                node_id: SIM_CONDUCTOR,
                event_capacity: 1 << 16,
                ..ConductorConfig::default()
            },
        }
    }
}

impl SimConfig {
    pub fn with_seed(seed: u64) -> Self {
        SimConfig {
            seed,
            ..Self::default()
        }
    }
}

/// Simulation statistics
#[derive(Clone, Debug, Default)]
pub struct SimStats {
    pub steps: u64,
    pub frames_to_conductor: u64,
    pub frames_to_nodes: u64,
    pub rejected_frames: u64,
}

/// Conductor plus simulated nodes on a manual clock
pub struct Simulation {
    config: SimConfig,
    clock: Arc<ManualClock>,
    conductor: Conductor<SimTransport>,
    outbox: Outbox,
    conductor_tx: mpsc::Sender<Incoming>,
    conductor_rx: IncomingReceiver,
    nodes: BTreeMap<NodeId, SimNode>,
    in_flight: BinaryHeap<InFlight>,
    next_seq: u64,
    next_probe: LocalTime,
    next_evaluate: LocalTime,
    events: broadcast::Receiver<CoreEvent>,
    event_log: Vec<CoreEvent>,
    evaluations: Vec<(LocalTime, Evaluation)>,
    stats: SimStats,
}

impl Simulation {
    pub fn new(config: SimConfig) -> ConductorResult<Self> {
        let clock = Arc::new(ManualClock::new(config.start));
        let outbox: Outbox = Arc::new(Mutex::new(Vec::new()));
        let (conductor_tx, rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let transport = SimTransport {
            clock: Arc::clone(&clock),
            outbox: Arc::clone(&outbox),
            incoming: Mutex::new(Some(rx)),
        };

        let conductor = Conductor::new(config.conductor.clone(), transport, clock.clone())?;
        let conductor_rx = conductor.coordinator().transport().subscribe_incoming()?;
        let events = conductor.subscribe();

        Ok(Simulation {
            next_probe: config.start + config.conductor.probe_interval,
            next_evaluate: config.start + config.conductor.evaluate_interval,
            config,
            clock,
            conductor,
            outbox,
            conductor_tx,
            conductor_rx,
            nodes: BTreeMap::new(),
            in_flight: BinaryHeap::new(),
            next_seq: 0,
            events,
            event_log: Vec::new(),
            evaluations: Vec::new(),
            stats: SimStats::default(),
        })
    }

    pub fn now(&self) -> LocalTime {
        self.clock.now()
    }

    pub fn conductor(&self) -> &Conductor<SimTransport> {
        &self.conductor
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn node(&self, id: u64) -> Option<&SimNode> {
        self.nodes.get(&NodeId::new(id))
    }

    pub fn node_mut(&mut self, id: u64) -> Option<&mut SimNode> {
        self.nodes.get_mut(&NodeId::new(id))
    }

    /// Every event the conductor published so far
    pub fn events(&self) -> &[CoreEvent] {
        &self.event_log
    }

    /// Evaluation results with the instant they ran
    pub fn evaluations(&self) -> &[(LocalTime, Evaluation)] {
        &self.evaluations
    }

    /// Add a node; its hello goes out immediately
    pub fn add_node(&mut self, spec: NodeSpec) {
        let seed = self.config.seed ^ spec.id.0.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let now = self.now();
        let node = SimNode {
            id: spec.id,
            clock: spec.clock,
            uplink: LinkModel::new(spec.link.clone(), seed),
            downlink: LinkModel::new(spec.link.clone(), seed.wrapping_add(1)),
            descriptor: spec.descriptor(),
            answers_probes: spec.answers_probes,
            sends_heartbeats: true,
            sends_acks: true,
            rejects: None,
            next_heartbeat: now + self.config.conductor.registry.heartbeat_interval,
            executions: Vec::new(),
        };
        let hello = Message::Hello {
            capabilities: node.descriptor.clone(),
        };
        self.nodes.insert(spec.id, node);
        self.send_from_node(spec.id, hello, now);
    }

    /// Authority clock reading at true time `t`
    pub fn authority_time(&self, t: LocalTime) -> AuthorityTime {
        match self.conductor.arbiter().current_authority() {
            Authority::Node(id) => match self.nodes.get(&id) {
                Some(node) => node.clock.read_authority(t),
                None => AuthorityTime::from_micros(t.as_micros()),
            },
            Authority::Local => AuthorityTime::from_micros(t.as_micros()),
        }
    }

    /// True time at which the current authority clock reads `a`
    pub fn true_time_of(&self, a: AuthorityTime) -> LocalTime {
        match self.conductor.arbiter().current_authority() {
            Authority::Node(id) => match self.nodes.get(&id) {
                Some(node) => node.clock.true_time_of_authority(a),
                None => LocalTime::from_micros(a.as_micros()),
            },
            Authority::Local => LocalTime::from_micros(a.as_micros()),
        }
    }

    /// Advance by `duration`, one step at a time
    pub fn run_for(&mut self, duration: Duration) {
        let until = self.now() + duration;
        while self.now() < until {
            self.step();
        }
    }

    /// Step until `done` holds or `limit` elapses. Returns whether it held.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&Simulation) -> bool) -> bool {
        let until = self.now() + limit;
        while self.now() < until {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// One simulation step
    pub fn step(&mut self) {
        let now = self.clock.advance(self.config.step);
        self.stats.steps += 1;

        self.deliver_due(now);
        self.emit_heartbeats(now);

        if now >= self.next_evaluate {
            self.next_evaluate = now + self.config.conductor.evaluate_interval;
            let evaluation = self.conductor.evaluate();
            if evaluation.authority_change.is_some() {
                self.conductor.probe_round();
            }
            self.evaluations.push((now, evaluation));
        }
        if now >= self.next_probe {
            self.next_probe = now + self.config.conductor.probe_interval;
            self.conductor.probe_round();
        }

        self.conductor.tick();
        self.flush_outbox(now);
        self.collect_events();
    }

    fn deliver_due(&mut self, now: LocalTime) {
        while self.in_flight.peek().is_some_and(|frame| frame.at <= now) {
            let Some(frame) = self.in_flight.pop() else {
                break;
            };
            match frame.to {
                Destination::Conductor => {
                    self.stats.frames_to_conductor += 1;
                    if self.conductor_tx.try_send((frame.from, frame.bytes)).is_err() {
                        continue;
                    }
                    while let Ok((from, bytes)) = self.conductor_rx.try_recv() {
                        if self.conductor.handle_incoming(from, bytes).is_err() {
                            self.stats.rejected_frames += 1;
                        }
                    }
                }
                Destination::Node(id) => {
                    self.stats.frames_to_nodes += 1;
                    let replies = match self.nodes.get_mut(&id) {
                        Some(node) => node.receive(frame.bytes, now),
                        None => continue,
                    };
                    for reply in replies {
                        self.send_from_node(id, reply, now);
                    }
                }
            }
        }
        // Replies the conductor produced while handling frames
        self.flush_outbox(now);
    }

    fn emit_heartbeats(&mut self, now: LocalTime) {
        let interval = self.config.conductor.registry.heartbeat_interval;
        let due: Vec<NodeId> = self
            .nodes
            .values_mut()
            .filter(|node| now >= node.next_heartbeat)
            .map(|node| {
                node.next_heartbeat = now + interval;
                node.id
            })
            .collect();
        for id in due {
            if self.nodes.get(&id).is_some_and(|node| node.sends_heartbeats) {
                self.send_from_node(id, Message::Heartbeat, now);
            }
        }
    }

    fn send_from_node(&mut self, id: NodeId, message: Message, now: LocalTime) {
        let Ok(bytes) = encode(id, message) else {
            return;
        };
        let delays = match self.nodes.get_mut(&id) {
            Some(node) => node.uplink.transit(),
            None => return,
        };
        for delay in delays {
            self.schedule(now + delay, id, Destination::Conductor, bytes.clone());
        }
    }

    fn flush_outbox(&mut self, now: LocalTime) {
        let outgoing: Vec<(NodeId, Bytes)> = std::mem::take(&mut *self.outbox.lock());
        for (to, bytes) in outgoing {
            let delays = match self.nodes.get_mut(&to) {
                Some(node) => node.downlink.transit(),
                None => continue,
            };
            for delay in delays {
                self.schedule(now + delay, SIM_CONDUCTOR, Destination::Node(to), bytes.clone());
            }
        }
    }

    fn schedule(&mut self, at: LocalTime, from: NodeId, to: Destination, bytes: Bytes) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.push(InFlight {
            at,
            seq,
            from,
            to,
            bytes,
        });
    }

    fn collect_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.event_log.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuesync_core::Liveness;

    #[test]
    fn test_nodes_register_and_heartbeat() {
        let mut sim = Simulation::new(SimConfig::default()).unwrap();
        sim.add_node(NodeSpec::new(1).authority());
        sim.add_node(NodeSpec::new(2));
        sim.run_for(Duration::from_secs(5));

        let registry = sim.conductor().registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.liveness(NodeId::new(1)), Some(Liveness::Active));
        assert_eq!(registry.liveness(NodeId::new(2)), Some(Liveness::Active));
        assert!(sim.stats().frames_to_conductor > 10);
        assert_eq!(sim.stats().rejected_frames, 0);
    }

    #[test]
    fn test_authority_elected_and_probed() {
        let mut sim = Simulation::new(SimConfig::default()).unwrap();
        sim.add_node(NodeSpec::new(4).authority().clock(ClockModel::offset_ms(-35)));
        sim.run_for(Duration::from_secs(2));

        let arbiter = sim.conductor().arbiter();
        assert_eq!(arbiter.current_authority(), Authority::Node(NodeId::new(4)));
        assert!(!arbiter.is_paused());

        let now = sim.now();
        let estimate = sim.conductor().sync().estimate(NodeId::new(4), now).unwrap();
        assert!((estimate.offset.as_millis() + 35).abs() <= 1);
    }

    #[test]
    fn test_same_seed_same_run() {
        let run = |seed| {
            let mut sim = Simulation::new(SimConfig::with_seed(seed)).unwrap();
            sim.add_node(NodeSpec::new(1).authority().link(LinkConfig::wireless()));
            sim.add_node(NodeSpec::new(2).link(LinkConfig::wireless()));
            sim.run_for(Duration::from_secs(3));
            sim.conductor().sync().estimate(NodeId::new(2), sim.now())
        };
        assert_eq!(run(11), run(11));
    }
}
