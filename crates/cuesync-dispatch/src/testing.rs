//! Shared test fixture: a registry, sync engine and arbiter wired to a
//! scheduler, with an in-memory network for the coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use cuesync_core::{CapabilityDescriptor, CueKind, EventBus, LocalTime, NodeId, NodeTime};
use cuesync_peer::{AuthorityArbiter, PeerRegistry, RegistryConfig};
use cuesync_time::{ClockSyncEngine, LocalClock, ManualClock, RoundTripSample, SyncConfig};
use cuesync_transport::{IncomingReceiver, MemoryNetwork, MemoryTransport, Transport};
use cuesync_wire::Frame;

use crate::{CueScheduler, DispatchConfig, DispatchCoordinator, DispatchTable, SchedulerConfig};

pub const CONDUCTOR: NodeId = NodeId(0xC0);

pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub events: EventBus,
    pub registry: Arc<PeerRegistry>,
    pub sync: Arc<ClockSyncEngine>,
    pub arbiter: Arc<AuthorityArbiter>,
    pub table: Arc<DispatchTable>,
    pub scheduler: CueScheduler,
    pub network: Arc<MemoryNetwork>,
    inboxes: Mutex<HashMap<NodeId, IncomingReceiver>>,
}

impl Fixture {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(LocalTime::from_millis(10_000)));
        let events = EventBus::new(256);
        let registry = Arc::new(PeerRegistry::new(RegistryConfig::default(), events.clone()));
        let sync = Arc::new(ClockSyncEngine::new(SyncConfig::default()));
        let arbiter = Arc::new(AuthorityArbiter::new(events.clone()));
        let table = Arc::new(DispatchTable::new());
        let scheduler = CueScheduler::new(
            SchedulerConfig::default(),
            Arc::clone(&registry),
            Arc::clone(&sync),
            Arc::clone(&arbiter),
            Arc::clone(&table),
            events.clone(),
        );
        let network = MemoryNetwork::new(clock.clone());

        Fixture {
            clock,
            events,
            registry,
            sync,
            arbiter,
            table,
            scheduler,
            network,
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn now(&self) -> LocalTime {
        self.clock.now()
    }

    pub fn scheduler_with(&self, config: SchedulerConfig) -> CueScheduler {
        CueScheduler::new(
            config,
            Arc::clone(&self.registry),
            Arc::clone(&self.sync),
            Arc::clone(&self.arbiter),
            Arc::clone(&self.table),
            self.events.clone(),
        )
    }

    pub fn coordinator(&self) -> DispatchCoordinator<MemoryTransport> {
        DispatchCoordinator::new(
            DispatchConfig::default(),
            CONDUCTOR,
            Arc::clone(&self.table),
            self.network.endpoint(CONDUCTOR),
            self.events.clone(),
        )
    }

    /// Register a node and attach it to the network
    pub fn add_node(&self, id: NodeId, authority: bool, kinds: &[CueKind]) {
        let mut caps = CapabilityDescriptor::new().with_time_authority(authority);
        for kind in kinds {
            caps = caps.with_cue_kind(*kind);
        }
        self.registry.register(id, caps, self.now()).unwrap();

        let endpoint = self.network.endpoint(id);
        let inbox = endpoint.subscribe_incoming().unwrap();
        self.inboxes.lock().insert(id, inbox);
    }

    /// Run the election and propagate the new epoch
    pub fn elect(&self) {
        self.arbiter.elect(&self.registry.snapshot(), |change| {
            self.sync.authority_changed(change.current, change.epoch);
            self.registry.clear_estimates();
        });
    }

    /// Feed three clean probe exchanges: node clock `offset_ms` ahead of
    /// ours, symmetric one-way delay `one_way_ms`
    pub fn sync_node(&self, id: NodeId, offset_ms: i64, one_way_ms: i64) {
        let now = self.now().as_micros();
        let offset = offset_ms * 1000;
        let one_way = one_way_ms * 1000;
        for i in 0..3 {
            let t1 = now - 300_000 + i * 100_000;
            let t2 = t1 + one_way + offset;
            let t3 = t2 + 100;
            let t4 = t3 - offset + one_way;
            let sample = RoundTripSample::new(
                LocalTime::from_micros(t1),
                NodeTime::from_micros(t2),
                NodeTime::from_micros(t3),
                LocalTime::from_micros(t4),
                self.sync.epoch(),
            );
            self.sync.update(id, sample).unwrap();
        }
        self.registry
            .record_estimate(id, self.sync.estimate(id, self.now()))
            .unwrap();

        if let Some(authority) = self.arbiter.current_authority().node() {
            self.arbiter
                .maybe_resume(self.sync.accepted_since_epoch(authority));
        }
    }

    /// Frames delivered to `node` so far
    pub fn received(&self, node: NodeId) -> Vec<Frame> {
        let mut inboxes = self.inboxes.lock();
        let Some(inbox) = inboxes.get_mut(&node) else {
            return Vec::new();
        };
        let mut frames = Vec::new();
        while let Ok((_, bytes)) = inbox.try_recv() {
            frames.push(Frame::parse(bytes).unwrap());
        }
        frames
    }
}
