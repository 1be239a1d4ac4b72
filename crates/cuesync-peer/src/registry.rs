//! Peer Registry - connected nodes, capabilities and liveness
//!
//! Each node entry sits behind its own lock; the node map is write locked
//! only to insert or remove entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use cuesync_core::{
    Capabilities, CapabilityDescriptor, ConfigError, ConfigResult, CoreEvent, EventBus, Liveness,
    LocalTime, NodeId, OffsetEstimate, RegistryError, RegistryResult, TransitionReason,
};

/// Peer registry configuration
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Expected heartbeat period of every node
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before a node becomes suspect
    pub missed_heartbeat_threshold: u32,
    /// Time a node may stay suspect before it departs
    pub suspect_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            heartbeat_interval: Duration::from_secs(1),
            missed_heartbeat_threshold: 3,
            suspect_grace: Duration::from_secs(5),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "registry.heartbeat_interval",
            });
        }
        // Timestamps have microsecond resolution
        if self.heartbeat_interval < Duration::from_micros(1) {
            return Err(ConfigError::OutOfRange {
                field: "registry.heartbeat_interval",
                value: self.heartbeat_interval.as_secs_f64(),
            });
        }
        if self.missed_heartbeat_threshold == 0 {
            return Err(ConfigError::NotPositive {
                field: "registry.missed_heartbeat_threshold",
            });
        }
        Ok(())
    }

    /// Silence after which an active node becomes suspect
    pub fn suspect_after(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.missed_heartbeat_threshold)
    }
}

/// Registry view of one node
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub capabilities: Capabilities,
    pub liveness: Liveness,
    /// Last heartbeat or registration, local clock
    pub last_seen: LocalTime,
    pub registered_at: LocalTime,
    pub suspect_since: Option<LocalTime>,
    /// Why the node is suspect, while it is
    pub suspect_reason: Option<TransitionReason>,
    /// Most recent clock estimate reported by the sync engine
    pub estimate: Option<OffsetEstimate>,
}

impl Node {
    fn new(id: NodeId, capabilities: Capabilities, now: LocalTime) -> Self {
        Node {
            id,
            capabilities,
            liveness: Liveness::Active,
            last_seen: now,
            registered_at: now,
            suspect_since: None,
            suspect_reason: None,
            estimate: None,
        }
    }

    /// Suspect for its clock rather than its heartbeats. Only a fresh
    /// estimate clears it.
    pub fn is_clock_suspect(&self) -> bool {
        self.suspect_reason
            .as_ref()
            .is_some_and(TransitionReason::is_clock_fault)
    }

    pub fn is_authority_eligible(&self) -> bool {
        self.capabilities.time_authority
    }
}

/// A liveness change, returned to the caller for routing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LivenessTransition {
    pub node: NodeId,
    pub from: Liveness,
    pub to: Liveness,
    pub reason: TransitionReason,
    pub at: LocalTime,
}

/// Outcome of `register`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// New node, or a departed id joining again with reset state
    Fresh,
    /// Known node re-announced; capabilities replaced
    Updated,
}

/// Peer Registry
pub struct PeerRegistry {
    config: RegistryConfig,
    nodes: RwLock<HashMap<NodeId, Arc<Mutex<Node>>>>,
    events: EventBus,
}

impl PeerRegistry {
    pub fn new(config: RegistryConfig, events: EventBus) -> Self {
        PeerRegistry {
            config,
            nodes: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn entry(&self, id: NodeId) -> Option<Arc<Mutex<Node>>> {
        self.nodes.read().get(&id).cloned()
    }

    fn transition(
        &self,
        node: &mut Node,
        to: Liveness,
        reason: TransitionReason,
        now: LocalTime,
    ) -> Option<LivenessTransition> {
        let from = node.liveness;
        if !from.can_transition_to(to) {
            return None;
        }
        node.liveness = to;
        (node.suspect_since, node.suspect_reason) = match to {
            Liveness::Suspect => (Some(now), Some(reason.clone())),
            _ => (None, None),
        };

        tracing::info!(
            node = %node.id,
            from = %from,
            to = %to,
            reason = %reason,
            "node liveness changed"
        );
        self.events.publish(CoreEvent::LivenessChanged {
            node: node.id,
            from,
            to,
            reason: reason.clone(),
        });

        Some(LivenessTransition {
            node: node.id,
            from,
            to,
            reason,
            at: now,
        })
    }

    /// Register a node or refresh its capabilities
    pub fn register(
        &self,
        id: NodeId,
        descriptor: CapabilityDescriptor,
        now: LocalTime,
    ) -> RegistryResult<Registration> {
        let capabilities = Capabilities::from_descriptor(descriptor)?;

        if let Some(entry) = self.entry(id) {
            let mut node = entry.lock();
            if node.liveness != Liveness::Departed {
                node.capabilities = capabilities;
                node.last_seen = now;
                if node.liveness == Liveness::Suspect && !node.is_clock_suspect() {
                    self.transition(&mut node, Liveness::Active, TransitionReason::HeartbeatResumed, now);
                }
                tracing::debug!(node = %id, "node capabilities updated");
                return Ok(Registration::Updated);
            }
        }

        self.nodes
            .write()
            .insert(id, Arc::new(Mutex::new(Node::new(id, capabilities, now))));

        tracing::info!(node = %id, "node registered");
        self.events.publish(CoreEvent::NodeRegistered { node: id });
        Ok(Registration::Fresh)
    }

    /// Record a heartbeat. A node suspect for missed heartbeats becomes
    /// active again; one suspect for its clock stays suspect.
    pub fn heartbeat(&self, id: NodeId, now: LocalTime) -> RegistryResult<Option<LivenessTransition>> {
        let entry = self.entry(id).ok_or(RegistryError::UnknownNode(id))?;
        let mut node = entry.lock();

        match node.liveness {
            Liveness::Departed => Err(RegistryError::Departed(id)),
            Liveness::Active => {
                node.last_seen = node.last_seen.max(now);
                Ok(None)
            }
            Liveness::Suspect => {
                node.last_seen = node.last_seen.max(now);
                if node.is_clock_suspect() {
                    return Ok(None);
                }
                Ok(self.transition(&mut node, Liveness::Active, TransitionReason::HeartbeatResumed, now))
            }
        }
    }

    /// A fresh clock estimate clears clock suspicion
    pub fn clock_recovered(&self, id: NodeId, now: LocalTime) -> RegistryResult<Option<LivenessTransition>> {
        let entry = self.entry(id).ok_or(RegistryError::UnknownNode(id))?;
        let mut node = entry.lock();

        match node.liveness {
            Liveness::Departed => Err(RegistryError::Departed(id)),
            Liveness::Suspect if node.is_clock_suspect() => Ok(self.transition(
                &mut node,
                Liveness::Active,
                TransitionReason::ClockRecovered,
                now,
            )),
            _ => Ok(None),
        }
    }

    /// Mark an active node suspect on behalf of another component
    pub fn mark_suspect(
        &self,
        id: NodeId,
        reason: TransitionReason,
        now: LocalTime,
    ) -> RegistryResult<Option<LivenessTransition>> {
        let entry = self.entry(id).ok_or(RegistryError::UnknownNode(id))?;
        let mut node = entry.lock();

        match node.liveness {
            Liveness::Departed => Err(RegistryError::Departed(id)),
            Liveness::Suspect => Ok(None),
            Liveness::Active => Ok(self.transition(&mut node, Liveness::Suspect, reason, now)),
        }
    }

    /// Remove a node. A node that had not departed yet departs first.
    pub fn remove(&self, id: NodeId, now: LocalTime) -> Option<LivenessTransition> {
        let entry = self.nodes.write().remove(&id)?;
        let mut node = entry.lock();
        let transition = self.transition(&mut node, Liveness::Departed, TransitionReason::Removed, now);

        tracing::info!(node = %id, "node removed");
        self.events.publish(CoreEvent::NodeRemoved { node: id });
        transition
    }

    /// Apply heartbeat timeouts and suspect grace expiry
    pub fn evaluate(&self, now: LocalTime) -> Vec<LivenessTransition> {
        let suspect_after = self.config.suspect_after();
        let mut entries: Vec<(NodeId, Arc<Mutex<Node>>)> = self
            .nodes
            .read()
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();
        entries.sort_by_key(|(id, _)| *id);

        let mut transitions = Vec::new();
        for (_, entry) in entries {
            let mut node = entry.lock();
            let transition = match node.liveness {
                Liveness::Active => {
                    let silent = now - node.last_seen;
                    if silent > suspect_after {
                        let missed = silent
                            .as_nanos()
                            .checked_div(self.config.heartbeat_interval.as_nanos())
                            .unwrap_or(u128::MAX)
                            .min(u32::MAX as u128) as u32;
                        self.transition(
                            &mut node,
                            Liveness::Suspect,
                            TransitionReason::MissedHeartbeats(missed),
                            now,
                        )
                    } else {
                        None
                    }
                }
                Liveness::Suspect => match node.suspect_since {
                    Some(since) if now - since > self.config.suspect_grace => self.transition(
                        &mut node,
                        Liveness::Departed,
                        TransitionReason::GraceExpired,
                        now,
                    ),
                    _ => None,
                },
                Liveness::Departed => None,
            };
            transitions.extend(transition);
        }
        transitions
    }

    /// Store the latest clock estimate for a node
    pub fn record_estimate(&self, id: NodeId, estimate: Option<OffsetEstimate>) -> RegistryResult<()> {
        let entry = self.entry(id).ok_or(RegistryError::UnknownNode(id))?;
        entry.lock().estimate = estimate;
        Ok(())
    }

    /// Drop every stored clock estimate (authority change)
    pub fn clear_estimates(&self) {
        for entry in self.nodes.read().values() {
            entry.lock().estimate = None;
        }
    }

    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.entry(id).map(|entry| entry.lock().clone())
    }

    pub fn liveness(&self, id: NodeId) -> Option<Liveness> {
        self.entry(id).map(|entry| entry.lock().liveness)
    }

    /// All nodes ordered by id
    pub fn snapshot(&self) -> Vec<Node> {
        let entries: Vec<Arc<Mutex<Node>>> = self.nodes.read().values().cloned().collect();
        let mut nodes: Vec<Node> = entries.iter().map(|entry| entry.lock().clone()).collect();
        nodes.sort_by_key(|node| node.id);
        nodes
    }

    /// Remove departed entries, returning their ids in order
    pub fn prune_departed(&self) -> Vec<NodeId> {
        let mut nodes = self.nodes.write();
        let mut departed: Vec<NodeId> = nodes
            .iter()
            .filter(|(_, entry)| entry.lock().liveness == Liveness::Departed)
            .map(|(id, _)| *id)
            .collect();
        departed.sort();
        for id in &departed {
            nodes.remove(id);
            self.events.publish(CoreEvent::NodeRemoved { node: *id });
        }
        departed
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.nodes
            .read()
            .values()
            .filter(|entry| entry.lock().liveness.is_active())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuesync_core::{ClockOffset, CueKind, Epoch};

    fn registry() -> (PeerRegistry, EventBus) {
        let events = EventBus::new(64);
        (PeerRegistry::new(RegistryConfig::default(), events.clone()), events)
    }

    fn lighting() -> CapabilityDescriptor {
        CapabilityDescriptor::new().with_cue_kind(CueKind::Lighting)
    }

    fn ms(v: i64) -> LocalTime {
        LocalTime::from_millis(v)
    }

    #[test]
    fn test_register_and_snapshot_order() {
        let (registry, _) = registry();
        for id in [3, 1, 2] {
            assert_eq!(
                registry.register(NodeId::new(id), lighting(), ms(0)).unwrap(),
                Registration::Fresh
            );
        }

        let ids: Vec<NodeId> = registry.snapshot().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]);
        assert_eq!(registry.active_count(), 3);
    }

    #[test]
    fn test_missed_heartbeats_then_grace() {
        let (registry, events) = registry();
        let mut rx = events.subscribe();
        let node = NodeId::new(2);
        registry.register(node, lighting(), ms(0)).unwrap();

        // 3 missed heartbeats at 1s interval: still active at exactly 3s
        assert!(registry.evaluate(ms(3_000)).is_empty());

        let transitions = registry.evaluate(ms(5_000));
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, Liveness::Suspect);
        assert_eq!(transitions[0].reason, TransitionReason::MissedHeartbeats(5));

        // Grace runs from the suspect transition
        assert!(registry.evaluate(ms(10_000)).is_empty());
        let transitions = registry.evaluate(ms(10_001));
        assert_eq!(transitions[0].to, Liveness::Departed);
        assert_eq!(transitions[0].reason, TransitionReason::GraceExpired);

        assert!(matches!(rx.try_recv(), Ok(CoreEvent::NodeRegistered { .. })));
        assert!(matches!(
            rx.try_recv(),
            Ok(CoreEvent::LivenessChanged {
                to: Liveness::Suspect,
                ..
            })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(CoreEvent::LivenessChanged {
                to: Liveness::Departed,
                ..
            })
        ));
    }

    #[test]
    fn test_heartbeat_recovers_suspect() {
        let (registry, _) = registry();
        let node = NodeId::new(2);
        registry.register(node, lighting(), ms(0)).unwrap();
        registry.evaluate(ms(4_000));
        assert_eq!(registry.liveness(node), Some(Liveness::Suspect));

        let transition = registry.heartbeat(node, ms(4_500)).unwrap().unwrap();
        assert_eq!(transition.from, Liveness::Suspect);
        assert_eq!(transition.to, Liveness::Active);
        assert_eq!(registry.get(node).unwrap().suspect_since, None);

        // Plain heartbeat on an active node
        assert_eq!(registry.heartbeat(node, ms(5_000)).unwrap(), None);
    }

    #[test]
    fn test_clock_suspicion_survives_heartbeats() {
        let (registry, _) = registry();
        let node = NodeId::new(3);
        registry.register(node, lighting(), ms(0)).unwrap();
        registry.mark_suspect(node, TransitionReason::StaleClock, ms(100)).unwrap();
        assert!(registry.get(node).unwrap().is_clock_suspect());

        assert_eq!(registry.heartbeat(node, ms(1_000)).unwrap(), None);
        registry.register(node, lighting(), ms(1_500)).unwrap();
        assert_eq!(registry.liveness(node), Some(Liveness::Suspect));

        // Heartbeats keep arriving, yet the grace period still runs out
        registry.heartbeat(node, ms(5_000)).unwrap();
        let transitions = registry.evaluate(ms(5_101));
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, Liveness::Departed);
        assert_eq!(transitions[0].reason, TransitionReason::GraceExpired);
    }

    #[test]
    fn test_fresh_estimate_clears_clock_suspicion() {
        let (registry, _) = registry();
        let node = NodeId::new(3);
        registry.register(node, lighting(), ms(0)).unwrap();
        registry
            .mark_suspect(node, TransitionReason::ClockRejections, ms(100))
            .unwrap();

        let transition = registry.clock_recovered(node, ms(600)).unwrap().unwrap();
        assert_eq!(transition.to, Liveness::Active);
        assert_eq!(transition.reason, TransitionReason::ClockRecovered);
        assert_eq!(registry.get(node).unwrap().suspect_reason, None);

        // Heartbeat suspicion is not the clock's to clear
        registry.evaluate(ms(4_000));
        assert_eq!(registry.liveness(node), Some(Liveness::Suspect));
        assert_eq!(registry.clock_recovered(node, ms(4_100)).unwrap(), None);
        assert_eq!(registry.liveness(node), Some(Liveness::Suspect));
    }

    #[test]
    fn test_sub_microsecond_heartbeat_interval_rejected() {
        let config = RegistryConfig {
            heartbeat_interval: Duration::from_nanos(500),
            ..RegistryConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "registry.heartbeat_interval",
                ..
            })
        ));
        assert!(RegistryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_departed_is_terminal_until_reregistration() {
        let (registry, _) = registry();
        let node = NodeId::new(7);
        registry.register(node, lighting(), ms(0)).unwrap();
        registry.mark_suspect(node, TransitionReason::StaleClock, ms(1)).unwrap();
        registry.evaluate(ms(6_000));
        assert_eq!(registry.liveness(node), Some(Liveness::Departed));

        assert_eq!(
            registry.heartbeat(node, ms(6_100)),
            Err(RegistryError::Departed(node))
        );

        // Same id joins again: fresh entry, offset data reset
        let estimate = OffsetEstimate {
            offset: ClockOffset::from_millis(5),
            drift_ppm: 0.0,
            confidence: Duration::from_millis(1),
            samples: 3,
            measured_at: ms(0),
            epoch: Epoch::INITIAL,
        };
        registry.record_estimate(node, Some(estimate)).unwrap();
        assert_eq!(
            registry.register(node, lighting(), ms(7_000)).unwrap(),
            Registration::Fresh
        );
        let fresh = registry.get(node).unwrap();
        assert_eq!(fresh.liveness, Liveness::Active);
        assert_eq!(fresh.estimate, None);
        assert_eq!(fresh.registered_at, ms(7_000));
    }

    #[test]
    fn test_remove_and_prune() {
        let (registry, _) = registry();
        registry.register(NodeId::new(1), lighting(), ms(0)).unwrap();
        registry.register(NodeId::new(2), lighting(), ms(0)).unwrap();

        let transition = registry.remove(NodeId::new(1), ms(10)).unwrap();
        assert_eq!(transition.to, Liveness::Departed);
        assert_eq!(transition.reason, TransitionReason::Removed);
        assert!(registry.get(NodeId::new(1)).is_none());
        assert!(registry.remove(NodeId::new(1), ms(10)).is_none());

        registry.evaluate(ms(4_000));
        registry.evaluate(ms(10_000));
        assert_eq!(registry.prune_departed(), vec![NodeId::new(2)]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_rejects_bad_capabilities() {
        let (registry, _) = registry();
        let bad = CapabilityDescriptor::new().with_flag("cue.fog", true);
        assert!(matches!(
            registry.register(NodeId::new(1), bad, ms(0)),
            Err(RegistryError::Capabilities(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_node_errors() {
        let (registry, _) = registry();
        assert_eq!(
            registry.heartbeat(NodeId::new(4), ms(0)),
            Err(RegistryError::UnknownNode(NodeId::new(4)))
        );
        assert!(registry.record_estimate(NodeId::new(4), None).is_err());
    }
}
