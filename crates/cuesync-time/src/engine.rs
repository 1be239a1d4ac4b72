//! Clock Sync Engine - per-node offset estimation against the time authority

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use cuesync_core::{
    Authority, ClockOffset, ConfigError, ConfigResult, Epoch, LocalTime, NodeId, OffsetEstimate,
    SyncError, SyncResult,
};

use crate::{PeerEstimator, RoundTripSample, SampleOutcome};

/// Clock Sync Engine configuration
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Accepted samples kept per node
    pub window_size: usize,
    /// Fresh samples required before an estimate is reported
    pub min_samples: usize,
    /// Samples older than this are ignored; a node with nothing fresher is stale
    pub max_age: Duration,
    /// Samples further than this from the current estimate are jitter
    pub max_deviation: Duration,
    /// Upper bound on the reported confidence interval; slower probes are rejected
    pub max_confidence: Duration,
    /// EWMA weight of a new drift slope
    pub drift_alpha: f64,
    /// Drift slopes are clamped to this magnitude
    pub max_drift_ppm: f64,
    /// Minimum spacing between drift slope measurements
    pub min_drift_interval: Duration,
    /// EWMA weight of a new transit sample
    pub transit_alpha: f64,
    /// Outcomes considered for the rejection rate
    pub rejection_window: usize,
    /// Rejection rate above which a node is flagged suspect
    pub suspect_rejection_rate: f64,
    /// Agreeing consecutive outliers that confirm a clock step
    pub step_confirmations: usize,
    /// Known path asymmetry per node (forward minus return delay)
    pub path_asymmetry: HashMap<NodeId, ClockOffset>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        // Wired LAN defaults
        SyncConfig {
            window_size: 16,
            min_samples: 3,
            max_age: Duration::from_secs(10),
            max_deviation: Duration::from_millis(20),
            max_confidence: Duration::from_millis(25),
            drift_alpha: 0.2,
            max_drift_ppm: 500.0,
            min_drift_interval: Duration::from_secs(1),
            transit_alpha: 0.125,
            rejection_window: 16,
            suspect_rejection_rate: 0.5,
            step_confirmations: 3,
            path_asymmetry: HashMap::new(),
        }
    }
}

impl SyncConfig {
    /// Configuration for congested wireless networks
    pub fn wireless() -> Self {
        SyncConfig {
            window_size: 32,
            min_samples: 5,
            max_age: Duration::from_secs(20),
            max_deviation: Duration::from_millis(50),
            max_confidence: Duration::from_millis(60),
            drift_alpha: 0.1,
            transit_alpha: 0.1,
            rejection_window: 32,
            suspect_rejection_rate: 0.6,
            step_confirmations: 5,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.window_size == 0 {
            return Err(ConfigError::NotPositive {
                field: "sync.window_size",
            });
        }
        if self.min_samples == 0 {
            return Err(ConfigError::NotPositive {
                field: "sync.min_samples",
            });
        }
        if self.min_samples > self.window_size {
            return Err(ConfigError::Inconsistent(format!(
                "sync.min_samples ({}) exceeds sync.window_size ({})",
                self.min_samples, self.window_size
            )));
        }
        if self.step_confirmations == 0 || self.step_confirmations > self.window_size {
            return Err(ConfigError::OutOfRange {
                field: "sync.step_confirmations",
                value: self.step_confirmations as f64,
            });
        }
        if self.max_age.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "sync.max_age",
            });
        }
        if self.max_confidence.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "sync.max_confidence",
            });
        }
        for (field, value) in [
            ("sync.drift_alpha", self.drift_alpha),
            ("sync.transit_alpha", self.transit_alpha),
            ("sync.suspect_rejection_rate", self.suspect_rejection_rate),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }
        if self.max_drift_ppm <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "sync.max_drift_ppm",
                value: self.max_drift_ppm,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
struct AuthorityState {
    authority: Authority,
    epoch: Epoch,
}

/// Clock Sync Engine.
///
/// Each node's estimator sits behind its own lock; the node map is write
/// locked only to insert or drop estimators.
pub struct ClockSyncEngine {
    config: SyncConfig,
    authority: RwLock<AuthorityState>,
    peers: RwLock<HashMap<NodeId, Arc<Mutex<PeerEstimator>>>>,
}

impl ClockSyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        ClockSyncEngine {
            config,
            authority: RwLock::new(AuthorityState {
                authority: Authority::Local,
                epoch: Epoch::INITIAL,
            }),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn epoch(&self) -> Epoch {
        self.authority.read().epoch
    }

    pub fn authority(&self) -> Authority {
        self.authority.read().authority
    }

    fn peer(&self, node: NodeId) -> Option<Arc<Mutex<PeerEstimator>>> {
        self.peers.read().get(&node).cloned()
    }

    fn peer_or_insert(&self, node: NodeId, epoch: Epoch) -> Arc<Mutex<PeerEstimator>> {
        if let Some(peer) = self.peer(node) {
            return peer;
        }
        self.peers
            .write()
            .entry(node)
            .or_insert_with(|| Arc::new(Mutex::new(PeerEstimator::new(epoch))))
            .clone()
    }

    /// Feed one completed probe exchange for `node`
    pub fn update(&self, node: NodeId, sample: RoundTripSample) -> SyncResult<SampleOutcome> {
        let current = self.epoch();
        if sample.epoch != current {
            return Err(SyncError::StaleEpoch {
                sample: sample.epoch,
                current,
            });
        }
        sample.validate()?;

        let asymmetry = self
            .config
            .path_asymmetry
            .get(&node)
            .copied()
            .unwrap_or(ClockOffset::ZERO);

        let peer = self.peer_or_insert(node, current);
        let mut estimator = peer.lock();
        // Lost a race with an authority change between the check and the lock
        if estimator.epoch() != current {
            return Err(SyncError::StaleEpoch {
                sample: sample.epoch,
                current: estimator.epoch(),
            });
        }

        let outcome = estimator.update(&sample, asymmetry, &self.config);
        tracing::trace!(
            node = %node,
            verdict = ?outcome.verdict,
            rejection_rate = outcome.rejection_rate,
            "clock sample"
        );
        if outcome.suspect {
            tracing::debug!(
                node = %node,
                rejection_rate = outcome.rejection_rate,
                "clock sample rejection rate above threshold"
            );
        }
        Ok(outcome)
    }

    /// Current estimate for `node`, or `None` if it lacks fresh samples
    pub fn estimate(&self, node: NodeId, now: LocalTime) -> Option<OffsetEstimate> {
        let peer = self.peer(node)?;
        let estimator = peer.lock();
        estimator.estimate(now, &self.config)
    }

    /// Offset estimate of the authority itself. The local process is its
    /// own exact reference.
    pub fn authority_estimate(&self, now: LocalTime) -> Option<OffsetEstimate> {
        let state = *self.authority.read();
        match state.authority {
            Authority::Local => Some(OffsetEstimate {
                offset: ClockOffset::ZERO,
                drift_ppm: 0.0,
                confidence: Duration::ZERO,
                samples: 0,
                measured_at: now,
                epoch: state.epoch,
            }),
            Authority::Node(id) => self.estimate(id, now),
        }
    }

    /// Smoothed one-way transit delay to `node`
    pub fn transit(&self, node: NodeId) -> Option<Duration> {
        self.peer(node)?.lock().transit()
    }

    /// Samples accepted for `node` under the current epoch
    pub fn accepted_since_epoch(&self, node: NodeId) -> u64 {
        self.peer(node)
            .map(|peer| peer.lock().accepted_total())
            .unwrap_or(0)
    }

    /// Nodes that have clock data but nothing newer than `max_age`
    pub fn stale_nodes(&self, now: LocalTime) -> Vec<NodeId> {
        let peers: Vec<(NodeId, Arc<Mutex<PeerEstimator>>)> = self
            .peers
            .read()
            .iter()
            .map(|(id, peer)| (*id, Arc::clone(peer)))
            .collect();

        let mut stale: Vec<NodeId> = peers
            .into_iter()
            .filter(|(_, peer)| {
                peer.lock()
                    .last_accepted()
                    .map(|at| now - at > self.config.max_age)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id)
            .collect();
        stale.sort();
        stale
    }

    /// Drop all estimates and start a new offset base.
    /// Samples from earlier epochs are refused afterwards.
    pub fn authority_changed(&self, authority: Authority, epoch: Epoch) {
        let mut state = self.authority.write();
        let mut peers = self.peers.write();
        let dropped = peers.len();
        peers.clear();
        *state = AuthorityState { authority, epoch };
        tracing::info!(
            authority = %authority,
            epoch = %epoch,
            dropped,
            "clock estimates invalidated for new time authority"
        );
    }

    /// Forget everything about `node` (departure or re-registration)
    pub fn forget(&self, node: NodeId) {
        self.peers.write().remove(&node);
    }

    pub fn tracked_nodes(&self) -> usize {
        self.peers.read().len()
    }
}

impl Default for ClockSyncEngine {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}
