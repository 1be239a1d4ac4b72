//! Conductor configuration, loaded from TOML
//!
//! Durations are humantime strings (`"250ms"`, `"5s"`). Every section is
//! optional; absent fields keep the component defaults.
//!
//! ```toml
//! node_id = 192
//! bind = "0.0.0.0:7400"
//! probe_interval = "250ms"
//!
//! [[peers]]
//! id = 1
//! addr = "10.0.0.11:7400"
//!
//! [sync]
//! preset = "wireless"
//! max_age = "15s"
//!
//! [scheduler.lead_overrides]
//! 7 = "40ms"
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use cuesync_core::{ClockOffset, ConfigError, ConfigResult, NodeId};
use cuesync_dispatch::{DispatchConfig, SchedulerConfig};
use cuesync_peer::RegistryConfig;
use cuesync_time::SyncConfig;

/// Node id the conductor stamps on its frames unless configured
pub const DEFAULT_CONDUCTOR_ID: NodeId = NodeId(0);

/// A node whose address is known before it says hello
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticPeer {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Everything the conductor needs to run
#[derive(Clone, Debug)]
pub struct ConductorConfig {
    pub node_id: NodeId,
    pub bind: SocketAddr,
    pub peers: Vec<StaticPeer>,
    /// Interval between probe rounds
    pub probe_interval: Duration,
    /// Interval between liveness and authority evaluations
    pub evaluate_interval: Duration,
    /// Capacity of the status event bus
    pub event_capacity: usize,
    /// Emit JSON log lines
    pub json_logs: bool,
    pub sync: SyncConfig,
    pub registry: RegistryConfig,
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        let dispatch = DispatchConfig::default();
        let scheduler = SchedulerConfig {
            min_precision: dispatch.tick_interval,
            ..SchedulerConfig::default()
        };
        ConductorConfig {
            node_id: DEFAULT_CONDUCTOR_ID,
            bind: SocketAddr::from(([0, 0, 0, 0], 7400)),
            peers: Vec::new(),
            probe_interval: Duration::from_millis(250),
            evaluate_interval: Duration::from_millis(250),
            event_capacity: cuesync_core::DEFAULT_BUS_CAPACITY,
            json_logs: false,
            sync: SyncConfig::default(),
            registry: RegistryConfig::default(),
            scheduler,
            dispatch,
        }
    }
}

impl ConductorConfig {
    /// Read and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let config = file.into_config()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.probe_interval.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "probe_interval",
            });
        }
        if self.evaluate_interval.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "evaluate_interval",
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::NotPositive {
                field: "event_capacity",
            });
        }
        if let Some(peer) = self.peers.iter().find(|peer| peer.id == self.node_id) {
            return Err(ConfigError::Inconsistent(format!(
                "static peer {} reuses the conductor node id",
                peer.id
            )));
        }
        // Probes must refresh estimates well before they age out
        if self.probe_interval >= self.sync.max_age {
            return Err(ConfigError::Inconsistent(format!(
                "probe_interval ({}) must be shorter than sync.max_age ({})",
                humantime::format_duration(self.probe_interval),
                humantime::format_duration(self.sync.max_age)
            )));
        }
        if self.scheduler.min_precision < self.dispatch.tick_interval {
            return Err(ConfigError::Inconsistent(
                "scheduler.min_precision is tighter than dispatch.tick_interval".into(),
            ));
        }

        self.sync.validate()?;
        self.registry.validate()?;
        self.scheduler.validate()?;
        self.dispatch.validate()?;
        Ok(())
    }
}

/// Serde helpers for humantime duration strings
mod duration {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer};

    pub fn required<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }

    pub fn optional<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(D::Error::custom))
            .transpose()
    }
}

fn default_probe_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_evaluate_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7400))
}

fn default_event_capacity() -> usize {
    cuesync_core::DEFAULT_BUS_CAPACITY
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    node_id: Option<u64>,
    #[serde(default = "default_bind")]
    bind: SocketAddr,
    #[serde(default)]
    peers: Vec<PeerEntry>,
    #[serde(default = "default_probe_interval", deserialize_with = "duration::required")]
    probe_interval: Duration,
    #[serde(default = "default_evaluate_interval", deserialize_with = "duration::required")]
    evaluate_interval: Duration,
    #[serde(default = "default_event_capacity")]
    event_capacity: usize,
    #[serde(default)]
    json_logs: bool,
    #[serde(default)]
    sync: SyncSection,
    #[serde(default)]
    registry: RegistrySection,
    #[serde(default)]
    scheduler: SchedulerSection,
    #[serde(default)]
    dispatch: DispatchSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PeerEntry {
    id: u64,
    addr: SocketAddr,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SyncPreset {
    #[default]
    Lan,
    Wireless,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SyncSection {
    #[serde(default)]
    preset: SyncPreset,
    window_size: Option<usize>,
    min_samples: Option<usize>,
    #[serde(default, deserialize_with = "duration::optional")]
    max_age: Option<Duration>,
    #[serde(default, deserialize_with = "duration::optional")]
    max_deviation: Option<Duration>,
    #[serde(default, deserialize_with = "duration::optional")]
    max_confidence: Option<Duration>,
    drift_alpha: Option<f64>,
    max_drift_ppm: Option<f64>,
    #[serde(default, deserialize_with = "duration::optional")]
    min_drift_interval: Option<Duration>,
    transit_alpha: Option<f64>,
    rejection_window: Option<usize>,
    suspect_rejection_rate: Option<f64>,
    step_confirmations: Option<usize>,
    /// Node id to forward-minus-return delay in microseconds
    #[serde(default)]
    path_asymmetry_us: HashMap<String, i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistrySection {
    #[serde(default, deserialize_with = "duration::optional")]
    heartbeat_interval: Option<Duration>,
    missed_heartbeat_threshold: Option<u32>,
    #[serde(default, deserialize_with = "duration::optional")]
    suspect_grace: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchedulerSection {
    #[serde(default, deserialize_with = "duration::optional")]
    dispatch_margin: Option<Duration>,
    /// Node id to humantime lead
    #[serde(default)]
    lead_overrides: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DispatchSection {
    #[serde(default, deserialize_with = "duration::optional")]
    tick_interval: Option<Duration>,
}

fn parse_node_key(section: &str, key: &str) -> ConfigResult<NodeId> {
    key.trim()
        .parse::<u64>()
        .map(NodeId::new)
        .map_err(|_| ConfigError::Parse(format!("{section}: `{key}` is not a node id")))
}

impl ConfigFile {
    fn into_config(self) -> ConfigResult<ConductorConfig> {
        let sync = self.sync.into_config()?;
        let registry = self.registry.into_config();
        let dispatch = DispatchConfig {
            tick_interval: self
                .dispatch
                .tick_interval
                .unwrap_or(DispatchConfig::default().tick_interval),
        };
        let scheduler = self.scheduler.into_config(dispatch.tick_interval)?;

        Ok(ConductorConfig {
            node_id: self.node_id.map(NodeId::new).unwrap_or(DEFAULT_CONDUCTOR_ID),
            bind: self.bind,
            peers: self
                .peers
                .into_iter()
                .map(|peer| StaticPeer {
                    id: NodeId::new(peer.id),
                    addr: peer.addr,
                })
                .collect(),
            probe_interval: self.probe_interval,
            evaluate_interval: self.evaluate_interval,
            event_capacity: self.event_capacity,
            json_logs: self.json_logs,
            sync,
            registry,
            scheduler,
            dispatch,
        })
    }
}

impl SyncSection {
    fn into_config(self) -> ConfigResult<SyncConfig> {
        let mut config = match self.preset {
            SyncPreset::Lan => SyncConfig::default(),
            SyncPreset::Wireless => SyncConfig::wireless(),
        };

        if let Some(v) = self.window_size {
            config.window_size = v;
        }
        if let Some(v) = self.min_samples {
            config.min_samples = v;
        }
        if let Some(v) = self.max_age {
            config.max_age = v;
        }
        if let Some(v) = self.max_deviation {
            config.max_deviation = v;
        }
        if let Some(v) = self.max_confidence {
            config.max_confidence = v;
        }
        if let Some(v) = self.drift_alpha {
            config.drift_alpha = v;
        }
        if let Some(v) = self.max_drift_ppm {
            config.max_drift_ppm = v;
        }
        if let Some(v) = self.min_drift_interval {
            config.min_drift_interval = v;
        }
        if let Some(v) = self.transit_alpha {
            config.transit_alpha = v;
        }
        if let Some(v) = self.rejection_window {
            config.rejection_window = v;
        }
        if let Some(v) = self.suspect_rejection_rate {
            config.suspect_rejection_rate = v;
        }
        if let Some(v) = self.step_confirmations {
            config.step_confirmations = v;
        }
        for (key, micros) in self.path_asymmetry_us {
            let node = parse_node_key("sync.path_asymmetry_us", &key)?;
            config
                .path_asymmetry
                .insert(node, ClockOffset::from_micros(micros));
        }
        Ok(config)
    }
}

impl RegistrySection {
    fn into_config(self) -> RegistryConfig {
        let defaults = RegistryConfig::default();
        RegistryConfig {
            heartbeat_interval: self.heartbeat_interval.unwrap_or(defaults.heartbeat_interval),
            missed_heartbeat_threshold: self
                .missed_heartbeat_threshold
                .unwrap_or(defaults.missed_heartbeat_threshold),
            suspect_grace: self.suspect_grace.unwrap_or(defaults.suspect_grace),
        }
    }
}

impl SchedulerSection {
    fn into_config(self, tick_interval: Duration) -> ConfigResult<SchedulerConfig> {
        let defaults = SchedulerConfig::default();
        let mut lead_overrides = HashMap::new();
        for (key, raw) in self.lead_overrides {
            let node = parse_node_key("scheduler.lead_overrides", &key)?;
            let lead = humantime::parse_duration(&raw).map_err(|e| ConfigError::InvalidDuration {
                field: format!("scheduler.lead_overrides.{key}"),
                message: e.to_string(),
            })?;
            lead_overrides.insert(node, lead);
        }

        Ok(SchedulerConfig {
            dispatch_margin: self.dispatch_margin.unwrap_or(defaults.dispatch_margin),
            lead_overrides,
            // Tolerances tighter than one coordinator tick cannot be honored
            min_precision: tick_interval,
        })
    }
}
