//! Simulated network links
//!
//! Each direction of a node link has its own seeded model:
//! - Base latency plus jitter
//! - Random loss
//! - Duplication

use std::time::Duration;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Jitter distribution type
#[derive(Clone, Debug)]
pub enum JitterDistribution {
    None,
    /// Uniform in `[0, max_us]`
    Uniform { max_us: u64 },
    /// Normal (mean, stddev), clamped at zero
    Normal { mean_us: f64, stddev_us: f64 },
}

impl JitterDistribution {
    /// Sample a jitter value
    pub fn sample(&self, rng: &mut StdRng) -> Duration {
        match self {
            JitterDistribution::None => Duration::ZERO,
            JitterDistribution::Uniform { max_us } => {
                Duration::from_micros(Uniform::new_inclusive(0, *max_us).sample(rng))
            }
            JitterDistribution::Normal { mean_us, stddev_us } => {
                // Box-Muller
                let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                let u2: f64 = rng.gen();
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                Duration::from_micros((mean_us + stddev_us * z).max(0.0) as u64)
            }
        }
    }
}

/// Link conditions for one direction
#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub base_latency: Duration,
    pub jitter: JitterDistribution,
    /// Loss probability (0.0 - 1.0)
    pub loss_rate: f64,
    /// Duplicate probability (0.0 - 1.0)
    pub duplicate_prob: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::lan()
    }
}

impl LinkConfig {
    /// Instant, lossless link
    pub fn ideal() -> Self {
        LinkConfig {
            base_latency: Duration::ZERO,
            jitter: JitterDistribution::None,
            loss_rate: 0.0,
            duplicate_prob: 0.0,
        }
    }

    /// Wired show network
    pub fn lan() -> Self {
        LinkConfig {
            base_latency: Duration::from_micros(300),
            jitter: JitterDistribution::Uniform { max_us: 400 },
            loss_rate: 0.0,
            duplicate_prob: 0.0,
        }
    }

    /// Busy wireless segment
    pub fn wireless() -> Self {
        LinkConfig {
            base_latency: Duration::from_millis(3),
            jitter: JitterDistribution::Normal {
                mean_us: 2_000.0,
                stddev_us: 1_500.0,
            },
            loss_rate: 0.01,
            duplicate_prob: 0.005,
        }
    }

    /// Same latency as `lan` but dropping `loss_rate` of frames
    pub fn lossy(loss_rate: f64) -> Self {
        LinkConfig {
            loss_rate,
            ..Self::lan()
        }
    }
}

/// Link statistics
#[derive(Clone, Debug, Default)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub frames_lost: u64,
    pub frames_duplicated: u64,
    pub total_latency_us: u64,
    pub max_latency_us: u64,
}

impl LinkStats {
    pub fn loss_rate(&self) -> f64 {
        if self.frames_sent == 0 {
            0.0
        } else {
            self.frames_lost as f64 / self.frames_sent as f64
        }
    }
}

/// One direction of a simulated link
#[derive(Debug)]
pub struct LinkModel {
    config: LinkConfig,
    rng: StdRng,
    /// Frames are dropped while down
    down: bool,
    stats: LinkStats,
}

impl LinkModel {
    pub fn new(config: LinkConfig, seed: u64) -> Self {
        LinkModel {
            config,
            rng: StdRng::seed_from_u64(seed),
            down: false,
            stats: LinkStats::default(),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn set_down(&mut self, down: bool) {
        self.down = down;
    }

    pub fn is_down(&self) -> bool {
        self.down
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Delivery delays for one frame: empty if lost, two entries if duplicated
    pub fn transit(&mut self) -> Vec<Duration> {
        self.stats.frames_sent += 1;
        if self.down || self.rng.gen::<f64>() < self.config.loss_rate {
            self.stats.frames_lost += 1;
            return Vec::new();
        }

        let mut delays = vec![self.delay()];
        if self.rng.gen::<f64>() < self.config.duplicate_prob {
            self.stats.frames_duplicated += 1;
            delays.push(self.delay());
        }
        delays
    }

    fn delay(&mut self) -> Duration {
        let delay = self.config.base_latency + self.config.jitter.sample(&mut self.rng);
        let us = delay.as_micros() as u64;
        self.stats.total_latency_us += us;
        self.stats.max_latency_us = self.stats.max_latency_us.max(us);
        delay
    }
}
