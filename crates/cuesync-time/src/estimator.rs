//! Windowed, outlier-rejecting offset estimator for a single peer

use std::collections::VecDeque;
use std::time::Duration;

use cuesync_core::{ClockOffset, Epoch, LocalTime, OffsetEstimate};

use crate::{RoundTripSample, SyncConfig};

/// A sample that passed outlier rejection
#[derive(Clone, Copy, Debug, PartialEq)]
struct Accepted {
    offset: ClockOffset,
    uncertainty: Duration,
    delay: Duration,
    at: LocalTime,
}

/// Why a sample was not incorporated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Round trip too slow for the sample to be precise enough
    DelayTooHigh,
    /// Offset too far from the current estimate
    Deviation,
}

/// What happened to a sample
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleVerdict {
    Accepted,
    Rejected(RejectReason),
    /// Consecutive agreeing outliers confirmed a clock step; window reset
    ClockStep,
}

/// Result of feeding one sample to the engine
#[derive(Clone, Debug, PartialEq)]
pub struct SampleOutcome {
    pub verdict: SampleVerdict,
    /// Estimate after the sample, if enough fresh data exists
    pub estimate: Option<OffsetEstimate>,
    /// Rejected fraction over the recent outcome window
    pub rejection_rate: f64,
    /// Rejection rate crossed the suspect threshold
    pub suspect: bool,
}

/// Per-peer estimator state
#[derive(Debug)]
pub struct PeerEstimator {
    epoch: Epoch,
    window: VecDeque<Accepted>,
    /// Recent outcomes, true = rejected
    outcomes: VecDeque<bool>,
    /// Consecutive deviating samples that agree with each other
    step_candidates: Vec<Accepted>,
    drift_ppm: f64,
    /// Last (time, offset) used as a drift anchor
    drift_anchor: Option<(LocalTime, ClockOffset)>,
    transit: Option<Duration>,
    accepted_total: u64,
}

impl PeerEstimator {
    pub fn new(epoch: Epoch) -> Self {
        PeerEstimator {
            epoch,
            window: VecDeque::new(),
            outcomes: VecDeque::new(),
            step_candidates: Vec::new(),
            drift_ppm: 0.0,
            drift_anchor: None,
            transit: None,
            accepted_total: 0,
        }
    }

    /// Incorporate a validated sample
    pub fn update(
        &mut self,
        sample: &RoundTripSample,
        asymmetry: ClockOffset,
        config: &SyncConfig,
    ) -> SampleOutcome {
        let candidate = Accepted {
            offset: sample.offset_with_asymmetry(asymmetry),
            uncertainty: sample.uncertainty(),
            delay: sample.delay(),
            at: sample.t4,
        };

        let verdict = self.classify(candidate, config);
        match verdict {
            SampleVerdict::Accepted => {
                self.step_candidates.clear();
                self.accept(candidate, config);
            }
            SampleVerdict::Rejected(RejectReason::Deviation) => {
                if self.track_step(candidate, config) {
                    return self.finish(SampleVerdict::ClockStep, config, sample.t4);
                }
            }
            SampleVerdict::Rejected(RejectReason::DelayTooHigh) | SampleVerdict::ClockStep => {}
        }

        self.record_outcome(!matches!(verdict, SampleVerdict::Accepted), config);
        self.finish(verdict, config, sample.t4)
    }

    fn classify(&self, candidate: Accepted, config: &SyncConfig) -> SampleVerdict {
        if candidate.uncertainty > config.max_confidence {
            return SampleVerdict::Rejected(RejectReason::DelayTooHigh);
        }

        // Outlier rejection only once the window can outvote a bad sample
        if self.window.len() >= config.min_samples {
            let predicted = self.center(candidate.at);
            let deviation = (candidate.offset - predicted).magnitude();
            if deviation > config.max_deviation {
                return SampleVerdict::Rejected(RejectReason::Deviation);
            }
        }

        SampleVerdict::Accepted
    }

    /// Track agreeing outliers; returns true when a clock step is confirmed
    fn track_step(&mut self, candidate: Accepted, config: &SyncConfig) -> bool {
        let agrees = self
            .step_candidates
            .first()
            .map(|first| (candidate.offset - first.offset).magnitude() <= config.max_deviation)
            .unwrap_or(true);
        if !agrees {
            self.step_candidates.clear();
        }
        self.step_candidates.push(candidate);

        if self.step_candidates.len() < config.step_confirmations {
            return false;
        }

        tracing::info!(
            samples = self.step_candidates.len(),
            offset_us = candidate.offset.as_micros(),
            "clock step confirmed, resetting estimator window"
        );
        self.window = self.step_candidates.drain(..).collect();
        self.outcomes.clear();
        self.drift_ppm = 0.0;
        self.drift_anchor = self.window.back().map(|s| (s.at, s.offset));
        true
    }

    fn accept(&mut self, sample: Accepted, config: &SyncConfig) {
        self.window.push_back(sample);
        while self.window.len() > config.window_size {
            self.window.pop_front();
        }
        self.accepted_total += 1;

        let one_way = sample.delay / 2;
        self.transit = Some(match self.transit {
            Some(prev) => ewma_duration(prev, one_way, config.transit_alpha),
            None => one_way,
        });

        self.update_drift(sample.at, config);
    }

    fn update_drift(&mut self, now: LocalTime, config: &SyncConfig) {
        let center = self.center(now);
        let Some((anchor_at, anchor_offset)) = self.drift_anchor else {
            self.drift_anchor = Some((now, center));
            return;
        };

        let dt_us = now.micros_since(anchor_at);
        if dt_us < config.min_drift_interval.as_micros() as i64 {
            return;
        }

        let slope_ppm =
            (center - anchor_offset).as_micros() as f64 / dt_us as f64 * 1_000_000.0;
        let slope_ppm = slope_ppm.clamp(-config.max_drift_ppm, config.max_drift_ppm);
        self.drift_ppm = config.drift_alpha * slope_ppm + (1.0 - config.drift_alpha) * self.drift_ppm;
        self.drift_anchor = Some((now, center));
    }

    fn record_outcome(&mut self, rejected: bool, config: &SyncConfig) {
        self.outcomes.push_back(rejected);
        while self.outcomes.len() > config.rejection_window {
            self.outcomes.pop_front();
        }
    }

    fn rejection_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let rejected = self.outcomes.iter().filter(|r| **r).count();
        rejected as f64 / self.outcomes.len() as f64
    }

    fn finish(&self, verdict: SampleVerdict, config: &SyncConfig, now: LocalTime) -> SampleOutcome {
        let rejection_rate = self.rejection_rate();
        let suspect = self.outcomes.len() >= config.min_samples
            && rejection_rate > config.suspect_rejection_rate;
        SampleOutcome {
            verdict,
            estimate: self.estimate(now, config),
            rejection_rate,
            suspect,
        }
    }

    /// Offsets of the given samples normalized to `at` using the drift estimate
    fn normalized<'a>(
        &self,
        samples: impl Iterator<Item = &'a Accepted>,
        at: LocalTime,
    ) -> Vec<i64> {
        samples
            .map(|s| {
                let dt_us = at.micros_since(s.at) as f64;
                s.offset.as_micros() + (dt_us * self.drift_ppm / 1_000_000.0).round() as i64
            })
            .collect()
    }

    /// Median window offset extrapolated to `at`
    fn center(&self, at: LocalTime) -> ClockOffset {
        let mut offsets = self.normalized(self.window.iter(), at);
        ClockOffset::from_micros(median(&mut offsets).unwrap_or(0))
    }

    /// Current estimate from samples no older than `max_age` at `now`
    pub fn estimate(&self, now: LocalTime, config: &SyncConfig) -> Option<OffsetEstimate> {
        let fresh: Vec<&Accepted> = self
            .window
            .iter()
            .filter(|s| now - s.at <= config.max_age)
            .collect();
        if fresh.len() < config.min_samples {
            return None;
        }

        let newest = fresh.iter().map(|s| s.at).max()?;
        let mut offsets = self.normalized(fresh.iter().copied(), newest);
        let center = median(&mut offsets)?;
        let mut deviations: Vec<i64> = offsets.iter().map(|o| (o - center).abs()).collect();
        let mad = median(&mut deviations).unwrap_or(0);
        let best_uncertainty = fresh.iter().map(|s| s.uncertainty).min()?;

        let confidence = (best_uncertainty + Duration::from_micros(mad as u64))
            .min(config.max_confidence);

        Some(OffsetEstimate {
            offset: ClockOffset::from_micros(center),
            drift_ppm: self.drift_ppm,
            confidence,
            samples: fresh.len(),
            measured_at: newest,
            epoch: self.epoch,
        })
    }

    /// Newest accepted sample time
    pub fn last_accepted(&self) -> Option<LocalTime> {
        self.window.back().map(|s| s.at)
    }

    /// Smoothed one-way transit delay
    pub fn transit(&self) -> Option<Duration> {
        self.transit
    }

    pub fn accepted_total(&self) -> u64 {
        self.accepted_total
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }
}

fn median(values: &mut [i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2)
    } else {
        Some(values[mid])
    }
}

fn ewma_duration(prev: Duration, sample: Duration, alpha: f64) -> Duration {
    let value = alpha * sample.as_secs_f64() + (1.0 - alpha) * prev.as_secs_f64();
    Duration::from_secs_f64(value.max(0.0))
}
