use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::ReputationConfig;
use crate::types::VoteDirection;

/// Exponential decay for `elapsed_hours` under the given half-life.
pub fn decay_factor(elapsed_hours: f64, half_life_hours: f64) -> f64 {
    if elapsed_hours <= 0.0 || half_life_hours <= 0.0 {
        return 1.0;
    }
    (-(std::f64::consts::LN_2 / half_life_hours) * elapsed_hours).exp()
}

/// Index-based percentile over an ascending slice: `sorted[floor(n * k)]`.
pub fn percentile(sorted: &[u64], k: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64) * k).floor() as usize;
    sorted[index.min(sorted.len() - 1)] as f64
}

/// Performance record for one agent on one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMetrics {
    pub decayed_upvotes: f64,
    pub decayed_downvotes: f64,
    pub last_update_timestamp: DateTime<Utc>,
    pub latency_samples: VecDeque<u64>,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub total_tasks: u64,
    pub current_score: f64,
}

impl CapabilityMetrics {
    pub fn new(now: DateTime<Utc>, config: &ReputationConfig) -> Self {
        Self {
            decayed_upvotes: 0.0,
            decayed_downvotes: 0.0,
            last_update_timestamp: now,
            latency_samples: VecDeque::new(),
            p50: 0.0,
            p95: 0.0,
            p99: 0.0,
            total_tasks: 0,
            current_score: config.cold_start_score,
        }
    }

    /// Age both vote tallies up to `now`. Time never runs backwards here.
    pub fn apply_decay(&mut self, now: DateTime<Utc>, config: &ReputationConfig) {
        let elapsed_ms = (now - self.last_update_timestamp).num_milliseconds();
        if elapsed_ms <= 0 {
            return;
        }
        let factor = decay_factor(elapsed_ms as f64 / 3_600_000.0, config.half_life_hours);
        self.decayed_upvotes *= factor;
        self.decayed_downvotes *= factor;
        self.last_update_timestamp = now;
    }

    pub fn record_outcome(&mut self, success: bool, now: DateTime<Utc>, config: &ReputationConfig) {
        self.apply_decay(now, config);
        if success {
            self.decayed_upvotes += 1.0;
        } else {
            self.decayed_downvotes += 1.0;
        }
        self.total_tasks += 1;
        self.recompute_score(config);
    }

    /// Add (`weight > 0`) or withdraw (`weight < 0`) a vote's contribution.
    pub fn apply_vote(
        &mut self,
        direction: VoteDirection,
        weight: f64,
        now: DateTime<Utc>,
        config: &ReputationConfig,
    ) {
        self.apply_decay(now, config);
        let tally = match direction {
            VoteDirection::Up => &mut self.decayed_upvotes,
            VoteDirection::Down => &mut self.decayed_downvotes,
        };
        *tally = (*tally + weight).max(0.0);
        self.recompute_score(config);
    }

    pub fn record_latency(&mut self, latency_ms: u64, now: DateTime<Utc>, config: &ReputationConfig) {
        self.apply_decay(now, config);
        self.latency_samples.push_back(latency_ms);
        while self.latency_samples.len() > config.max_latency_samples {
            self.latency_samples.pop_front();
        }
        self.recompute_percentiles();
        self.recompute_score(config);
    }

    pub fn recompute_percentiles(&mut self) {
        let mut sorted: Vec<u64> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();
        self.p50 = percentile(&sorted, 0.5);
        self.p95 = percentile(&sorted, 0.95);
        self.p99 = percentile(&sorted, 0.99);
    }

    pub fn recompute_score(&mut self, config: &ReputationConfig) {
        let total_votes = self.decayed_upvotes + self.decayed_downvotes;
        let success_score = if total_votes > 0.0 {
            self.decayed_upvotes / total_votes
        } else {
            config.cold_start_score
        };

        let latency_score = if self.latency_samples.is_empty() {
            config.neutral_latency_score
        } else {
            (1.0 - self.p50 / config.latency_threshold_ms).max(0.0)
        };

        let raw = success_score * config.success_weight + latency_score * config.latency_weight;

        let score = if self.total_tasks < config.cold_start_tasks {
            let w = self.total_tasks as f64 / config.cold_start_tasks as f64;
            raw * w + config.cold_start_score * (1.0 - w)
        } else {
            let volume = (self.total_tasks as f64 / config.min_volume_for_confidence as f64).min(1.0);
            raw * volume
        };

        self.current_score = score.clamp(0.0, 1.0);
    }

    pub fn is_slow(&self, threshold_ms: f64) -> bool {
        !self.latency_samples.is_empty() && self.p50 > threshold_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn config() -> ReputationConfig {
        ReputationConfig::default()
    }

    #[test]
    fn test_decay_factor_half_life() {
        assert!((decay_factor(168.0, 168.0) - 0.5).abs() < 1e-9);
        assert!((decay_factor(336.0, 168.0) - 0.25).abs() < 1e-9);
        assert_eq!(decay_factor(0.0, 168.0), 1.0);
    }

    #[test]
    fn test_upvotes_decay_over_half_life() {
        let start = Utc::now();
        let mut m = CapabilityMetrics::new(start, &config());
        m.record_outcome(true, start, &config());
        m.record_outcome(true, start + Duration::hours(168), &config());

        assert!((m.decayed_upvotes - 1.5).abs() < 1e-6);
        assert_eq!(m.total_tasks, 2);
        assert_eq!(m.last_update_timestamp, start + Duration::hours(168));
    }

    #[test]
    fn test_percentiles_index_based() {
        let now = Utc::now();
        let mut m = CapabilityMetrics::new(now, &config());
        for ms in (100..=1000).step_by(100) {
            m.record_latency(ms, now, &config());
        }
        assert_eq!(m.p50, 600.0);
        assert_eq!(m.p95, 1000.0);
        assert_eq!(m.p99, 1000.0);
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let now = Utc::now();
        let mut m = CapabilityMetrics::new(now, &config());
        for ms in 0..150u64 {
            m.record_latency(ms, now, &config());
        }
        assert_eq!(m.latency_samples.len(), 100);
        assert_eq!(m.latency_samples.front(), Some(&50));
        assert_eq!(m.latency_samples.back(), Some(&149));
    }

    #[test]
    fn test_cold_start_blend() {
        let now = Utc::now();
        let mut m = CapabilityMetrics::new(now, &config());
        assert_eq!(m.current_score, 0.5);

        m.record_outcome(true, now, &config());
        // raw = 1.0 * 0.7 + 0.8 * 0.3 = 0.94; w = 0.2
        let expected = 0.94 * 0.2 + 0.5 * 0.8;
        assert!((m.current_score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_volume_confidence() {
        let now = Utc::now();
        let mut m = CapabilityMetrics::new(now, &config());
        for _ in 0..10 {
            m.record_outcome(true, now, &config());
        }
        assert!((m.current_score - 0.94 * 0.5).abs() < 1e-9);

        for _ in 0..10 {
            m.record_outcome(true, now, &config());
        }
        assert!((m.current_score - 0.94).abs() < 1e-9);
    }

    #[test]
    fn test_slow_latency_floors_latency_component() {
        let now = Utc::now();
        let mut m = CapabilityMetrics::new(now, &config());
        for _ in 0..20 {
            m.record_outcome(true, now, &config());
        }
        m.record_latency(45_000, now, &config());
        assert!((m.current_score - 0.7).abs() < 1e-9);
        assert!(m.is_slow(30_000.0));
    }

    #[test]
    fn test_vote_withdrawal_never_negative() {
        let now = Utc::now();
        let mut m = CapabilityMetrics::new(now, &config());
        m.apply_vote(VoteDirection::Down, -1.0, now, &config());
        assert_eq!(m.decayed_downvotes, 0.0);
    }

    #[test]
    fn test_score_always_in_unit_range() {
        let now = Utc::now();
        let mut m = CapabilityMetrics::new(now, &config());
        for i in 0..40 {
            m.record_outcome(i % 3 != 0, now, &config());
            m.record_latency(i * 1000, now, &config());
            assert!((0.0..=1.0).contains(&m.current_score));
        }
    }
}
