// Copyright (c) 2024 Botho Foundation

//! Decoy scheduling.
//!
//! Decoys are emitted in two situations:
//!
//! - right after a real send, with probability [`DecoyConfig::probability`],
//!   as a burst of `burst_min..=burst_max` units;
//! - on an idle cover timer, one unit per tick, when a cover interval is
//!   configured.
//!
//! Decoy units share the size distribution of real units (see
//! [`super::ShapeConfig`]) and are discarded by the receiver before
//! delivery.

use rand::Rng;
use std::time::Duration;

/// Default probability of a decoy burst after a real send.
pub const DEFAULT_DECOY_PROBABILITY: f64 = 0.3;

/// Default smallest burst.
pub const DEFAULT_BURST_MIN: usize = 1;

/// Default largest burst.
pub const DEFAULT_BURST_MAX: usize = 3;

/// Default idle cover interval bounds in milliseconds.
pub const DEFAULT_COVER_INTERVAL_MS: (u64, u64) = (10_000, 60_000);

/// When and how many decoys to send.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoyConfig {
    /// Chance of a burst after each real send, in `0.0..=1.0`.
    pub probability: f64,
    pub burst_min: usize,
    pub burst_max: usize,
    /// Idle cover timer bounds, `None` to disable.
    pub cover_interval_ms: Option<(u64, u64)>,
}

impl Default for DecoyConfig {
    fn default() -> Self {
        Self {
            probability: DEFAULT_DECOY_PROBABILITY,
            burst_min: DEFAULT_BURST_MIN,
            burst_max: DEFAULT_BURST_MAX,
            cover_interval_ms: Some(DEFAULT_COVER_INTERVAL_MS),
        }
    }
}

impl DecoyConfig {
    /// No decoys at all.
    pub fn disabled() -> Self {
        Self {
            probability: 0.0,
            burst_min: 0,
            burst_max: 0,
            cover_interval_ms: None,
        }
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    pub fn with_burst(mut self, min: usize, max: usize) -> Self {
        self.burst_min = min.min(max);
        self.burst_max = min.max(max);
        self
    }

    pub fn with_cover_interval_ms(mut self, interval: Option<(u64, u64)>) -> Self {
        self.cover_interval_ms = interval;
        self
    }
}

/// Draws decoy decisions from a [`DecoyConfig`].
#[derive(Debug, Clone, Default)]
pub struct DecoyScheduler {
    config: DecoyConfig,
}

impl DecoyScheduler {
    pub fn new(config: DecoyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecoyConfig {
        &self.config
    }

    /// Number of decoys to send after a real unit (often zero).
    pub fn burst_after_send<R: Rng>(&self, rng: &mut R) -> usize {
        let probability = self.config.probability;
        // Also rejects NaN
        if !(probability > 0.0) || self.config.burst_max == 0 {
            return 0;
        }
        if !rng.gen_bool(probability.min(1.0)) {
            return 0;
        }
        rng.gen_range(self.config.burst_min.max(1)..=self.config.burst_max)
    }

    /// Delay until the next idle cover unit, `None` if the timer is off.
    pub fn next_cover_delay<R: Rng>(&self, rng: &mut R) -> Option<Duration> {
        let (min, max) = self.config.cover_interval_ms?;
        let (min, max) = (min.min(max), min.max(max));
        Some(Duration::from_millis(rng.gen_range(min..=max)))
    }
}
