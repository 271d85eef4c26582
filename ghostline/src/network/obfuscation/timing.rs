// Copyright (c) 2024 Botho Foundation

//! Timing jitter for outbound units.
//!
//! Every unit a connection writes, decoys included, is preceded by a random
//! delay drawn uniformly from the configured range. The delay is awaited in
//! that connection's writer task only.

use rand::Rng;
use std::time::Duration;

/// Default minimum delay in milliseconds.
pub const DEFAULT_MIN_DELAY_MS: u64 = 10;

/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 500;

/// Configuration for timing jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterConfig {
    /// Minimum delay in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay in milliseconds (inclusive).
    pub max_delay_ms: u64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl JitterConfig {
    /// Create a configuration with the given range; bounds are reordered if
    /// given backwards.
    pub fn new(min_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            min_delay_ms: min_delay_ms.min(max_delay_ms),
            max_delay_ms: min_delay_ms.max(max_delay_ms),
        }
    }

    /// No delay at all.
    pub fn disabled() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.max_delay_ms == 0
    }
}

/// Draws per-unit send delays.
#[derive(Debug, Clone, Default)]
pub struct TimingJitter {
    config: JitterConfig,
}

impl TimingJitter {
    pub fn new(config: JitterConfig) -> Self {
        Self { config }
    }

    pub fn disabled() -> Self {
        Self::new(JitterConfig::disabled())
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }

    /// A random delay within the configured range.
    pub fn delay(&self) -> Duration {
        self.delay_with_rng(&mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.config.is_disabled() {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(self.config.min_delay_ms..=self.config.max_delay_ms))
    }

    /// Sleep for one random delay.
    pub async fn wait(&self) {
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
