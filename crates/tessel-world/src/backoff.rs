//! Bounded exponential backoff with jitter.
//!
//! The delay for attempt `n` (1-based) is `base * 2^(n-1)`, with the shift
//! capped at 10 and the result capped at `max`. Jitter then shaves off up to
//! `jitter` of the delay so that replicas disconnected together do not
//! reconnect in lock-step.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

const MAX_SHIFT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Fraction of each delay that may be randomly removed, in `[0, 1]`.
    pub jitter: f64,
    /// Give up after this many consecutive failures. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    /// 500ms doubling to 10s, half-jittered, at most 20 attempts.
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 10_000,
            jitter: 0.5,
            max_attempts: Some(20),
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_SHIFT);
        let millis = self.base_ms.saturating_mul(1u64 << shift).min(self.max_ms);
        Duration::from_millis(millis)
    }
}

/// Tracks consecutive failures for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Record a failure and return how long to wait, or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if let Some(max) = self.config.max_attempts {
            if self.attempt > max {
                return None;
            }
        }
        let ceiling = self.config.ceiling(self.attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Some(ceiling);
        }
        let shave: f64 = rand::thread_rng().gen_range(0.0..=jitter);
        Some(ceiling.mul_f64(1.0 - shave))
    }

    /// Forget past failures after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
