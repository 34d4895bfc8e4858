//! Tunables for the long-lived loops.
//!
//! Every config derives serde with `#[serde(default)]` so a partial JSON
//! document only overrides what it names.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::world::SubscriptionConfig;
use crate::WorldError;

fn parse<T: DeserializeOwned>(json: &str) -> Result<T, WorldError> {
    serde_json::from_str(json).map_err(|e| WorldError::Config {
        details: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Replica
// ---------------------------------------------------------------------------

/// What a replica does once its subscription fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log and terminate the process so a supervisor can restart it.
    #[default]
    ExitProcess,
    /// Stop replicating, report unhealthy, keep serving the last state.
    MarkStale,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub subscription: SubscriptionConfig,
    pub backoff: BackoffConfig,
    pub failure_policy: FailurePolicy,
    /// Exit status used by [`FailurePolicy::ExitProcess`]. Zero is replaced
    /// by 1.
    pub exit_code: i32,
}

impl ReplicaConfig {
    pub fn from_json_str(json: &str) -> Result<Self, WorldError> {
        parse(json)
    }

    pub(crate) fn effective_exit_code(&self) -> i32 {
        if self.exit_code == 0 {
            1
        } else {
            self.exit_code
        }
    }
}

// ---------------------------------------------------------------------------
// Batcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Flush attempts per `drain` before pending events are failed.
    pub max_drain_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_drain_attempts: 5,
            backoff: BackoffConfig {
                base_ms: 50,
                max_ms: 2_000,
                ..BackoffConfig::default()
            },
        }
    }
}

impl BatcherConfig {
    pub fn from_json_str(json: &str) -> Result<Self, WorldError> {
        parse(json)
    }
}

// ---------------------------------------------------------------------------
// Side-effect processor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Ticks per second for [`SideEffectProcessor::run`](crate::sidefx::SideEffectProcessor::run).
    pub flush_hz: f64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self { flush_hz: 10.0 }
    }
}

impl ProcessorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, WorldError> {
        parse(json)
    }

    /// Tick period; non-positive or non-finite rates fall back to 10 Hz.
    pub fn period(&self) -> std::time::Duration {
        let hz = if self.flush_hz.is_finite() && self.flush_hz > 0.0 {
            self.flush_hz
        } else {
            10.0
        };
        std::time::Duration::from_secs_f64(1.0 / hz)
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Re-listen backoff. Listeners retry forever by default.
    pub backoff: BackoffConfig,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig {
                max_attempts: None,
                ..BackoffConfig::default()
            },
        }
    }
}

impl NotifierConfig {
    pub fn from_json_str(json: &str) -> Result<Self, WorldError> {
        parse(json)
    }
}
