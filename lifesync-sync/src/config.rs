//! Sync layer configuration.

use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for the channel registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a channel with no listeners stays open before it is closed (ms).
    /// Absorbs unmount/remount cycles. Zero closes immediately.
    pub teardown_grace_ms: u64,
    /// Consecutive failed reconnects before a channel is declared degraded.
    pub reconnect_attempts: u32,
    /// Delay before the first reconnect attempt (ms); doubles per attempt.
    pub reconnect_backoff_ms: u64,
    /// Upper bound on the reconnect delay (ms).
    pub reconnect_backoff_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            teardown_grace_ms: 50,
            reconnect_attempts: 5,
            reconnect_backoff_ms: 250,
            reconnect_backoff_max_ms: 10_000,
        }
    }
}

impl SyncConfig {
    /// Parses a configuration document. Missing keys take their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The debounce applied before closing an idle channel.
    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based), exponential and capped.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .reconnect_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reconnect_backoff_max_ms);
        Duration::from_millis(delay)
    }
}
