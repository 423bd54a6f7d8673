//! Session and queue policy
//!
//! Durations are stored as `*_ms` integers so config files stay plain JSON;
//! accessors hand out `Duration`s.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use crate::convergent::ResolverConfig;

/// Delivery policy for the operation queue
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Operations sent concurrently per batch
    pub batch_size: usize,
    /// Retries after the first failed send
    pub max_retries: u32,
    /// First retry delay; doubles with every further retry
    pub base_delay_ms: u64,
    /// Pause between batches
    pub batch_interval_ms: u64,
    /// Completed operations kept in history
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            base_delay_ms: 1000,
            batch_interval_ms: 100,
            history_limit: 1000,
        }
    }
}

impl QueueConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Delay before retry number `retry_count` (1-based)
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        self.base_delay().saturating_mul(1u32 << exponent)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub queue: QueueConfig,
    pub resolver: ResolverConfig,
    /// Applied operations remembered for conflict detection
    pub applied_log_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            resolver: ResolverConfig::default(),
            applied_log_limit: 1000,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}
