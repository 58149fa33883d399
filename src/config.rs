//! Pipeline configuration
//!
//! Queue bounds, overflow policy, synthetic timing, and watchdog tuning.
//! Configurations serialize to TOML so deployments can persist and reload
//! their pipeline tuning; durations are stored as milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{FramelinkError, Result};
use crate::types::OverflowPolicy;

/// Configuration for a [`PipelineController`](crate::PipelineController)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Which side of the pipeline sheds load
    pub overflow_policy: OverflowPolicy,

    /// Capacity of the output frame queue
    pub max_output_queue_size: usize,

    /// Pending-metadata limit for input rejection in `DiscardInput` mode
    pub max_input_queue_size: usize,

    /// Hard ceiling on recorded pending-metadata entries; the oldest entry
    /// is evicted (and counted) beyond this, never blocking new frames
    pub max_pending_entries: usize,

    /// Synthetic per-frame duration in milliseconds (drives the fallback
    /// presentation-timestamp cadence)
    pub frame_period_ms: u64,

    /// Silence window in milliseconds after which an ingress call counts a
    /// backend stall
    pub watchdog_timeout_ms: u64,

    /// Consecutive stall count that forces a pipeline restart
    pub watchdog_reset_threshold: u32,

    /// Timeout in milliseconds for each backend event poll
    pub event_poll_interval_ms: u64,

    /// Poll interval in milliseconds for blocked queue pushers
    pub queue_poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            overflow_policy: OverflowPolicy::DiscardOutput,
            max_output_queue_size: 5,
            max_input_queue_size: 3,
            max_pending_entries: 100,
            frame_period_ms: 100,
            watchdog_timeout_ms: 2_000,
            watchdog_reset_threshold: 10,
            event_poll_interval_ms: 100,
            queue_poll_interval_ms: 100,
        }
    }
}

impl PipelineConfig {
    /// Synthetic per-frame duration
    pub fn frame_period(&self) -> Duration {
        Duration::from_millis(self.frame_period_ms)
    }

    /// Watchdog silence window
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    /// Backend event poll timeout
    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    /// Blocked-pusher poll interval
    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    /// Load a configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| FramelinkError::Config(format!("failed to parse config: {e}")))
    }

    /// Save the configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| FramelinkError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
