//! Hub configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Synchronization attempts per lock hold before deferring
    pub sync_retry_budget: usize,
    /// Delay before a deferred synchronization pass (ms)
    pub sync_cooldown_ms: u64,
    /// Period of the keyframe request broadcast (ms)
    pub keyframe_interval_ms: u64,
    /// Bitrate/delay estimation window (ms)
    pub bitrate_window_ms: u64,
    /// Period of the per-session statistics record (ms)
    pub stats_interval_ms: u64,
    /// Directory for per-session statistics CSV files (None = disabled)
    pub stats_dir: Option<PathBuf>,
    /// STUN/TURN server URLs handed to the transport engine
    pub ice_servers: Vec<String>,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            sync_retry_budget: 25,
            sync_cooldown_ms: 3000,
            keyframe_interval_ms: 3000,
            bitrate_window_ms: 1000,
            stats_interval_ms: 500,
            stats_dir: None,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn sync_cooldown(&self) -> Duration {
        Duration::from_millis(self.sync_cooldown_ms)
    }

    #[must_use]
    pub const fn keyframe_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_interval_ms)
    }

    #[must_use]
    pub const fn bitrate_window(&self) -> Duration {
        Duration::from_millis(self.bitrate_window_ms)
    }

    #[must_use]
    pub const fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Check for values the hub cannot run with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.sync_retry_budget == 0 {
            errors.push("sfu.sync_retry_budget must be at least 1".to_string());
        }
        for (name, value) in [
            ("sfu.sync_cooldown_ms", self.sync_cooldown_ms),
            ("sfu.keyframe_interval_ms", self.keyframe_interval_ms),
            ("sfu.bitrate_window_ms", self.bitrate_window_ms),
            ("sfu.stats_interval_ms", self.stats_interval_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than zero"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
