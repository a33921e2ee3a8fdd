use std::time::Duration;

use serde::Deserialize;

/// Priority assigned to transfers when neither the caller nor the configuration names one.
pub const DEFAULT_PRIORITY: f32 = 0.5;

/// Transfers at or above this priority draw from the urgent permit pool.
pub const URGENT_PRIORITY_THRESHOLD: f32 = 0.75;

/// Prefix applied to every configuration id so ids from different subsystems never collide.
pub const CONFIGURATION_NAMESPACE: &str = "dock.transfer.";

/// Id of the foreground preset configuration.
pub const DEFAULT_CONFIGURATION_ID: &str = "default";

/// Id of the background preset configuration.
pub const BACKGROUND_CONFIGURATION_ID: &str = "background";

/// Per-request timeout used by the presets (60 s).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Total number of transfers a single HTTP session runs at once.
pub const DEFAULT_MAX_CONCURRENCY: u32 = 6;

/// Permits reserved for urgent transfers, carved out of `max_concurrency`.
pub const DEFAULT_URGENT_PERMITS: u32 = 2;

/// Top-level configuration for the HTTP transport binding.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of concurrent transfers per session.
    pub max_concurrency: u32,
    /// How many of those permits are reserved for urgent transfers.
    pub urgent_permits: u32,
    /// Directory where download transfers stage their files.
    /// Empty means the system temp directory.
    pub download_dir: String,
}

impl EngineConfig {
    /// Permits left for background transfers. Always at least one.
    pub fn background_permits(&self) -> usize {
        (self.max_concurrency as usize)
            .saturating_sub(self.urgent_permits as usize)
            .max(1)
    }

    pub fn urgent_permits(&self) -> usize {
        (self.urgent_permits as usize).max(1)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            urgent_permits: DEFAULT_URGENT_PERMITS,
            download_dir: String::new(),
        }
    }
}

/// Clamp a caller-supplied priority into `[0, 1]`. NaN falls back to the default.
pub fn clamp_priority(priority: f32) -> f32 {
    if priority.is_nan() {
        DEFAULT_PRIORITY
    } else {
        priority.clamp(0.0, 1.0)
    }
}
