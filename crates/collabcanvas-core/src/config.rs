//! Engine configuration.
//!
//! All timings are milliseconds. Every field has a default, so a partial JSON
//! document only needs to name what it overrides.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Throttle interval for continuous drag/resize streaming.
pub const DEFAULT_DRAG_THROTTLE_MS: u64 = 50;
/// Quiet window for debounced writes.
pub const DEFAULT_DEBOUNCE_MS: u64 = 30;
/// Per-field tolerance below which a debounced change is considered jitter.
pub const DEFAULT_SIGNIFICANCE_EPSILON: f64 = 0.1;

/// Presence heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
/// Cursor/avatar visibility window.
pub const DEFAULT_CURSOR_TTL_MS: u64 = 15_000;
/// Age after which a present user is shown as idle.
pub const DEFAULT_IDLE_AFTER_MS: u64 = 30_000;
/// Age after which a user leaves the room roster.
pub const DEFAULT_ROSTER_TTL_MS: u64 = 60_000;
/// Minimum spacing between cursor/avatar publications.
pub const DEFAULT_PRESENCE_PUBLISH_MS: u64 = 50;
/// Cursor/avatar movement below this is not published.
pub const DEFAULT_PRESENCE_MOVE_THRESHOLD: f64 = 0.1;

/// Period of the abandoned-lock sweep.
pub const DEFAULT_LOCK_SWEEP_INTERVAL_MS: u64 = 5_000;
/// Period of the snapshot/meta document write.
pub const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 5_000;

/// Attempts per outbound write, including the first.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
/// Backoff before the first retry; doubles per attempt.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;

/// Smallest gap between adjacent z values before renormalization kicks in.
pub const DEFAULT_MIN_LAYER_GAP: f64 = 1.0 / 1024.0;
/// Offset applied to duplicated shapes.
pub const DEFAULT_DUPLICATE_OFFSET: f64 = 16.0;

/// Write scheduling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    pub drag_throttle_ms: u64,
    pub debounce_ms: u64,
    pub significance_epsilon: f64,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            drag_throttle_ms: DEFAULT_DRAG_THROTTLE_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            significance_epsilon: DEFAULT_SIGNIFICANCE_EPSILON,
        }
    }
}

/// Presence thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub heartbeat_interval_ms: u64,
    pub cursor_ttl_ms: u64,
    pub idle_after_ms: u64,
    pub roster_ttl_ms: u64,
    pub publish_interval_ms: u64,
    pub move_threshold: f64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            cursor_ttl_ms: DEFAULT_CURSOR_TTL_MS,
            idle_after_ms: DEFAULT_IDLE_AFTER_MS,
            roster_ttl_ms: DEFAULT_ROSTER_TTL_MS,
            publish_interval_ms: DEFAULT_PRESENCE_PUBLISH_MS,
            move_threshold: DEFAULT_PRESENCE_MOVE_THRESHOLD,
        }
    }
}

/// Bounded retry for outbound writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_backoff_ms.saturating_mul(1u64 << shift)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub writes: WriteConfig,
    pub presence: PresenceConfig,
    pub retry: RetryPolicy,
    pub lock_sweep_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    pub min_layer_gap: f64,
    pub duplicate_offset: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            writes: WriteConfig::default(),
            presence: PresenceConfig::default(),
            retry: RetryPolicy::default(),
            lock_sweep_interval_ms: DEFAULT_LOCK_SWEEP_INTERVAL_MS,
            snapshot_interval_ms: DEFAULT_SNAPSHOT_INTERVAL_MS,
            min_layer_gap: DEFAULT_MIN_LAYER_GAP,
            duplicate_offset: DEFAULT_DUPLICATE_OFFSET,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.writes.drag_throttle_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "writes.drag_throttle_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(self.writes.significance_epsilon >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "writes.significance_epsilon",
                reason: "must be a non-negative number".to_string(),
            });
        }
        let p = &self.presence;
        if !(p.cursor_ttl_ms <= p.idle_after_ms && p.idle_after_ms <= p.roster_ttl_ms) {
            return Err(ConfigError::Invalid {
                field: "presence",
                reason: format!(
                    "expected cursor_ttl_ms <= idle_after_ms <= roster_ttl_ms, got {} / {} / {}",
                    p.cursor_ttl_ms, p.idle_after_ms, p.roster_ttl_ms
                ),
            });
        }
        if p.heartbeat_interval_ms == 0 || p.heartbeat_interval_ms > p.roster_ttl_ms {
            return Err(ConfigError::Invalid {
                field: "presence.heartbeat_interval_ms",
                reason: "must be positive and no longer than roster_ttl_ms".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        // Renormalized layers are one apart, so a larger gap could never be met.
        if !(self.min_layer_gap > 0.0 && self.min_layer_gap <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "min_layer_gap",
                reason: "must be in (0, 1]".to_string(),
            });
        }
        Ok(())
    }
}
