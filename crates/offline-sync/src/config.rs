//! Configuration for the offline sync engine.
//!
//! Every section has sensible defaults and builder-style setters, and
//! (de)serializes with serde so hosts can load it from a file.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Capacity caps for one storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueLimits {
    /// Maximum number of queued operations.
    pub max_operations: usize,
    /// Maximum estimated size of all queued updates, in bytes.
    pub max_bytes: u64,
    /// Maximum number of queued operations for a single document.
    pub max_per_document: usize,
}

impl QueueLimits {
    pub fn new(max_operations: usize, max_bytes: u64, max_per_document: usize) -> Self {
        Self {
            max_operations,
            max_bytes,
            max_per_document,
        }
    }

    /// Limits for the durable primary backend.
    pub fn primary() -> Self {
        Self::new(5_000, 50 * 1024 * 1024, 500)
    }

    /// Limits for the lower-capacity fallback backend.
    pub fn fallback() -> Self {
        Self::new(500, 4 * 1024 * 1024, 100)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.max_operations == 0 || self.max_bytes == 0 || self.max_per_document == 0 {
            return Err(ConfigError::Invalid(format!(
                "{section}: limits must be greater than zero"
            )));
        }
        Ok(())
    }
}

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub primary: QueueLimits,
    pub fallback: QueueLimits,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            primary: QueueLimits::primary(),
            fallback: QueueLimits::fallback(),
        }
    }
}

impl QueueConfig {
    pub fn with_primary(mut self, limits: QueueLimits) -> Self {
        self.primary = limits;
        self
    }

    pub fn with_fallback(mut self, limits: QueueLimits) -> Self {
        self.fallback = limits;
        self
    }
}

/// How merges are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStrategy {
    /// Dedicated worker thread, falling back in-process when unavailable.
    Worker,
    /// Always run in the calling thread.
    Inline,
}

/// Merge engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeConfig {
    pub strategy: ExecutionStrategy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategy::Worker,
        }
    }
}

/// Sync orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Feature flag: when false every drain is a no-op.
    pub enabled: bool,
    /// Workspace the queue drains into. Drains are skipped until set.
    pub workspace_id: Option<String>,
    /// Backoff delay after the first failed pass.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Upper bound for the backoff delay.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Cap for the consecutive-failure counter used as the backoff exponent.
    pub max_backoff_exponent: u32,
    /// How long `Success` stays visible before reverting to `Idle`.
    #[serde(with = "duration_ms")]
    pub success_display_delay: Duration,
    /// Timeout for a single request/acknowledge exchange.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Attempts per operation within one pass (1 = no per-request retry).
    pub request_attempts: u32,
    /// Delay between per-request attempts.
    #[serde(with = "duration_ms")]
    pub request_retry_delay: Duration,
    /// Minimum spacing between "backoff active" log lines.
    #[serde(with = "duration_ms")]
    pub skip_log_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workspace_id: None,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_backoff_exponent: 6,
            success_display_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            request_attempts: 2,
            request_retry_delay: Duration::from_millis(250),
            skip_log_interval: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_request_attempts(mut self, attempts: u32) -> Self {
        self.request_attempts = attempts;
        self
    }

    pub fn with_success_display_delay(mut self, delay: Duration) -> Self {
        self.success_display_delay = delay;
        self
    }
}

/// Storage health monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    /// Percent used at which the queue is reported low.
    pub low_percent: f64,
    /// Percent used at which the queue is reported critical.
    pub critical_percent: f64,
    /// Operation count that makes compaction eligible.
    pub auto_compact_threshold: usize,
    /// Minimum time between compactions.
    #[serde(with = "duration_ms")]
    pub compact_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            low_percent: 70.0,
            critical_percent: 90.0,
            auto_compact_threshold: 1_000,
            compact_cooldown: Duration::from_secs(60),
        }
    }
}

impl HealthConfig {
    pub fn with_auto_compact(mut self, threshold: usize, cooldown: Duration) -> Self {
        self.auto_compact_threshold = threshold;
        self.compact_cooldown = cooldown;
        self
    }
}

/// Session registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Idle time after which a remote session is pruned.
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Top-level configuration for the whole engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub merge: MergeConfig,
    pub sync: SyncConfig,
    pub health: HealthConfig,
    pub sessions: SessionConfig,
}

impl EngineConfig {
    /// Parse a JSON document. Missing sections fall back to defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.primary.validate("queue.primary")?;
        self.queue.fallback.validate("queue.fallback")?;

        if self.sync.base_delay > self.sync.max_delay {
            return Err(ConfigError::Invalid(
                "sync.baseDelay must not exceed sync.maxDelay".into(),
            ));
        }
        if self.sync.request_attempts == 0 {
            return Err(ConfigError::Invalid(
                "sync.requestAttempts must be at least 1".into(),
            ));
        }
        let health = &self.health;
        if !(0.0 < health.low_percent
            && health.low_percent <= health.critical_percent
            && health.critical_percent <= 100.0)
        {
            return Err(ConfigError::Invalid(
                "health thresholds must satisfy 0 < low <= critical <= 100".into(),
            ));
        }
        Ok(())
    }
}

/// Serialize durations as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queue.primary.max_operations, 5_000);
        assert_eq!(config.sessions.ttl, Duration::from_secs(300));
        assert!(config.queue.fallback.max_bytes < config.queue.primary.max_bytes);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(
            r#"{ "sync": { "workspaceId": "ws-1", "baseDelay": 500 } }"#,
        )
        .unwrap();

        assert_eq!(config.sync.workspace_id.as_deref(), Some("ws-1"));
        assert_eq!(config.sync.base_delay, Duration::from_millis(500));
        assert_eq!(config.sync.max_delay, Duration::from_secs(60));
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut config = EngineConfig::default();
        config.health.low_percent = 95.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_limits() {
        let config = EngineConfig {
            queue: QueueConfig::default().with_fallback(QueueLimits::new(0, 10, 1)),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_setters() {
        let sync = SyncConfig::default()
            .with_workspace("ws")
            .with_backoff(Duration::from_millis(10), Duration::from_millis(80))
            .with_request_attempts(1);
        assert_eq!(sync.workspace_id.as_deref(), Some("ws"));
        assert_eq!(sync.max_delay, Duration::from_millis(80));
        assert_eq!(sync.request_attempts, 1);
    }
}
