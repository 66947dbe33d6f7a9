use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::QueueError;
use crate::item::DEFAULT_MAX_ATTEMPTS;

pub const DEFAULT_EXPIRY_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_JITTER_RATIO: f64 = 0.3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_BASE_BACKOFF_MS,
            cap_ms: DEFAULT_MAX_BACKOFF_MS,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.base_ms == 0 {
            return Err(QueueError::Config("backoff.base_ms must be > 0".into()));
        }
        if self.cap_ms < self.base_ms {
            return Err(QueueError::Config(
                "backoff.cap_ms must be >= backoff.base_ms".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(QueueError::Config(
                "backoff.jitter_ratio must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub default_max_attempts: u32,
    pub expiry_window_ms: u64,
    pub backoff: BackoffConfig,
    /// Buffered events per subscriber before slow receivers start lagging.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            expiry_window_ms: DEFAULT_EXPIRY_WINDOW_MS,
            backoff: BackoffConfig::default(),
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    pub fn from_json_str(json: &str) -> Result<Self, QueueError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| QueueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.default_max_attempts == 0 {
            return Err(QueueError::Config(
                "default_max_attempts must be > 0".into(),
            ));
        }
        if self.expiry_window_ms == 0 {
            return Err(QueueError::Config("expiry_window_ms must be > 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(QueueError::Config("event_capacity must be > 0".into()));
        }
        self.backoff.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub poll_interval_ms: u64,
    pub max_concurrency: usize,
    /// Upper bound on items started per pass.
    pub batch_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_concurrency: 4,
            batch_limit: 100,
        }
    }
}

impl DispatchConfig {
    pub fn from_json_str(json: &str) -> Result<Self, QueueError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| QueueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.poll_interval_ms == 0 {
            return Err(QueueError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.max_concurrency == 0 {
            return Err(QueueError::Config("max_concurrency must be > 0".into()));
        }
        if self.batch_limit == 0 {
            return Err(QueueError::Config("batch_limit must be > 0".into()));
        }
        Ok(())
    }
}
