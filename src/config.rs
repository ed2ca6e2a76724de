//! Queue configuration.
//!
//! Connection URL, queue-name, status retention, size limits and retry timing
//! are supplied once when a [`QueueManager`](crate::queue::QueueManager) is
//! built and never renegotiated at runtime.

use std::time::Duration;
use thiserror::Error;

use crate::queue::RetryPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for one queue-name.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Backing store URL.
    pub redis_url: String,
    /// Queue-name; every key of this queue is prefixed with it.
    pub queue_name: String,
    /// How long Status Records survive without being refreshed.
    pub status_retention: Duration,
    /// Maximum pending depth before enqueue is refused (0 disables the limit).
    pub max_queue_size: usize,
    /// Number of connection attempts made by `connect()`.
    pub connect_attempts: u32,
    /// Upper bound for the delay between connection attempts.
    pub connect_max_backoff: Duration,
    /// Backoff policy for failed tasks.
    pub retry: RetryPolicy,
    /// Age after which an unacknowledged in-flight task is considered abandoned.
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue_name: "ai_editor".to_string(),
            status_retention: Duration::from_secs(24 * 3600),
            max_queue_size: 10_000,
            connect_attempts: 5,
            connect_max_backoff: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            visibility_timeout: Duration::from_secs(1800),
        }
    }
}

impl QueueConfig {
    /// Creates a configuration for `queue_name` with default values.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: store URL (default: redis://127.0.0.1:6379)
    /// - `QUEUE_NAME`: queue-name (default: ai_editor)
    /// - `QUEUE_STATUS_RETENTION_HOURS`: Status Record TTL (default: 24)
    /// - `QUEUE_MAX_SIZE`: pending-depth limit, 0 for none (default: 10000)
    /// - `QUEUE_CONNECT_ATTEMPTS`: connection attempts (default: 5)
    /// - `QUEUE_CONNECT_MAX_BACKOFF_SECS`: connection backoff cap (default: 30)
    /// - `QUEUE_RETRY_BASE_SECS`: first retry delay (default: 60)
    /// - `QUEUE_RETRY_MAX_SECS`: retry delay cap (default: 300)
    /// - `QUEUE_VISIBILITY_TIMEOUT_SECS`: reaper threshold (default: 1800)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        }

        if let Some(val) = lookup("QUEUE_NAME") {
            config.queue_name = val;
        }

        if let Some(val) = lookup("QUEUE_STATUS_RETENTION_HOURS") {
            let hours: u64 = parse_env_value(&val, "QUEUE_STATUS_RETENTION_HOURS")?;
            config.status_retention = hours_to_duration(hours, "QUEUE_STATUS_RETENTION_HOURS")?;
        }

        if let Some(val) = lookup("QUEUE_MAX_SIZE") {
            config.max_queue_size = parse_env_value(&val, "QUEUE_MAX_SIZE")?;
        }

        if let Some(val) = lookup("QUEUE_CONNECT_ATTEMPTS") {
            config.connect_attempts = parse_env_value(&val, "QUEUE_CONNECT_ATTEMPTS")?;
        }

        if let Some(val) = lookup("QUEUE_CONNECT_MAX_BACKOFF_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_CONNECT_MAX_BACKOFF_SECS")?;
            config.connect_max_backoff = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("QUEUE_RETRY_BASE_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_RETRY_BASE_SECS")?;
            config.retry.base_delay = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("QUEUE_RETRY_MAX_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_RETRY_MAX_SECS")?;
            config.retry.max_delay = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("QUEUE_VISIBILITY_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_VISIBILITY_TIMEOUT_SECS")?;
            config.visibility_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.queue_name.is_empty() || self.queue_name.contains(char::is_whitespace) {
            return Err(ConfigError::ValidationFailed(
                "queue_name must be non-empty and contain no whitespace".to_string(),
            ));
        }

        if self.status_retention.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "status_retention must be greater than 0".to_string(),
            ));
        }

        if self.connect_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "connect_attempts must be greater than 0".to_string(),
            ));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationFailed(
                "retry base delay cannot exceed retry max delay".to_string(),
            ));
        }

        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "visibility_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the store URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the queue-name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Builder method to set the status retention window in hours.
    ///
    /// Values too large to represent in seconds saturate.
    pub fn with_status_retention_hours(mut self, hours: u64) -> Self {
        self.status_retention = Duration::from_secs(hours.saturating_mul(SECS_PER_HOUR));
        self
    }

    /// Builder method to set the pending-depth limit.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Builder method to set connection attempts and backoff cap.
    pub fn with_connect_policy(mut self, attempts: u32, max_backoff: Duration) -> Self {
        self.connect_attempts = attempts;
        self.connect_max_backoff = max_backoff;
        self
    }

    /// Builder method to set the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builder method to set the visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into a type.
const SECS_PER_HOUR: u64 = 3600;

/// Converts a whole number of hours, rejecting values that overflow seconds.
pub(crate) fn hours_to_duration(hours: u64, key: &str) -> Result<Duration, ConfigError> {
    hours
        .checked_mul(SECS_PER_HOUR)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{} hours is out of range", hours),
        })
}

pub(crate) fn parse_env_value<T: std::str::FromStr>(
    value: &str,
    key: &str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.queue_name, "ai_editor");
        assert_eq!(config.status_retention, Duration::from_secs(86_400));
        assert_eq!(config.max_queue_size, 10_000);
        assert_eq!(config.connect_attempts, 5);
        assert_eq!(config.connect_max_backoff, Duration::from_secs(30));
        assert_eq!(config.retry.base_delay, Duration::from_secs(60));
        assert_eq!(config.retry.max_delay, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = QueueConfig::from_lookup(lookup_from(&[
            ("REDIS_URL", "redis://cache:6380/2"),
            ("QUEUE_NAME", "translation_jobs"),
            ("QUEUE_STATUS_RETENTION_HOURS", "48"),
            ("QUEUE_MAX_SIZE", "0"),
            ("QUEUE_RETRY_BASE_SECS", "10"),
            ("QUEUE_RETRY_MAX_SECS", "40"),
            ("QUEUE_VISIBILITY_TIMEOUT_SECS", "600"),
        ]))
        .expect("config should parse");

        assert_eq!(config.redis_url, "redis://cache:6380/2");
        assert_eq!(config.queue_name, "translation_jobs");
        assert_eq!(config.status_retention, Duration::from_secs(48 * 3600));
        assert_eq!(config.max_queue_size, 0);
        assert_eq!(config.retry.base_delay, Duration::from_secs(10));
        assert_eq!(config.retry.max_delay, Duration::from_secs(40));
        assert_eq!(config.visibility_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let result = QueueConfig::from_lookup(lookup_from(&[("QUEUE_MAX_SIZE", "lots")]));
        let err = result.expect_err("should reject non-numeric size");
        assert!(err.to_string().contains("QUEUE_MAX_SIZE"));
    }

    #[test]
    fn test_huge_retention_hours_rejected_not_overflowed() {
        let huge = u64::MAX.to_string();
        let err = QueueConfig::from_lookup(lookup_from(&[(
            "QUEUE_STATUS_RETENTION_HOURS",
            huge.as_str(),
        )]))
        .expect_err("overflowing hours must be rejected");
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "QUEUE_STATUS_RETENTION_HOURS"));

        let config = QueueConfig::new("q").with_status_retention_hours(u64::MAX);
        assert_eq!(config.status_retention, Duration::from_secs(u64::MAX));
        assert_eq!(hours_to_duration(2, "x").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_validation_rejects_whitespace_queue_name() {
        let config = QueueConfig::new("pdf chapter");
        let err = config.validate().expect_err("whitespace is not allowed");
        assert!(err.to_string().contains("queue_name"));
    }

    #[test]
    fn test_validation_rejects_inverted_retry_bounds() {
        let config = QueueConfig::default().with_retry_policy(RetryPolicy::new(
            Duration::from_secs(600),
            Duration::from_secs(300),
        ));
        let err = config.validate().expect_err("base above cap");
        assert!(err.to_string().contains("retry"));
    }

    #[test]
    fn test_config_builder() {
        let config = QueueConfig::new("video_export")
            .with_redis_url("redis://other:6379")
            .with_status_retention_hours(2)
            .with_max_queue_size(5)
            .with_connect_policy(3, Duration::from_secs(4))
            .with_visibility_timeout(Duration::from_secs(90));

        assert_eq!(config.queue_name, "video_export");
        assert_eq!(config.redis_url, "redis://other:6379");
        assert_eq!(config.status_retention, Duration::from_secs(7200));
        assert_eq!(config.max_queue_size, 5);
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.connect_max_backoff, Duration::from_secs(4));
        assert_eq!(config.visibility_timeout, Duration::from_secs(90));
    }
}
