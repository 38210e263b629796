//! Configuration types for the router.

use crate::error::{Error, Result};
use crate::types::Credentials;
use std::time::Duration;

/// Minimal (and default) timeout of a router call.
pub const CALL_TIMEOUT_MIN: Duration = Duration::from_millis(500);

/// Default bound for one discovery sweep.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause between two background discovery sweeps.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// Main configuration for the router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Number of buckets in the cluster. Required, fixed for the router lifetime.
    pub total_bucket_count: u64,

    /// How the bucket discovery sweeper runs.
    pub discovery_mode: DiscoveryMode,

    /// Upper bound for one discovery sweep.
    pub discovery_timeout: Duration,

    /// Pause between sweeps in [`DiscoveryMode::On`].
    pub discovery_interval: Duration,

    /// Credentials presented to storage nodes.
    pub credentials: Credentials,

    /// Delay policy between call retries.
    pub retry_policy: RetryPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            total_bucket_count: 0,
            discovery_mode: DiscoveryMode::On,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            credentials: Credentials::default(),
            retry_policy: RetryPolicy::Immediate,
        }
    }
}

impl RouterConfig {
    /// Create a new configuration for a cluster with the given bucket count.
    pub fn new(total_bucket_count: u64) -> Self {
        Self {
            total_bucket_count,
            ..Default::default()
        }
    }

    /// Set discovery mode.
    pub fn with_discovery_mode(mut self, mode: DiscoveryMode) -> Self {
        self.discovery_mode = mode;
        self
    }

    /// Set discovery timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set pause between background sweeps.
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Set storage credentials.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Credentials::new(user, password);
        self
    }

    /// Set retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Check the configuration before building a router.
    pub fn validate(&self) -> Result<()> {
        if self.total_bucket_count == 0 {
            return Err(Error::Config("total_bucket_count must be > 0".into()));
        }
        if self.discovery_mode != DiscoveryMode::Off && self.discovery_timeout.is_zero() {
            return Err(Error::Config("discovery_timeout must be > 0".into()));
        }
        if self.discovery_mode == DiscoveryMode::On && self.discovery_interval.is_zero() {
            return Err(Error::Config("discovery_interval must be > 0".into()));
        }
        self.retry_policy.validate()
    }
}

/// Bucket discovery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryMode {
    /// Sweep at startup, then periodically in the background.
    #[default]
    On,
    /// Sweep once at startup to warm the cache.
    Once,
    /// Never sweep; buckets are resolved on demand only.
    Off,
}

/// Delay between attempts of a single-bucket call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Retry right away until the deadline.
    #[default]
    Immediate,
    /// Exponential backoff starting at `initial`, capped at `max`.
    Backoff { initial: Duration, max: Duration },
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1 is the first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::Immediate => Duration::ZERO,
            RetryPolicy::Backoff { initial, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                initial.saturating_mul(1 << shift).min(max)
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            RetryPolicy::Immediate => Ok(()),
            RetryPolicy::Backoff { initial, max } if initial.is_zero() || max < initial => Err(
                Error::Config("backoff requires 0 < initial <= max".into()),
            ),
            RetryPolicy::Backoff { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert_eq!(config.discovery_mode, DiscoveryMode::On);
        assert_eq!(config.retry_policy, RetryPolicy::Immediate);
        assert!(config.validate().is_err(), "bucket count is required");
    }

    #[test]
    fn test_config_builder() {
        let config = RouterConfig::new(3000)
            .with_discovery_mode(DiscoveryMode::Once)
            .with_discovery_timeout(Duration::from_secs(5))
            .with_credentials("storage", "storage");

        assert_eq!(config.total_bucket_count, 3000);
        assert_eq!(config.discovery_mode, DiscoveryMode::Once);
        assert_eq!(config.credentials.user, "storage");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let policy = RetryPolicy::Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
        assert_eq!(policy.delay(4), Duration::from_millis(50));
        assert_eq!(policy.delay(100), Duration::from_millis(50));
        assert_eq!(RetryPolicy::Immediate.delay(7), Duration::ZERO);
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let config = RouterConfig::new(10).with_retry_policy(RetryPolicy::Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(10),
        });
        assert!(config.validate().is_err());
    }
}
