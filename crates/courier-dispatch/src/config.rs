//! # Dispatcher Configuration
//!
//! Typed configuration with defaults. Call [`DispatcherConfig::validate`]
//! (done by `Dispatcher::new`) before use.

use crate::errors::ConfigError;
use std::time::Duration;

/// Default primary content topic.
pub const DEFAULT_CONTENT_TOPIC: &str = "/courier/1/messages/json";

/// Default pubsub topic.
pub const DEFAULT_PUBSUB_TOPIC: &str = "/courier/2/default/proto";

/// Top-level dispatcher configuration.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Primary content topic; default for registrations and emits
    pub content_topic: String,
    /// Pubsub topic all traffic is carried on
    pub pubsub_topic: String,
    /// Persist successfully emitted non-ephemeral messages with direction `Out`
    pub store_outbound: bool,
    /// Duplicate filter bounds
    pub duplicate_cache: DuplicateCacheConfig,
    /// Subscription health settings
    pub subscription: SubscriptionConfig,
    /// Backfill settings
    pub reconciliation: ReconciliationConfig,
    /// Publish retry settings
    pub retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            content_topic: DEFAULT_CONTENT_TOPIC.to_string(),
            pubsub_topic: DEFAULT_PUBSUB_TOPIC.to_string(),
            store_outbound: true,
            duplicate_cache: DuplicateCacheConfig::default(),
            subscription: SubscriptionConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Set the primary content topic.
    pub fn with_content_topic(mut self, topic: impl Into<String>) -> Self {
        self.content_topic = topic.into();
        self
    }

    /// Set the pubsub topic.
    pub fn with_pubsub_topic(mut self, topic: impl Into<String>) -> Self {
        self.pubsub_topic = topic.into();
        self
    }

    /// Check every section for values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.content_topic.trim().is_empty() {
            return Err(ConfigError::EmptyContentTopic);
        }
        if self.pubsub_topic.trim().is_empty() {
            return Err(ConfigError::EmptyPubsubTopic);
        }
        self.duplicate_cache.validate()?;
        self.subscription.validate()?;
        self.reconciliation.validate()?;
        self.retry.validate()
    }
}

/// Bounded duplicate filter sizing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DuplicateCacheConfig {
    /// Trim once the cache holds more than this many hashes
    pub max_entries: usize,
    /// Number of most recent hashes kept after a trim
    pub retain_after_trim: usize,
}

impl Default for DuplicateCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            retain_after_trim: 5_000,
        }
    }
}

impl DuplicateCacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::Zero("duplicate_cache.max_entries"));
        }
        if self.retain_after_trim >= self.max_entries {
            return Err(ConfigError::TrimBound {
                retain: self.retain_after_trim,
                max: self.max_entries,
            });
        }
        Ok(())
    }
}

/// Heartbeat and resubscription policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Interval between subscription pings
    pub heartbeat_interval: Duration,
    /// Backoff step; attempt `n` waits `n * base_backoff`
    pub base_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Consecutive failures before the subscription object is recreated
    pub max_attempts: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl SubscriptionConfig {
    /// Delay before resubscription attempt `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(attempt.max(1))
            .min(self.max_backoff)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("subscription.heartbeat_interval"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("subscription.max_attempts"));
        }
        if self.max_backoff < self.base_backoff {
            return Err(ConfigError::BackoffRange {
                base: self.base_backoff,
                max: self.max_backoff,
            });
        }
        Ok(())
    }
}

/// Local replay and network backfill windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconciliationConfig {
    /// Subtracted from the window start to absorb clock skew
    pub overlap_margin: Duration,
    /// Added past "now" for senders with fast clocks
    pub future_skew_margin: Duration,
    /// Window length when there is no local history
    pub default_lookback: Duration,
    /// Messages per history page
    pub page_size: usize,
    /// Deadline for each page
    pub page_timeout: Duration,
    /// Periodic reconciliation; `None` disables the timer
    pub interval: Option<Duration>,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            overlap_margin: Duration::from_secs(60),
            future_skew_margin: Duration::from_secs(60),
            default_lookback: Duration::from_secs(6 * 60 * 60),
            page_size: 100,
            page_timeout: Duration::from_secs(30),
            interval: Some(Duration::from_secs(5 * 60)),
        }
    }
}

impl ReconciliationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Zero("reconciliation.page_size"));
        }
        if self.page_timeout.is_zero() {
            return Err(ConfigError::Zero("reconciliation.page_timeout"));
        }
        if matches!(self.interval, Some(d) if d.is_zero()) {
            return Err(ConfigError::Zero("reconciliation.interval"));
        }
        Ok(())
    }
}

/// Failed-publish retry queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Enqueue undelivered publishes and drain them periodically
    pub enabled: bool,
    /// Interval between drain cycles
    pub drain_interval: Duration,
    /// Pause between consecutive resends within one cycle
    pub send_spacing: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            drain_interval: Duration::from_secs(10),
            send_spacing: Duration::from_millis(500),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.drain_interval.is_zero() {
            return Err(ConfigError::Zero("retry.drain_interval"));
        }
        Ok(())
    }
}
