//! Retry/no-retry decisions and retry delays, by error class.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use courier_core::{ErrorClass, InboundMessage, MessageId, ProcessingError, class};

use super::types::{BackoffFamily, RetryInfo};

/// Retry strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryStrategyConfig {
    /// Ceiling for classes without a specific rule.
    pub default_max_retries: u32,
    /// Ceiling for network/IO classes.
    pub network_max_retries: u32,
    /// Ceiling for illegal-argument and null-pointer classes.
    pub argument_max_retries: u32,
    /// Messages published longer ago than this are not retried.
    #[serde(rename = "retry_window_ms", with = "crate::config::duration_ms")]
    pub retry_window: Duration,
    #[serde(rename = "exponential_base_ms", with = "crate::config::duration_ms")]
    pub exponential_base: Duration,
    #[serde(rename = "exponential_cap_ms", with = "crate::config::duration_ms")]
    pub exponential_cap: Duration,
    #[serde(rename = "linear_step_ms", with = "crate::config::duration_ms")]
    pub linear_step: Duration,
    #[serde(rename = "linear_cap_ms", with = "crate::config::duration_ms")]
    pub linear_cap: Duration,
    /// Flat delay; also the cap of the fixed family.
    #[serde(rename = "fixed_delay_ms", with = "crate::config::duration_ms")]
    pub fixed_delay: Duration,
    /// Uniform jitter factor (0.2 = ±20%).
    pub jitter: f64,
    /// Retry info untouched for this long is pruned.
    #[serde(rename = "retry_info_ttl_ms", with = "crate::config::duration_ms")]
    pub retry_info_ttl: Duration,
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            network_max_retries: 5,
            argument_max_retries: 1,
            retry_window: Duration::from_secs(24 * 60 * 60),
            exponential_base: Duration::from_secs(1),
            exponential_cap: Duration::from_secs(5 * 60),
            linear_step: Duration::from_secs(10),
            linear_cap: Duration::from_secs(2 * 60),
            fixed_delay: Duration::from_secs(30),
            jitter: 0.2,
            retry_info_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RetryStrategyConfig {
    pub fn with_default_max_retries(mut self, max: u32) -> Self {
        self.default_max_retries = max;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_fixed_delay(mut self, delay: Duration) -> Self {
        self.fixed_delay = delay;
        self
    }

    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = window;
        self
    }
}

/// Classes that are never retried.
static NON_RETRYABLE: [&ErrorClass; 3] = [
    &class::SECURITY,
    &class::UNSUPPORTED_OPERATION,
    &class::CLASS_CAST,
];

/// How often retry info is opportunistically pruned while recording, in millis.
const PRUNE_EVERY_MS: i64 = 60 * 60 * 1000;

/// Decides whether and when a failed message is retried.
///
/// Per-message state is keyed by broker message id and pruned after
/// `retry_info_ttl` of inactivity.
#[derive(Debug)]
pub struct DeadLetterRetryStrategy {
    config: RetryStrategyConfig,
    retry_info: DashMap<MessageId, RetryInfo>,
    last_prune_ms: AtomicI64,
}

impl Default for DeadLetterRetryStrategy {
    fn default() -> Self {
        Self::new(RetryStrategyConfig::default())
    }
}

impl DeadLetterRetryStrategy {
    pub fn new(config: RetryStrategyConfig) -> Self {
        Self {
            config,
            retry_info: DashMap::new(),
            last_prune_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn config(&self) -> &RetryStrategyConfig {
        &self.config
    }

    pub fn is_retryable(&self, class: &ErrorClass) -> bool {
        !NON_RETRYABLE.iter().any(|c| class.is_a(c))
    }

    pub fn max_retries_for(&self, class: &ErrorClass) -> u32 {
        if class.is_a(&class::IO) {
            self.config.network_max_retries
        } else if class.is_a(&class::ILLEGAL_ARGUMENT) || class.is_a(&class::NULL_POINTER) {
            self.config.argument_max_retries
        } else {
            self.config.default_max_retries
        }
    }

    pub fn backoff_family(&self, class: &ErrorClass) -> BackoffFamily {
        if class.is_a(&class::IO) {
            BackoffFamily::Exponential
        } else if class.is_a(&class::TIMEOUT) {
            BackoffFamily::Linear
        } else if class.is_a(&class::ILLEGAL_ARGUMENT) || class.is_a(&class::NULL_POINTER) {
            BackoffFamily::Immediate
        } else {
            BackoffFamily::Fixed
        }
    }

    /// Upper bound of any delay produced for `family`.
    pub fn cap_for(&self, family: BackoffFamily) -> Duration {
        match family {
            BackoffFamily::Exponential => self.config.exponential_cap,
            BackoffFamily::Linear => self.config.linear_cap,
            BackoffFamily::Fixed => {
                let secs = self.config.fixed_delay.as_secs_f64() * (1.0 + self.jitter());
                Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
            }
            BackoffFamily::Immediate => Duration::ZERO,
        }
    }

    fn jitter(&self) -> f64 {
        if self.config.jitter.is_finite() {
            self.config.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn should_retry(&self, message: &InboundMessage, retry_count: u32, error: &ProcessingError) -> bool {
        self.should_retry_at(message, retry_count, error, Utc::now())
    }

    pub fn should_retry_at(
        &self,
        message: &InboundMessage,
        retry_count: u32,
        error: &ProcessingError,
        now: DateTime<Utc>,
    ) -> bool {
        let class = error.class();

        if !self.is_retryable(class) {
            debug!(message_id = %message.id(), class = class.name(), "non-retryable error class");
            return false;
        }

        if retry_count >= self.max_retries_for(class) {
            return false;
        }

        let age = (now - message.publish_time()).to_std().unwrap_or_default();
        if age > self.config.retry_window {
            debug!(message_id = %message.id(), age_secs = age.as_secs(), "outside retry window");
            return false;
        }

        true
    }

    /// Delay before the next attempt.
    ///
    /// The delay is drawn uniformly from `[base × (1 − jitter), min(base × (1 + jitter), cap)]`,
    /// so a base already sitting at the family cap only jitters downward.
    pub fn calculate_delay(
        &self,
        _message: &InboundMessage,
        retry_count: u32,
        error: &ProcessingError,
    ) -> Duration {
        let family = self.backoff_family(error.class());
        let base = self.base_delay(family, retry_count);
        let jitter = self.jitter();
        if jitter == 0.0 || base.is_zero() {
            return base;
        }

        let base_ms = base.as_millis() as f64;
        let cap_ms = self.cap_for(family).as_millis() as f64;
        let low = base_ms * (1.0 - jitter);
        let high = (base_ms * (1.0 + jitter)).min(cap_ms);
        let delay_ms = if high > low {
            rand::thread_rng().gen_range(low..=high)
        } else {
            high
        };
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Delay before jitter.
    pub fn base_delay(&self, family: BackoffFamily, retry_count: u32) -> Duration {
        let delay_ms = match family {
            BackoffFamily::Immediate => 0.0,
            BackoffFamily::Fixed => self.config.fixed_delay.as_millis() as f64,
            BackoffFamily::Exponential => {
                let exp = 2_f64.powi(retry_count.min(62) as i32);
                self.config.exponential_base.as_millis() as f64 * exp
            }
            BackoffFamily::Linear => {
                self.config.linear_step.as_millis() as f64 * (f64::from(retry_count) + 1.0)
            }
        };
        let cap_ms = self.cap_for(family).as_millis() as f64;
        Duration::from_millis(delay_ms.min(cap_ms) as u64)
    }

    /// Retries already spent on `message`: the larger of our own count and
    /// the broker's redelivery count.
    pub fn retry_count(&self, message: &InboundMessage) -> u32 {
        let tracked = self
            .retry_info
            .get(&message.id())
            .map(|info| info.retry_count)
            .unwrap_or(0);
        tracked.max(message.redelivery_count())
    }

    /// Record that `message` is about to be retried for the `retry_count + 1`-th time.
    pub fn record_retry(
        &self,
        message: &InboundMessage,
        retry_count: u32,
        error: &ProcessingError,
        next_delay: Duration,
    ) -> RetryInfo {
        let now = Utc::now();
        let info = RetryInfo {
            message_id: message.id(),
            retry_count: retry_count.saturating_add(1),
            last_retry_at: now,
            last_error_class: error.class().name().to_string(),
            next_delay,
        };
        self.retry_info.insert(message.id(), info.clone());
        self.maybe_prune(now);
        info
    }

    pub fn retry_info(&self, id: MessageId) -> Option<RetryInfo> {
        self.retry_info.get(&id).map(|info| info.clone())
    }

    /// Forget a message (processed, dropped, or dead-lettered).
    pub fn clear(&self, id: MessageId) {
        self.retry_info.remove(&id);
    }

    pub fn tracked(&self) -> usize {
        self.retry_info.len()
    }

    /// Drop retry info idle for longer than the configured ttl. Returns how many were removed.
    pub fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.config.retry_info_ttl)
            .unwrap_or(chrono::Duration::MAX);
        let before = self.retry_info.len();
        self.retry_info
            .retain(|_, info| now.signed_duration_since(info.last_retry_at) <= ttl);
        self.last_prune_ms.store(now.timestamp_millis(), Ordering::Relaxed);

        let removed = before.saturating_sub(self.retry_info.len());
        if removed > 0 {
            debug!(removed, "pruned idle retry info");
        }
        removed
    }

    fn maybe_prune(&self, now: DateTime<Utc>) {
        let last = self.last_prune_ms.load(Ordering::Relaxed);
        if now.timestamp_millis() - last >= PRUNE_EVERY_MS {
            self.prune_idle(now);
        }
    }
}
