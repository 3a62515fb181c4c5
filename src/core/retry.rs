//! Retry policy for task attempts and backoff for store access.
//!
//! Task retries are immediate by default; the delay is configurable. The
//! number of attempts is always bounded by [`SYSTEM_RETRY_CEILING`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::definition::TaskDefinition;

/// System-wide bound on attempts per task, independent of declared ceilings.
pub const SYSTEM_RETRY_CEILING: u32 = 10;

/// Retry policy for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether failed attempts are retried at all.
    pub enabled: bool,
    /// Total attempts allowed, including the first. Always at least 1.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    #[serde(with = "serde_millis")]
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy that never retries.
    pub fn none() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Derive the effective policy of a task definition.
    ///
    /// Attempts are capped at `min(max_retries, SYSTEM_RETRY_CEILING)`; the
    /// first attempt is always made, so the cap never drops below one.
    pub fn for_task(task: &TaskDefinition) -> Self {
        if !task.retry_on_failure {
            return Self::none();
        }
        Self {
            enabled: true,
            max_attempts: task.max_retries.clamp(1, SYSTEM_RETRY_CEILING),
            delay: Duration::ZERO,
        }
    }

    /// Builder: set the delay between attempts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Check if another attempt is allowed after `attempts` failed ones.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.enabled && attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Exponential backoff used for store calls and definition refreshes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Attempts per operation before giving up (at least 1).
    pub max_attempts: u32,
    /// Delay after the first failure.
    #[serde(with = "serde_millis", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "serde_millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
}

impl Backoff {
    /// Create a backoff policy.
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Backoff that tries exactly once.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay to wait after the given number of consecutive failures.
    ///
    /// Doubles from `initial_delay` and saturates at `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = failures.saturating_sub(1).min(31);
        let raw = self
            .initial_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay);
        raw.min(self.max_delay)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200), Duration::from_secs(5))
    }
}

/// Serde helper serializing a Duration as whole milliseconds.
pub(crate) mod serde_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
