//! Configuration structs.
//!
//! Every struct deserializes with `#[serde(default)]`, so a host only needs to
//! spell out the fields it overrides. Defaults are conservative values for an
//! unknown remote quota, not limits of any particular platform.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::Priority;

/// Rate limiting and retry settings for `RequestScheduler`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct RateLimitConfig {
    /// Calls allowed per operation in any rolling minute.
    pub max_requests_per_minute: usize,
    /// Calls allowed per operation in any rolling hour.
    pub max_requests_per_hour: usize,
    /// Extra calls Critical/High requests may make inside `burst_window_ms`.
    pub burst_allowance: usize,
    /// Window used to count burst calls.
    pub burst_window_ms: u64,
    /// Growth factor applied to the backoff delay on each failure.
    pub backoff_multiplier: f64,
    /// First backoff delay.
    pub base_delay_ms: u64,
    /// Backoff ceiling.
    pub max_delay_ms: u64,
    /// Retries after the first attempt before a request is rejected.
    pub max_retries: u32,
    /// Overall timeout for one remote call attempt.
    pub request_timeout_ms: u64,
    /// Interval of the queue-draining loop.
    pub queue_tick_ms: u64,
    /// Queue ordering weights.
    pub priority_weights: PriorityWeights,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 30,
            max_requests_per_hour: 500,
            burst_allowance: 5,
            burst_window_ms: 10_000,
            backoff_multiplier: 2.0,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_retries: 3,
            request_timeout_ms: 30_000,
            queue_tick_ms: 1_000,
            priority_weights: PriorityWeights::default(),
        }
    }
}

impl RateLimitConfig {
    /// Burst counting window.
    #[must_use]
    pub const fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }

    /// First backoff delay.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Backoff ceiling.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Per-attempt timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Queue drain interval. Never zero.
    #[must_use]
    pub fn queue_tick(&self) -> Duration {
        Duration::from_millis(self.queue_tick_ms.max(1))
    }
}

/// Weight of each priority in the request queue. Higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    /// Weight of `Priority::Critical`.
    pub critical: u32,
    /// Weight of `Priority::High`.
    pub high: u32,
    /// Weight of `Priority::Medium`.
    pub medium: u32,
    /// Weight of `Priority::Low`.
    pub low: u32,
    /// Weight of `Priority::Background`.
    pub background: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            critical: 100,
            high: 75,
            medium: 50,
            low: 25,
            background: 10,
        }
    }
}

impl PriorityWeights {
    /// Returns the weight for `priority`.
    #[must_use]
    pub const fn weight(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
            Priority::Background => self.background,
        }
    }
}

/// Polling cadence and failure handling for `PollSynchronizer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct PollConfig {
    /// Delay between the end of one cycle and the start of the next.
    pub interval_ms: u64,
    /// Growth factor applied per consecutive failed fetch.
    pub backoff_multiplier: f64,
    /// Ceiling for the backed-off interval.
    pub max_interval_ms: u64,
    /// Consecutive failed fetches before the session is given up.
    pub max_retries: u32,
    /// Scheduler operation name used for fetches.
    pub fetch_operation: String,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            backoff_multiplier: 2.0,
            max_interval_ms: 300_000,
            max_retries: 5,
            fetch_operation: String::from("getComments"),
        }
    }
}

impl PollConfig {
    /// Base polling interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Delay before the next cycle after `error_count` consecutive failures.
    ///
    /// `interval * multiplier^error_count`, capped at `max_interval_ms`.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn retry_delay(&self, error_count: u32) -> Duration {
        let exponent = i32::try_from(error_count).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let base_secs = self.interval().as_secs_f64();
        let max = Duration::from_millis(self.max_interval_ms);
        Duration::try_from_secs_f64(base_secs * factor).map_or(max, |d| d.min(max))
    }
}

/// Countdown settings for `ClientTimerSync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct TimerConfig {
    /// Interval between tick events.
    pub tick_interval_ms: u64,
    /// Scheduler operation name used for reference-time fetches.
    pub sync_operation: String,
    /// Period of background offset recalibration while a countdown runs.
    /// Zero disables it.
    pub resync_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            sync_operation: String::from("getReferenceTime"),
            resync_interval_ms: 30_000,
        }
    }
}

impl TimerConfig {
    /// Tick interval. Never zero.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Recalibration period, or `None` when disabled.
    #[must_use]
    pub const fn resync_interval(&self) -> Option<Duration> {
        if self.resync_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.resync_interval_ms))
        }
    }
}

/// All core settings, as embedded in a host configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct SyncConfig {
    /// Scheduler settings.
    pub rate_limit: RateLimitConfig,
    /// Polling settings.
    pub polling: PollConfig,
    /// Timer settings.
    pub timer: TimerConfig,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_partial_override_keeps_defaults() {
        // Arrange
        let toml_str = r"
            [rate_limit]
            max_requests_per_minute = 2

            [polling]
            interval_ms = 1000
        ";

        // Act
        let config: SyncConfig = toml::from_str(toml_str).unwrap();

        // Assert
        assert_eq!(config.rate_limit.max_requests_per_minute, 2);
        assert_eq!(config.rate_limit.max_requests_per_hour, 500);
        assert_eq!(config.rate_limit.priority_weights, PriorityWeights::default());
        assert_eq!(config.polling.interval_ms, 1000);
        assert_eq!(config.polling.fetch_operation, "getComments");
        assert_eq!(config.timer, TimerConfig::default());
    }

    #[test]
    fn test_priority_weights_order() {
        // Arrange
        let weights = PriorityWeights::default();

        // Act
        let ordered = [
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low,
            Priority::Background,
        ]
        .map(|p| weights.weight(p));

        // Assert
        assert!(ordered.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_poll_retry_delay_grows_and_caps() {
        // Arrange
        let config = PollConfig {
            interval_ms: 5_000,
            backoff_multiplier: 2.0,
            max_interval_ms: 30_000,
            ..PollConfig::default()
        };

        // Act & Assert
        assert_eq!(config.retry_delay(0), Duration::from_secs(5));
        assert_eq!(config.retry_delay(1), Duration::from_secs(10));
        assert_eq!(config.retry_delay(2), Duration::from_secs(20));
        assert_eq!(config.retry_delay(3), Duration::from_secs(30));
        assert_eq!(config.retry_delay(40), Duration::from_secs(30));
    }
}
