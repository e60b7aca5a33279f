//! Per-operation exponential backoff.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Backoff record of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BackoffState {
    /// No call for the operation is admitted before this instant.
    pub next_retry_at: Instant,
    /// Consecutive failures since the last success.
    pub retry_count: u32,
    /// Delay applied after the last failure.
    pub current_delay: Duration,
}

/// Maps operation names to their backoff state.
///
/// The delay starts at `base_delay`, grows by `multiplier` on every further
/// failure, never exceeds `max_delay`, and is forgotten on success.
#[derive(Debug)]
pub(crate) struct BackoffTracker {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    states: HashMap<String, BackoffState>,
}

impl BackoffTracker {
    /// Creates an empty tracker.
    pub(crate) fn new(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            multiplier: multiplier.max(1.0),
            states: HashMap::new(),
        }
    }

    /// Records a failure and returns the delay until the next attempt.
    ///
    /// A remote `hint` can lengthen the delay but never shortens it.
    pub(crate) fn record_failure(
        &mut self,
        operation: &str,
        now: Instant,
        hint: Option<Duration>,
    ) -> Duration {
        let delay = match self.states.get(operation) {
            Some(state) => self.grow(state.current_delay),
            None => self.base_delay,
        };
        let retry_count = self
            .states
            .get(operation)
            .map_or(1, |s| s.retry_count.saturating_add(1));
        let wait = hint.map_or(delay, |h| h.max(delay));

        self.states.insert(
            operation.to_owned(),
            BackoffState {
                next_retry_at: now.checked_add(wait).unwrap_or(now),
                retry_count,
                current_delay: delay,
            },
        );
        wait
    }

    /// Forgets the backoff of `operation`.
    pub(crate) fn clear(&mut self, operation: &str) {
        self.states.remove(operation);
    }

    /// Time left in the backoff window of `operation`, if any.
    pub(crate) fn remaining(&self, operation: &str, now: Instant) -> Option<Duration> {
        self.states
            .get(operation)
            .filter(|s| s.next_retry_at > now)
            .map(|s| s.next_retry_at.saturating_duration_since(now))
    }

    /// Current state of `operation`.
    pub(crate) fn state(&self, operation: &str) -> Option<&BackoffState> {
        self.states.get(operation)
    }

    /// Number of operations still inside their backoff window.
    pub(crate) fn active_count(&self, now: Instant) -> usize {
        self.states.values().filter(|s| s.next_retry_at > now).count()
    }

    /// Forgets every operation.
    pub(crate) fn reset(&mut self) {
        self.states.clear();
    }

    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    fn grow(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.multiplier)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}
