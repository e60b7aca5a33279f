//! Per-operation call history over a rolling window.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use super::priority::Priority;

/// Default retention of history entries.
pub(crate) const HISTORY_RETENTION: Duration = Duration::from_secs(86_400);

/// Completion data of a recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Outcome {
    /// Whether the call succeeded.
    pub success: bool,
    /// Wall time the call took.
    pub duration: Duration,
}

/// One recorded call. `outcome` is `None` while the call is in flight.
#[derive(Debug, Clone)]
pub(crate) struct HistoryEntry {
    pub id: u64,
    pub timestamp: Instant,
    pub priority: Priority,
    pub outcome: Option<Outcome>,
}

/// Aggregates over the retained history.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct HistorySummary {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub total_duration: Duration,
    pub by_priority: BTreeMap<Priority, usize>,
}

/// Append-only call log, partitioned by operation.
///
/// Entries are recorded when a call is admitted, so in-flight calls count
/// against the rate windows. Expired entries are purged lazily on write.
#[derive(Debug)]
pub(crate) struct RequestHistory {
    retention: Duration,
    entries: HashMap<String, VecDeque<HistoryEntry>>,
    next_id: u64,
}

impl RequestHistory {
    /// Creates an empty history keeping entries for `retention`.
    pub(crate) fn new(retention: Duration) -> Self {
        Self {
            retention,
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    /// Records the admission of a call and returns its entry id.
    pub(crate) fn record_start(&mut self, operation: &str, priority: Priority, now: Instant) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let retention = self.retention;
        let window = self.entries.entry(operation.to_owned()).or_default();
        if let Some(cutoff) = now.checked_sub(retention) {
            while window.front().is_some_and(|e| e.timestamp < cutoff) {
                window.pop_front();
            }
        }
        window.push_back(HistoryEntry {
            id,
            timestamp: now,
            priority,
            outcome: None,
        });
        id
    }

    /// Attaches the outcome to a previously started entry.
    pub(crate) fn record_finish(&mut self, operation: &str, id: u64, success: bool, duration: Duration) {
        if let Some(entry) = self
            .entries
            .get_mut(operation)
            .and_then(|w| w.iter_mut().rev().find(|e| e.id == id))
        {
            entry.outcome = Some(Outcome { success, duration });
        }
    }

    /// Removes an entry whose call never ran.
    pub(crate) fn discard(&mut self, operation: &str, id: u64) {
        if let Some(window) = self.entries.get_mut(operation) {
            window.retain(|e| e.id != id);
        }
    }

    /// Number of calls for `operation` admitted at or after `since`.
    pub(crate) fn count_since(&self, operation: &str, since: Option<Instant>) -> usize {
        self.entries.get(operation).map_or(0, |w| match since {
            Some(since) => w.iter().rev().take_while(|e| e.timestamp >= since).count(),
            None => w.len(),
        })
    }

    /// Timestamp of the oldest call for `operation` at or after `since`.
    pub(crate) fn oldest_since(&self, operation: &str, since: Option<Instant>) -> Option<Instant> {
        self.entries.get(operation).and_then(|w| {
            w.iter()
                .find(|e| since.is_none_or(|s| e.timestamp >= s))
                .map(|e| e.timestamp)
        })
    }

    /// Aggregates all entries younger than the retention window.
    pub(crate) fn summary(&self, now: Instant) -> HistorySummary {
        let cutoff = now.checked_sub(self.retention);
        let mut summary = HistorySummary::default();
        for entry in self
            .entries
            .values()
            .flatten()
            .filter(|e| cutoff.is_none_or(|c| e.timestamp >= c))
        {
            summary.total = summary.total.saturating_add(1);
            let slot = summary.by_priority.entry(entry.priority).or_insert(0);
            *slot = slot.saturating_add(1);
            if let Some(outcome) = entry.outcome {
                summary.completed = summary.completed.saturating_add(1);
                summary.total_duration = summary.total_duration.saturating_add(outcome.duration);
                if outcome.success {
                    summary.succeeded = summary.succeeded.saturating_add(1);
                }
            }
        }
        summary
    }

    /// Drops every entry.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_count_since_uses_window() {
        // Arrange
        let mut history = RequestHistory::new(HISTORY_RETENTION);
        history.record_start("getComments", Priority::Medium, Instant::now());
        tokio::time::advance(Duration::from_secs(61)).await;
        history.record_start("getComments", Priority::Medium, Instant::now());
        history.record_start("getComments", Priority::Low, Instant::now());

        // Act
        let now = Instant::now();
        let last_minute = history.count_since("getComments", now.checked_sub(Duration::from_secs(60)));
        let all = history.count_since("getComments", None);

        // Assert
        assert_eq!(last_minute, 2);
        assert_eq!(all, 3);
        assert_eq!(history.count_since("submitPost", None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_pruned_on_write() {
        // Arrange
        let mut history = RequestHistory::new(Duration::from_secs(3600));
        history.record_start("getComments", Priority::Medium, Instant::now());
        tokio::time::advance(Duration::from_secs(3601)).await;

        // Act
        history.record_start("getComments", Priority::Medium, Instant::now());

        // Assert
        assert_eq!(history.count_since("getComments", None), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_counts_outcomes() {
        // Arrange
        let mut history = RequestHistory::new(HISTORY_RETENTION);
        let now = Instant::now();
        let a = history.record_start("submitPost", Priority::High, now);
        let b = history.record_start("submitPost", Priority::High, now);
        let _pending = history.record_start("getComments", Priority::Medium, now);
        history.record_finish("submitPost", a, true, Duration::from_millis(100));
        history.record_finish("submitPost", b, false, Duration::from_millis(300));

        // Act
        let summary = history.summary(now);

        // Assert
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.total_duration, Duration::from_millis(400));
        assert_eq!(summary.by_priority.get(&Priority::High), Some(&2));
        assert_eq!(summary.by_priority.get(&Priority::Medium), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_removes_reservation() {
        // Arrange
        let mut history = RequestHistory::new(HISTORY_RETENTION);
        let id = history.record_start("getComments", Priority::Low, Instant::now());

        // Act
        history.discard("getComments", id);

        // Assert
        assert_eq!(history.count_since("getComments", None), 0);
    }
}
