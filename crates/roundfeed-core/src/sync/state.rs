//! Per-thread polling state.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Inspection snapshot of one polling session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[allow(clippy::module_name_repetitions)]
pub struct PollingState {
    /// Whether the session still polls.
    pub active: bool,
    /// End of the most recent fetch.
    pub last_poll_time: Option<DateTime<Utc>>,
    /// Watermark: newest item timestamp delivered so far. Never decreases.
    pub last_seen_item_time: Option<DateTime<Utc>>,
    /// Consecutive failed fetches.
    pub error_count: u32,
    /// When the next fetch is due.
    pub next_poll_at: Option<DateTime<Utc>>,
}

impl PollingState {
    pub(crate) fn started() -> Self {
        Self {
            active: true,
            ..Self::default()
        }
    }

    /// Whether an item created at `created_at` is past the watermark.
    pub(crate) fn is_unseen(&self, created_at: DateTime<Utc>) -> bool {
        self.last_seen_item_time.is_none_or(|seen| created_at > seen)
    }

    /// Moves the watermark forward to `created_at`; earlier values are ignored.
    pub(crate) fn advance_watermark(&mut self, created_at: DateTime<Utc>) {
        if self.is_unseen(created_at) {
            self.last_seen_item_time = Some(created_at);
        }
    }
}
