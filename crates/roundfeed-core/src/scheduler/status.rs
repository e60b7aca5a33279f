//! Read-only scheduler snapshots.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use super::priority::Priority;

/// Rate-limit view of one operation at one priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[allow(clippy::module_name_repetitions)]
pub struct RateLimitStatus {
    /// Operation name.
    pub operation: String,
    /// Calls left in the current rolling minute.
    pub remaining: usize,
    /// Calls left in the current rolling hour.
    pub remaining_hourly: usize,
    /// Time until the oldest call in the minute window ages out.
    pub reset_in: Duration,
    /// Whether the operation is inside a backoff window.
    pub is_limited: bool,
    /// Time left in the backoff window.
    pub retry_after: Option<Duration>,
    /// Position of the first queued request for this operation and priority.
    pub queue_position: Option<usize>,
}

/// Aggregate scheduler statistics over the retained history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[allow(clippy::module_name_repetitions)]
pub struct SchedulerStats {
    /// Calls admitted, including in-flight ones.
    pub total_requests: usize,
    /// Successful share of completed calls, `0.0..=1.0`. `1.0` when nothing completed.
    pub success_rate: f64,
    /// Mean duration of completed calls.
    pub average_latency: Duration,
    /// Requests waiting for admission.
    pub queue_length: usize,
    /// Operations currently inside a backoff window.
    pub backed_off_operations: usize,
    /// Admitted calls per priority.
    pub requests_by_priority: BTreeMap<Priority, usize>,
}
