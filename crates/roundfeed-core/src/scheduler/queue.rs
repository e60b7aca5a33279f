//! Priority queue of requests waiting for admission.

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::priority::Priority;

/// Why a queued request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RejectReason {
    /// The scheduler is shutting down.
    ShuttingDown,
    /// The queue was cleared by a reset.
    Reset,
}

/// Answer delivered to a waiting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Grant {
    /// The call may run now; its history entry is `entry_id`.
    Admitted {
        /// History entry reserved for the call.
        entry_id: u64,
    },
    /// The call will never run.
    Rejected(RejectReason),
}

/// A caller parked until its operation has capacity.
///
/// The queue holds admission tickets rather than the calls themselves: the
/// caller keeps its closure and runs it once the ticket is granted.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    /// Arrival sequence number; retries keep the original value.
    pub id: u64,
    pub operation: String,
    pub priority: Priority,
    pub weight: u32,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    pub responder: oneshot::Sender<Grant>,
}

impl QueuedRequest {
    /// Whether `self` is served before a request with `weight` and `id`.
    const fn precedes(&self, weight: u32, id: u64) -> bool {
        self.weight > weight || (self.weight == weight && self.id < id)
    }
}

/// Requests ordered by descending weight, then ascending arrival.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    items: Vec<QueuedRequest>,
}

impl RequestQueue {
    /// Inserts `request` at its ordered position.
    pub(crate) fn push(&mut self, request: QueuedRequest) {
        let index = self
            .items
            .iter()
            .position(|r| !r.precedes(request.weight, request.id))
            .unwrap_or(self.items.len());
        self.items.insert(index, request);
    }

    /// Removes and returns the request at `index`.
    pub(crate) fn remove(&mut self, index: usize) -> Option<QueuedRequest> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    /// Request at `index`.
    pub(crate) fn get(&self, index: usize) -> Option<&QueuedRequest> {
        self.items.get(index)
    }

    /// Whether a request for `operation` would be served before one with
    /// `weight` and `id`.
    pub(crate) fn has_ahead(&self, operation: &str, weight: u32, id: u64) -> bool {
        self.items
            .iter()
            .any(|r| r.operation == operation && r.precedes(weight, id))
    }

    /// Zero-based position of the first queued request for `operation` at
    /// `priority`.
    pub(crate) fn position_of(&self, operation: &str, priority: Priority) -> Option<usize> {
        self.items
            .iter()
            .position(|r| r.operation == operation && r.priority == priority)
    }

    /// Drops requests whose caller went away.
    pub(crate) fn prune_abandoned(&mut self) -> usize {
        let before = self.items.len();
        self.items.retain(|r| !r.responder.is_closed());
        before.saturating_sub(self.items.len())
    }

    /// Removes every request.
    pub(crate) fn drain(&mut self) -> Vec<QueuedRequest> {
        std::mem::take(&mut self.items)
    }

    pub(crate) const fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
