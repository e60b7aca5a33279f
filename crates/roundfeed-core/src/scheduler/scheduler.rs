//! `RequestScheduler` - admission, queueing, and retry of remote calls.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::instrument;

use super::backoff::BackoffTracker;
use super::classify::{FailureClass, classify};
use super::history::{HISTORY_RETENTION, RequestHistory};
use super::priority::Priority;
use super::queue::{Grant, QueuedRequest, RejectReason, RequestQueue};
use super::status::{RateLimitStatus, SchedulerStats};
use crate::config::RateLimitConfig;
use crate::error::ScheduleError;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Mutable scheduler state, guarded by one mutex.
#[derive(Debug)]
struct SchedulerState {
    history: RequestHistory,
    backoff: BackoffTracker,
    queue: RequestQueue,
    next_request_id: u64,
    shutting_down: bool,
}

impl SchedulerState {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            history: RequestHistory::new(HISTORY_RETENTION),
            backoff: BackoffTracker::new(
                config.base_delay(),
                config.max_delay(),
                config.backoff_multiplier,
            ),
            queue: RequestQueue::default(),
            next_request_id: 0,
            shutting_down: false,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    /// Admission rule: outside backoff, and either under both rolling caps or
    /// an urgent call within the burst allowance.
    fn is_permitted(
        &self,
        config: &RateLimitConfig,
        operation: &str,
        priority: Priority,
        now: Instant,
    ) -> bool {
        if self.backoff.remaining(operation, now).is_some() {
            return false;
        }

        let per_minute = self.history.count_since(operation, now.checked_sub(MINUTE));
        let per_hour = self.history.count_since(operation, now.checked_sub(HOUR));
        if per_minute < config.max_requests_per_minute && per_hour < config.max_requests_per_hour
        {
            return true;
        }

        priority.can_burst()
            && self
                .history
                .count_since(operation, now.checked_sub(config.burst_window()))
                < config.burst_allowance
    }

    /// Rejects every queued caller.
    fn reject_all(&mut self, reason: RejectReason) -> usize {
        let drained = self.queue.drain();
        let count = drained.len();
        for request in drained {
            // A closed receiver means the caller already gave up.
            let _ = request.responder.send(Grant::Rejected(reason));
        }
        count
    }
}

/// State shared between scheduler handles and the drain loop.
#[derive(Debug)]
struct Shared {
    config: RateLimitConfig,
    state: Mutex<SchedulerState>,
    shutdown_tx: watch::Sender<bool>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// One drain tick: grants at most one queued request per operation,
    /// walking the queue in priority order. Requests for an operation stay
    /// behind the first blocked request of that operation.
    fn drain_once(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let pruned = state.queue.prune_abandoned();
        if pruned > 0 {
            tracing::debug!(pruned, "dropped abandoned queued requests");
        }
        if state.queue.is_empty() {
            return 0;
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut granted = 0usize;
        let mut index = 0usize;

        while let Some(head) = state.queue.get(index) {
            if visited.contains(&head.operation) {
                index = index.saturating_add(1);
                continue;
            }
            let operation = head.operation.clone();
            let priority = head.priority;

            if !state.is_permitted(&self.config, &operation, priority, now) {
                visited.insert(operation);
                index = index.saturating_add(1);
                continue;
            }

            let Some(request) = state.queue.remove(index) else {
                break;
            };
            let entry_id = state.history.record_start(&operation, priority, now);
            let waited = now.saturating_duration_since(request.enqueued_at);
            if request.responder.send(Grant::Admitted { entry_id }).is_err() {
                state.history.discard(&operation, entry_id);
                continue;
            }
            tracing::debug!(
                %operation,
                %priority,
                retry_count = request.retry_count,
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                "queued request admitted"
            );
            granted = granted.saturating_add(1);
            visited.insert(operation);
        }

        granted
    }
}

/// Drains the queue on a fixed tick until shutdown or until every scheduler
/// handle is dropped.
async fn drain_loop(shared: Weak<Shared>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.drain_once(Instant::now());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("queue drain loop stopped");
}

/// Priority-aware scheduler for calls to a quota-limited remote service.
///
/// Cheap to clone; clones share one queue, history, and backoff table.
/// Every call is partitioned by an operation name: rate windows, backoff, and
/// history are tracked per operation.
#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct RequestScheduler {
    shared: Arc<Shared>,
}

impl RequestScheduler {
    /// Creates a scheduler and starts its queue-draining loop.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tick = config.queue_tick();
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::new(&config)),
            config,
            shutdown_tx,
            drain_task: Mutex::new(None),
        });

        let handle = tokio::spawn(drain_loop(Arc::downgrade(&shared), tick, shutdown_rx));
        *shared.drain_task.lock() = Some(handle);

        tracing::info!(
            per_minute = shared.config.max_requests_per_minute,
            per_hour = shared.config.max_requests_per_hour,
            burst = shared.config.burst_allowance,
            "request scheduler started"
        );

        Self { shared }
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.shared.config
    }

    /// Runs `call` under the rate limits of `operation`.
    ///
    /// Runs immediately when admitted, otherwise waits in the queue. Rate
    /// limit and transient failures back the operation off and are retried
    /// up to `max_retries` times; callers only see the final outcome. Each
    /// attempt is bounded by `request_timeout_ms`.
    ///
    /// # Errors
    ///
    /// - `ScheduleError::RateLimited` when quota errors outlast the retries.
    /// - `ScheduleError::Rejected` when transient errors outlast the retries.
    /// - `ScheduleError::Failed` on a non-retryable error.
    /// - `ScheduleError::ShuttingDown` / `ScheduleError::Cancelled` when the
    ///   scheduler is shut down or reset while the request waits.
    #[instrument(skip_all, fields(operation = %operation, priority = %priority))]
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        priority: Priority,
        mut call: F,
    ) -> Result<T, ScheduleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let config = &self.shared.config;
        let request_id = self.shared.state.lock().allocate_id();
        let mut attempts: u32 = 0;

        loop {
            let entry_id = self
                .acquire(operation, priority, request_id, attempts)
                .await?;
            attempts = attempts.saturating_add(1);

            let started = Instant::now();
            let outcome = tokio::time::timeout(config.request_timeout(), call()).await;
            let elapsed = started.elapsed();

            let (err, class) = match outcome {
                Ok(Ok(value)) => {
                    let mut state = self.shared.state.lock();
                    state.history.record_finish(operation, entry_id, true, elapsed);
                    if let Some(previous) = state.backoff.state(operation) {
                        tracing::debug!(
                            %operation,
                            failures = previous.retry_count,
                            "backoff cleared after success"
                        );
                    }
                    state.backoff.clear(operation);
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    let class = classify(&err);
                    (err, class)
                }
                Err(_) => (
                    anyhow::anyhow!("{operation} timed out after {:?}", config.request_timeout()),
                    FailureClass::Transient,
                ),
            };

            if !class.is_retryable() {
                self.shared
                    .state
                    .lock()
                    .history
                    .record_finish(operation, entry_id, false, elapsed);
                tracing::debug!(%operation, error = %err, "remote call failed (not retryable)");
                return Err(ScheduleError::Failed {
                    operation: operation.to_owned(),
                    source: err,
                });
            }

            let hint = match class {
                FailureClass::RateLimited { hint } => hint,
                FailureClass::Transient | FailureClass::Fatal => None,
            };
            let delay = {
                let mut state = self.shared.state.lock();
                state
                    .history
                    .record_finish(operation, entry_id, false, elapsed);
                state
                    .backoff
                    .record_failure(operation, Instant::now(), hint)
            };

            if attempts > config.max_retries {
                tracing::warn!(
                    %operation,
                    attempts,
                    error = %err,
                    "retries exhausted, rejecting request"
                );
                return Err(match class {
                    FailureClass::RateLimited { .. } => ScheduleError::RateLimited {
                        operation: operation.to_owned(),
                        attempts,
                        retry_after: delay,
                        source: err,
                    },
                    FailureClass::Transient | FailureClass::Fatal => ScheduleError::Rejected {
                        operation: operation.to_owned(),
                        attempts,
                        source: err,
                    },
                });
            }

            tracing::warn!(
                %operation,
                attempt = attempts,
                max_retries = config.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                rate_limited = matches!(class, FailureClass::RateLimited { .. }),
                error = %err,
                "remote call failed, backing off"
            );
        }
    }

    /// Waits until `operation` may run and returns the reserved history entry.
    async fn acquire(
        &self,
        operation: &str,
        priority: Priority,
        request_id: u64,
        retry_count: u32,
    ) -> Result<u64, ScheduleError> {
        let config = &self.shared.config;
        let receiver = {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return Err(ScheduleError::ShuttingDown {
                    operation: operation.to_owned(),
                });
            }

            let now = Instant::now();
            let weight = config.priority_weights.weight(priority);
            if !state.queue.has_ahead(operation, weight, request_id)
                && state.is_permitted(config, operation, priority, now)
            {
                return Ok(state.history.record_start(operation, priority, now));
            }

            let (responder, receiver) = oneshot::channel();
            state.queue.push(QueuedRequest {
                id: request_id,
                operation: operation.to_owned(),
                priority,
                weight,
                enqueued_at: now,
                retry_count,
                responder,
            });
            tracing::debug!(
                %operation,
                %priority,
                retry_count,
                queue_len = state.queue.len(),
                "request queued"
            );
            receiver
        };

        match receiver.await {
            Ok(Grant::Admitted { entry_id }) => Ok(entry_id),
            Ok(Grant::Rejected(RejectReason::Reset)) => Err(ScheduleError::Cancelled {
                operation: operation.to_owned(),
            }),
            Ok(Grant::Rejected(RejectReason::ShuttingDown)) | Err(_) => {
                Err(ScheduleError::ShuttingDown {
                    operation: operation.to_owned(),
                })
            }
        }
    }

    /// Snapshot of the limits of `operation` as seen by a `priority` caller.
    #[must_use]
    pub fn status(&self, operation: &str, priority: Priority) -> RateLimitStatus {
        let config = &self.shared.config;
        let state = self.shared.state.lock();
        let now = Instant::now();

        let minute_start = now.checked_sub(MINUTE);
        let per_minute = state.history.count_since(operation, minute_start);
        let per_hour = state.history.count_since(operation, now.checked_sub(HOUR));
        let reset_in = state
            .history
            .oldest_since(operation, minute_start)
            .and_then(|oldest| oldest.checked_add(MINUTE))
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now));
        let retry_after = state.backoff.remaining(operation, now);

        RateLimitStatus {
            operation: operation.to_owned(),
            remaining: config.max_requests_per_minute.saturating_sub(per_minute),
            remaining_hourly: config.max_requests_per_hour.saturating_sub(per_hour),
            reset_in,
            is_limited: retry_after.is_some(),
            retry_after,
            queue_position: state.queue.position_of(operation, priority),
        }
    }

    /// Aggregate statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn statistics(&self) -> SchedulerStats {
        let state = self.shared.state.lock();
        let now = Instant::now();
        let summary = state.history.summary(now);

        let success_rate = if summary.completed == 0 {
            1.0
        } else {
            summary.succeeded as f64 / summary.completed as f64
        };
        let average_latency = u32::try_from(summary.completed)
            .ok()
            .filter(|&n| n > 0)
            .map_or(Duration::ZERO, |n| summary.total_duration / n);

        SchedulerStats {
            total_requests: summary.total,
            success_rate,
            average_latency,
            queue_length: state.queue.len(),
            backed_off_operations: state.backoff.active_count(now),
            requests_by_priority: summary.by_priority,
        }
    }

    /// Clears history, backoff state, and the queue. Queued callers receive
    /// `ScheduleError::Cancelled`.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.history.clear();
        state.backoff.reset();
        let cancelled = state.reject_all(RejectReason::Reset);
        tracing::info!(cancelled, "request scheduler reset");
    }

    /// Stops the drain loop and rejects every queued caller with
    /// `ScheduleError::ShuttingDown`. Later calls to `execute` fail the same
    /// way. Idempotent.
    pub async fn shutdown(&self) {
        let rejected = {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.reject_all(RejectReason::ShuttingDown)
        };
        self.shared.shutdown_tx.send_replace(true);

        let handle = self.shared.drain_task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "queue drain loop ended abnormally");
        }
        tracing::info!(rejected, "request scheduler shut down");
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }
}
