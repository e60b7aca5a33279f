//! `PollSynchronizer` - turns periodic fetches into an ordered update feed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::event::{UpdateEvent, UpdatePayload};
use super::parser::{RoundPrompts, parse_item};
use super::source::{ContentItem, ContentSource};
use super::state::PollingState;
use crate::clock::{Clock, SystemClock};
use crate::config::PollConfig;
use crate::error::ScheduleError;
use crate::scheduler::{Priority, RequestScheduler};

type UpdateCallback = Arc<dyn Fn(UpdateEvent) + Send + Sync>;

/// Handle of one running session.
#[derive(Debug)]
struct SessionHandle {
    state: Arc<Mutex<PollingState>>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn stop(self) {
        {
            let mut state = self.state.lock();
            state.active = false;
            state.next_poll_at = None;
        }
        self.cancel.send_replace(true);
        self.task.abort();
    }
}

/// Everything a session task owns.
struct SessionTask<S> {
    thread_id: String,
    scheduler: RequestScheduler,
    source: Arc<S>,
    config: PollConfig,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<PollingState>>,
    on_update: UpdateCallback,
    cancel: watch::Receiver<bool>,
    prompts: RoundPrompts,
}

/// Resolves once the session is cancelled or its handle is dropped.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

fn add_duration(at: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
}

impl<S> SessionTask<S>
where
    S: ContentSource + Send + Sync + 'static,
{
    async fn run(mut self) {
        tracing::info!(thread_id = %self.thread_id, "polling session started");

        loop {
            let watermark = self.state.lock().last_seen_item_time;
            let fetch = self
                .scheduler
                .execute(&self.config.fetch_operation, Priority::Medium, || {
                    self.source.fetch_items_since(&self.thread_id, watermark)
                });

            let result = tokio::select! {
                biased;
                () = cancelled(&mut self.cancel) => break,
                result = fetch => result,
            };

            let Some(delay) = self.handle_fetch(result) else {
                break;
            };

            tokio::select! {
                biased;
                () = cancelled(&mut self.cancel) => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(thread_id = %self.thread_id, "polling session stopped");
    }

    /// Applies one fetch outcome and returns the delay before the next cycle,
    /// or `None` when the session must end.
    fn handle_fetch(
        &mut self,
        result: Result<Vec<ContentItem>, ScheduleError>,
    ) -> Option<Duration> {
        let now = self.clock.now();

        match result {
            Ok(items) => {
                let delay = self.config.interval();
                let state_handle = Arc::clone(&self.state);
                let events = {
                    let mut state = state_handle.lock();
                    if !state.active {
                        tracing::debug!(
                            thread_id = %self.thread_id,
                            "session stopped during fetch, batch discarded"
                        );
                        return None;
                    }
                    state.error_count = 0;
                    state.last_poll_time = Some(now);
                    state.next_poll_at = add_duration(now, delay);
                    self.process_batch(&mut state, items)
                };

                for event in events {
                    // A callback may stop this session mid-batch.
                    if !self.state.lock().active {
                        tracing::debug!(
                            thread_id = %self.thread_id,
                            "session stopped during dispatch, rest of batch discarded"
                        );
                        return None;
                    }
                    (self.on_update)(event);
                }
                Some(delay)
            }
            Err(err) => {
                let mut state = self.state.lock();
                if !state.active {
                    return None;
                }
                state.error_count = state.error_count.saturating_add(1);
                state.last_poll_time = Some(now);

                let shutting_down = matches!(err, ScheduleError::ShuttingDown { .. });
                if shutting_down || state.error_count >= self.config.max_retries {
                    state.active = false;
                    state.next_poll_at = None;
                    let error_count = state.error_count;
                    drop(state);

                    tracing::error!(
                        thread_id = %self.thread_id,
                        error_count,
                        error = %err,
                        "polling failed too many times, session stopped"
                    );
                    (self.on_update)(UpdateEvent::connection_lost(
                        now,
                        format!("polling stopped after {error_count} consecutive failures: {err}"),
                    ));
                    return None;
                }

                let delay = self.config.retry_delay(state.error_count);
                state.next_poll_at = add_duration(now, delay);
                tracing::warn!(
                    thread_id = %self.thread_id,
                    error_count = state.error_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "poll failed, backing off"
                );
                Some(delay)
            }
        }
    }

    /// Filters, orders, and parses one batch, advancing the watermark.
    fn process_batch(
        &mut self,
        state: &mut PollingState,
        mut items: Vec<ContentItem>,
    ) -> Vec<UpdateEvent> {
        items.retain(|item| state.is_unseen(item.created_at));
        items.sort_by_key(|item| item.created_at);

        let mut events = Vec::new();
        for item in &items {
            if let Some(event) = parse_item(item, &self.prompts) {
                if let UpdatePayload::SessionStart { round, .. } = &event.payload {
                    self.prompts.record(&item.id, *round);
                }
                events.push(event);
            }
            state.advance_watermark(item.created_at);
        }

        tracing::debug!(
            thread_id = %self.thread_id,
            items = items.len(),
            updates = events.len(),
            "poll batch processed"
        );
        events
    }
}

/// Maintains one polling session per tracked thread.
///
/// Each session fetches through the shared `RequestScheduler`, so every
/// session is subject to the same rate limits.
pub struct PollSynchronizer<S> {
    scheduler: RequestScheduler,
    source: Arc<S>,
    config: PollConfig,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl<S> std::fmt::Debug for PollSynchronizer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSynchronizer")
            .field("config", &self.config)
            .field("sessions", &self.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

impl<S> PollSynchronizer<S>
where
    S: ContentSource + Send + Sync + 'static,
{
    /// Creates a synchronizer with no sessions.
    #[must_use]
    pub fn new(scheduler: RequestScheduler, source: Arc<S>, config: PollConfig) -> Self {
        Self {
            scheduler,
            source,
            config,
            clock: Arc::new(SystemClock),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the wall clock used for state timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Starts polling `thread_id`, delivering updates to `on_update`.
    ///
    /// Returns `false` without side effects when the thread is already being
    /// polled. A session that ended after repeated failures is replaced.
    ///
    /// # Errors
    ///
    /// Returns `ScheduleError::ShuttingDown` if the scheduler was shut down.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start_session<F>(&self, thread_id: &str, on_update: F) -> Result<bool, ScheduleError>
    where
        F: Fn(UpdateEvent) + Send + Sync + 'static,
    {
        if self.scheduler.is_shut_down() {
            return Err(ScheduleError::ShuttingDown {
                operation: self.config.fetch_operation.clone(),
            });
        }

        let mut sessions = self.sessions.lock();
        if sessions
            .get(thread_id)
            .is_some_and(|handle| handle.state.lock().active)
        {
            tracing::debug!(%thread_id, "session already active");
            return Ok(false);
        }
        if let Some(stale) = sessions.remove(thread_id) {
            stale.stop();
        }

        let state = Arc::new(Mutex::new(PollingState::started()));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = SessionTask {
            thread_id: thread_id.to_owned(),
            scheduler: self.scheduler.clone(),
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            state: Arc::clone(&state),
            on_update: Arc::new(on_update),
            cancel: cancel_rx,
            prompts: RoundPrompts::default(),
        };
        let handle = tokio::spawn(task.run());

        sessions.insert(
            thread_id.to_owned(),
            SessionHandle {
                state,
                cancel: cancel_tx,
                task: handle,
            },
        );
        Ok(true)
    }

    /// Stops polling `thread_id` and forgets its state. Returns whether a
    /// session existed.
    pub fn stop_session(&self, thread_id: &str) -> bool {
        let handle = self.sessions.lock().remove(thread_id);
        handle.is_some_and(|handle| {
            handle.stop();
            tracing::info!(%thread_id, "polling session stop requested");
            true
        })
    }

    /// Stops every session and returns how many there were.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<SessionHandle> = self.sessions.lock().drain().map(|(_, h)| h).collect();
        let count = drained.len();
        for handle in drained {
            handle.stop();
        }
        if count > 0 {
            tracing::info!(count, "all polling sessions stopped");
        }
        count
    }

    /// Snapshot of the session for `thread_id`.
    #[must_use]
    pub fn status(&self, thread_id: &str) -> Option<PollingState> {
        self.sessions
            .lock()
            .get(thread_id)
            .map(|handle| handle.state.lock().clone())
    }

    /// Threads currently being polled, sorted.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<String> {
        let mut active: Vec<String> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, handle)| handle.state.lock().active)
            .map(|(id, _)| id.clone())
            .collect();
        active.sort();
        active
    }
}

impl<S> Drop for PollSynchronizer<S> {
    fn drop(&mut self) {
        for (_, handle) in self.sessions.get_mut().drain() {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use std::collections::VecDeque;

    use anyhow::Result;
    use chrono::TimeZone;

    use super::*;
    use crate::config::RateLimitConfig;
    use crate::sync::event::{StatusState, UpdateKind};

    /// Serves scripted batches, then empty batches.
    #[derive(Default)]
    struct ScriptedSource {
        batches: Mutex<VecDeque<Result<Vec<ContentItem>>>>,
        watermarks: Mutex<Vec<Option<DateTime<Utc>>>>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<Result<Vec<ContentItem>>>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches.into()),
                watermarks: Mutex::new(Vec::new()),
            })
        }
    }

    impl ContentSource for ScriptedSource {
        async fn fetch_items_since(
            &self,
            _thread_id: &str,
            watermark: Option<DateTime<Utc>>,
        ) -> Result<Vec<ContentItem>> {
            self.watermarks.lock().push(watermark);
            self.batches.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 20, 0, secs).unwrap()
    }

    fn item(id: &str, text: &str, secs: u32) -> ContentItem {
        ContentItem {
            id: id.to_owned(),
            text: text.to_owned(),
            author: "host".to_owned(),
            parent_id: None,
            created_at: at(secs),
        }
    }

    fn collector() -> (Arc<Mutex<Vec<UpdateEvent>>>, impl Fn(UpdateEvent) + Send + Sync + 'static) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |event| sink.lock().push(event))
    }

    fn synchronizer(source: Arc<ScriptedSource>, config: PollConfig) -> PollSynchronizer<ScriptedSource> {
        let scheduler = RequestScheduler::new(RateLimitConfig {
            max_retries: 0,
            ..RateLimitConfig::default()
        });
        PollSynchronizer::new(scheduler, source, config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_watermark_monotonic_across_out_of_order_batches() {
        // Arrange
        let source = ScriptedSource::new(vec![
            Ok(vec![
                item("c2", "30 seconds left", 20),
                item("c1", "Round 1\nPrompt: go", 10),
            ]),
            Ok(vec![
                item("c0", "Status: paused", 5),
                item("c3", "10 seconds left", 40),
            ]),
        ]);
        let poller = synchronizer(Arc::clone(&source), PollConfig::default());
        let (events, on_update) = collector();

        // Act
        assert!(poller.start_session("t1", on_update).unwrap());
        tokio::time::sleep(Duration::from_secs(12)).await;

        // Assert
        let events = events.lock();
        let ids: Vec<&str> = events
            .iter()
            .map(|e| e.source_id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        let state = poller.status("t1").unwrap();
        assert_eq!(state.last_seen_item_time, Some(at(40)));
        assert!(state.active);
        assert_eq!(state.error_count, 0);
        let watermarks = source.watermarks.lock();
        assert_eq!(watermarks[0], None);
        assert_eq!(watermarks[1], Some(at(20)));
        assert_eq!(watermarks[2], Some(at(40)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_to_prompt_become_submissions() {
        // Arrange
        let mut reply = item("c2", "my answer", 20);
        reply.parent_id = Some("c1".to_owned());
        reply.author = "alice".to_owned();
        let source = ScriptedSource::new(vec![
            Ok(vec![item("c1", "Round 2\nPrompt: describe tokio", 10)]),
            Ok(vec![reply]),
        ]);
        let poller = synchronizer(source, PollConfig::default());
        let (events, on_update) = collector();

        // Act
        poller.start_session("t1", on_update).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        // Assert
        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, UpdateKind::SessionStart);
        assert_eq!(
            events[1].payload,
            UpdatePayload::Submission {
                author: "alice".to_owned(),
                text: "my answer".to_owned(),
                prompt_id: "c1".to_owned(),
                round: Some(2),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_event_after_max_retries() {
        // Arrange
        let config = PollConfig {
            max_retries: 3,
            ..PollConfig::default()
        };
        let source = ScriptedSource::new(vec![
            Ok(vec![item("c1", "Status: open", 1)]),
            Err(anyhow::anyhow!("thread locked")),
            Err(anyhow::anyhow!("thread locked")),
            Err(anyhow::anyhow!("thread locked")),
        ]);
        let poller = synchronizer(Arc::clone(&source), config);
        let (events, on_update) = collector();

        // Act
        poller.start_session("t1", on_update).unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;

        // Assert
        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(events[1].is_connection_lost());
        assert!(matches!(
            events[1].payload,
            UpdatePayload::Status {
                state: StatusState::ConnectionLost,
                ..
            }
        ));
        let state = poller.status("t1").unwrap();
        assert!(!state.active);
        assert_eq!(state.error_count, 3);
        assert!(poller.active_sessions().is_empty());
        assert_eq!(source.watermarks.lock().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_count_resets_after_success() {
        // Arrange
        let source = ScriptedSource::new(vec![
            Err(anyhow::anyhow!("bad gateway response")),
            Ok(vec![item("c1", "Status: open", 1)]),
        ]);
        let poller = synchronizer(source, PollConfig::default());
        let (events, on_update) = collector();

        // Act
        poller.start_session("t1", on_update).unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        let after_failure = poller.status("t1").unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        // Assert
        assert_eq!(after_failure.error_count, 1);
        assert_eq!(poller.status("t1").unwrap().error_count, 0);
        assert_eq!(events.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_is_safe() {
        // Arrange
        let source = ScriptedSource::new(vec![]);
        let poller = synchronizer(Arc::clone(&source), PollConfig::default());

        // Act
        let first = poller.start_session("t1", |_| {}).unwrap();
        let second = poller.start_session("t1", |_| {}).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Assert
        assert!(first);
        assert!(!second);
        assert_eq!(poller.active_sessions(), vec!["t1".to_owned()]);
        assert_eq!(source.watermarks.lock().len(), 1);
        assert!(!poller.stop_session("unknown"));
        assert!(poller.stop_session("t1"));
        assert!(!poller.stop_session("t1"));
        assert!(poller.status("t1").is_none());
        assert_eq!(poller.stop_all(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_batch() {
        // Arrange
        struct SlowSource;
        impl ContentSource for SlowSource {
            async fn fetch_items_since(
                &self,
                _thread_id: &str,
                _watermark: Option<DateTime<Utc>>,
            ) -> Result<Vec<ContentItem>> {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(vec![item("c1", "Status: open", 1)])
            }
        }
        let scheduler = RequestScheduler::new(RateLimitConfig::default());
        let poller = PollSynchronizer::new(scheduler, Arc::new(SlowSource), PollConfig::default());
        let (events, on_update) = collector();
        poller.start_session("t1", on_update).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Act
        poller.stop_all();
        tokio::time::sleep(Duration::from_secs(10)).await;

        // Assert
        assert!(events.lock().is_empty());
        assert!(poller.active_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_from_callback_drops_rest_of_batch() {
        // Arrange
        let source = ScriptedSource::new(vec![Ok(vec![
            item("a", "Status: open", 1),
            item("b", "Status: open", 2),
            item("c", "Status: open", 3),
        ])]);
        let poller = Arc::new(synchronizer(source, PollConfig::default()));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let weak = Arc::downgrade(&poller);

        // Act
        poller
            .start_session("t1", move |event: UpdateEvent| {
                sink.lock().push(event.source_id.unwrap_or_default());
                if let Some(poller) = weak.upgrade() {
                    poller.stop_session("t1");
                }
            })
            .unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;

        // Assert
        assert_eq!(*delivered.lock(), vec!["a".to_owned()]);
        assert!(poller.status("t1").is_none());
        assert!(poller.active_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_scheduler_shutdown_fails() {
        // Arrange
        let scheduler = RequestScheduler::new(RateLimitConfig::default());
        let poller = PollSynchronizer::new(
            scheduler.clone(),
            ScriptedSource::new(vec![]),
            PollConfig::default(),
        );

        // Act
        scheduler.shutdown().await;
        let result = poller.start_session("t1", |_| {});

        // Assert
        assert!(matches!(result, Err(ScheduleError::ShuttingDown { .. })));
    }
}
