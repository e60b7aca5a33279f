//! `ClientTimerSync` - local countdown corrected by a server time offset.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

use super::provider::ReferenceTimeProvider;
use crate::clock::{Clock, SystemClock};
use crate::config::TimerConfig;
use crate::error::ScheduleError;
use crate::scheduler::{Priority, RequestScheduler};

const EVENT_CAPACITY: usize = 64;

/// Countdown notification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerEvent {
    /// Periodic tick while running.
    Tick {
        /// Seconds left.
        remaining_secs: f64,
    },
    /// The countdown reached zero. Sent once per countdown.
    Expired,
}

/// Outcome of one `ClientTimerSync::synchronize` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerSyncResult {
    /// `server_time - local_time` in milliseconds, where local time is the
    /// midpoint of the request round trip.
    pub server_offset_ms: i64,
    /// Round start reported by the server.
    pub round_start: Option<DateTime<Utc>>,
    /// Remaining seconds after applying the new offset, if running.
    pub remaining_secs: Option<f64>,
    /// Round trip of the reference-time fetch.
    pub round_trip: Duration,
}

#[derive(Debug, Default)]
struct TimerState {
    reference_start: Option<DateTime<Utc>>,
    server_offset_ms: i64,
    duration_secs: u64,
    running: bool,
    /// Bumped on every start/stop so a stale ticker cannot expire a newer
    /// countdown.
    generation: u64,
}

impl TimerState {
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    fn remaining_at(&self, now: DateTime<Utc>) -> f64 {
        if !self.running {
            return 0.0;
        }
        let Some(start) = self.reference_start else {
            return 0.0;
        };
        let server_now = TimeDelta::try_milliseconds(self.server_offset_ms)
            .and_then(|offset| now.checked_add_signed(offset))
            .unwrap_or(now);
        let elapsed_ms = server_now.signed_duration_since(start).num_milliseconds();
        let total_ms = i64::try_from(self.duration_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1_000);
        total_ms.saturating_sub(elapsed_ms).max(0) as f64 / 1_000.0
    }
}

#[derive(Debug)]
struct Shared {
    clock: Arc<dyn Clock>,
    state: Mutex<TimerState>,
    events: broadcast::Sender<TimerEvent>,
}

impl Shared {
    fn remaining(&self) -> f64 {
        self.state.lock().remaining_at(self.clock.now())
    }

    /// Stops the countdown of `generation`. Returns `false` if it was already
    /// stopped or replaced.
    fn expire(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || !state.running {
            return false;
        }
        state.running = false;
        true
    }
}

async fn synchronize_shared<P>(
    scheduler: &RequestScheduler,
    provider: &Arc<P>,
    operation: &str,
    shared: &Shared,
    thread_id: &str,
) -> Result<TimerSyncResult, ScheduleError>
where
    P: ReferenceTimeProvider + Send + Sync + 'static,
{
    let clock = Arc::clone(&shared.clock);

    let (sent_at, reference) = scheduler
        .execute(operation, Priority::High, || {
            let sent_at = clock.now();
            let fetch = provider.reference_time(thread_id);
            async move { Ok::<_, anyhow::Error>((sent_at, fetch.await?)) }
        })
        .await?;
    let received_at = clock.now();

    let round_trip = received_at.signed_duration_since(sent_at);
    let midpoint = round_trip
        .checked_div(2)
        .and_then(|half| sent_at.checked_add_signed(half))
        .unwrap_or(received_at);
    let server_offset_ms = reference
        .server_time
        .signed_duration_since(midpoint)
        .num_milliseconds();

    let remaining_secs = {
        let mut state = shared.state.lock();
        state.server_offset_ms = server_offset_ms;
        if let Some(round_start) = reference.round_start {
            state.reference_start = Some(round_start);
        }
        state.running.then(|| state.remaining_at(received_at))
    };

    tracing::debug!(
        server_offset_ms,
        round_trip_ms = round_trip.num_milliseconds(),
        "timer synchronized"
    );

    Ok(TimerSyncResult {
        server_offset_ms,
        round_start: reference.round_start,
        remaining_secs,
        round_trip: round_trip.to_std().unwrap_or_default(),
    })
}

/// Recalibrates the offset every `period` while a countdown runs.
async fn resync_loop<P>(
    scheduler: RequestScheduler,
    provider: Arc<P>,
    operation: String,
    shared: Arc<Shared>,
    thread_id: String,
    period: Duration,
) where
    P: ReferenceTimeProvider + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !shared.state.lock().running {
            continue;
        }
        match synchronize_shared(&scheduler, &provider, &operation, &shared, &thread_id).await {
            Ok(_) => {}
            Err(ScheduleError::ShuttingDown { .. }) => break,
            Err(e) => tracing::warn!(%thread_id, error = %e, "timer recalibration failed"),
        }
    }
}

async fn tick_loop(shared: Arc<Shared>, generation: u64, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let remaining_secs = shared.remaining();
        if remaining_secs <= 0.0 {
            if shared.expire(generation) {
                tracing::info!("countdown expired");
                // No receivers is fine.
                let _ = shared.events.send(TimerEvent::Expired);
            }
            break;
        }
        let _ = shared.events.send(TimerEvent::Tick { remaining_secs });
    }
}

/// Countdown for one client session, corrected for server clock skew.
///
/// The remaining time is always derived from the clock, the server offset,
/// and the round start, never accumulated from ticks.
pub struct ClientTimerSync<P> {
    scheduler: RequestScheduler,
    provider: Arc<P>,
    config: TimerConfig,
    shared: Arc<Shared>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    resync: Mutex<Option<JoinHandle<()>>>,
}

impl<P> std::fmt::Debug for ClientTimerSync<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTimerSync")
            .field("config", &self.config)
            .field("state", &*self.shared.state.lock())
            .finish_non_exhaustive()
    }
}

impl<P> ClientTimerSync<P>
where
    P: ReferenceTimeProvider + Send + Sync + 'static,
{
    /// Creates a stopped timer with a zero offset.
    #[must_use]
    pub fn new(scheduler: RequestScheduler, provider: Arc<P>, config: TimerConfig) -> Self {
        Self::with_clock(scheduler, provider, config, Arc::new(SystemClock))
    }

    /// Creates a stopped timer reading local time from `clock`.
    #[must_use]
    pub fn with_clock(
        scheduler: RequestScheduler,
        provider: Arc<P>,
        config: TimerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            scheduler,
            provider,
            config,
            shared: Arc::new(Shared {
                clock,
                state: Mutex::new(TimerState::default()),
                events,
            }),
            ticker: Mutex::new(None),
            resync: Mutex::new(None),
        }
    }

    /// Fetches the reference time of `thread_id` and stores the new offset.
    ///
    /// Local time is taken as the midpoint between sending the request and
    /// receiving the answer. A reported round start replaces the current
    /// reference start, so a running countdown is corrected in place.
    ///
    /// # Errors
    ///
    /// Returns the scheduler error if the fetch fails.
    #[instrument(skip_all, fields(thread_id = %thread_id))]
    pub async fn synchronize(&self, thread_id: &str) -> Result<TimerSyncResult, ScheduleError> {
        synchronize_shared(
            &self.scheduler,
            &self.provider,
            &self.config.sync_operation,
            &self.shared,
            thread_id,
        )
        .await
    }

    /// Re-runs `synchronize` for `thread_id` every `resync_interval_ms` while
    /// a countdown is running, replacing any previous recalibration task.
    ///
    /// Does nothing when the interval is zero.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn keep_synchronized(&self, thread_id: &str) {
        let mut resync = self.resync.lock();
        if let Some(previous) = resync.take() {
            previous.abort();
        }
        let Some(period) = self.config.resync_interval() else {
            return;
        };

        *resync = Some(tokio::spawn(resync_loop(
            self.scheduler.clone(),
            Arc::clone(&self.provider),
            self.config.sync_operation.clone(),
            Arc::clone(&self.shared),
            thread_id.to_owned(),
            period,
        )));
    }

    /// Starts a countdown of `duration_secs` from `round_start`, replacing
    /// any running one.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(&self, duration_secs: u64, round_start: DateTime<Utc>) {
        let mut ticker = self.ticker.lock();
        if let Some(previous) = ticker.take() {
            previous.abort();
        }

        let generation = {
            let mut state = self.shared.state.lock();
            state.generation = state.generation.wrapping_add(1);
            state.reference_start = Some(round_start);
            state.duration_secs = duration_secs;
            state.running = true;
            state.generation
        };

        tracing::info!(duration_secs, %round_start, "countdown started");
        *ticker = Some(tokio::spawn(tick_loop(
            Arc::clone(&self.shared),
            generation,
            self.config.tick_interval(),
        )));
    }

    /// Halts the countdown. Idempotent.
    pub fn stop(&self) {
        if let Some(previous) = self.ticker.lock().take() {
            previous.abort();
        }
        let mut state = self.shared.state.lock();
        if state.running {
            state.running = false;
            state.generation = state.generation.wrapping_add(1);
            tracing::info!("countdown stopped");
        }
    }

    /// Seconds left: `max(0, duration - ((now + offset) - round_start))`.
    /// Zero when not running.
    #[must_use]
    pub fn remaining(&self) -> f64 {
        self.shared.remaining()
    }

    /// Whether a countdown is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Offset applied to local time, in milliseconds.
    #[must_use]
    pub fn server_offset_ms(&self) -> i64 {
        self.shared.state.lock().server_offset_ms
    }

    /// Receiver of tick and expiry events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.shared.events.subscribe()
    }
}

impl<P> Drop for ClientTimerSync<P> {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.abort();
        }
        if let Some(resync) = self.resync.get_mut().take() {
            resync.abort();
        }
    }
}
