//! Core library for roundfeed.
//!
//! Schedules calls against a quota-limited remote content API and turns
//! periodic polling of that API into an ordered, resumable update feed.

/// Wall-clock abstraction.
pub mod clock;

/// Configuration structs.
pub mod config;

/// Scheduler error taxonomy.
pub mod error;

/// Priority-aware request scheduling with rate limiting and backoff.
pub mod scheduler;

/// Polling-based update synchronization.
pub mod sync;

/// Client countdown synchronization.
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PollConfig, PriorityWeights, RateLimitConfig, SyncConfig, TimerConfig};
pub use error::{RateLimitSignal, ScheduleError};
pub use scheduler::{Priority, RateLimitStatus, RequestScheduler, SchedulerStats};
pub use sync::{
    ContentItem, ContentSource, EventRegistry, LocalContentSource, PollSynchronizer,
    PollingState, StandingRow, StatusState, Subscription, UpdateEvent, UpdateKind, UpdatePayload,
};
pub use timer::{
    ClientTimerSync, LocalReferenceTimeProvider, ReferenceTime, ReferenceTimeProvider,
    TimerEvent, TimerSyncResult,
};
