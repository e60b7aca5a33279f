//! Scheduler error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Failure returned by `RequestScheduler::execute`.
///
/// Transient per-attempt failures never show up here; the scheduler retries
/// them internally and only reports the final outcome.
#[derive(Debug, Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ScheduleError {
    /// The remote side kept signalling quota exhaustion until retries ran out.
    #[error("{operation} rate limited after {attempts} attempt(s), retry after {retry_after:?}")]
    RateLimited {
        /// Operation name.
        operation: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// Earliest time a new call for the operation may be admitted.
        retry_after: Duration,
        /// Last error returned by the remote call.
        #[source]
        source: anyhow::Error,
    },

    /// Transient failures exhausted the retry budget.
    #[error("{operation} rejected after {attempts} attempt(s)")]
    Rejected {
        /// Operation name.
        operation: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// Last error returned by the remote call.
        #[source]
        source: anyhow::Error,
    },

    /// The remote call failed in a way that retrying will not fix.
    #[error("{operation} failed")]
    Failed {
        /// Operation name.
        operation: String,
        /// Error returned by the remote call.
        #[source]
        source: anyhow::Error,
    },

    /// The scheduler shut down before the request could run.
    #[error("{operation} rejected: scheduler is shutting down")]
    ShuttingDown {
        /// Operation name.
        operation: String,
    },

    /// The request was dropped from the queue by `RequestScheduler::reset`.
    #[error("{operation} cancelled: scheduler queue was reset")]
    Cancelled {
        /// Operation name.
        operation: String,
    },
}

impl ScheduleError {
    /// Returns `true` if the failure was caused by remote quota exhaustion.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Retry-after hint for rate-limited failures.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Operation the failed request belonged to.
    #[must_use]
    pub fn operation(&self) -> &str {
        match self {
            Self::RateLimited { operation, .. }
            | Self::Rejected { operation, .. }
            | Self::Failed { operation, .. }
            | Self::ShuttingDown { operation }
            | Self::Cancelled { operation } => operation,
        }
    }
}

/// Typed quota-exhaustion signal a remote call can return.
///
/// Adapters wrap this in an `anyhow::Error` so the scheduler recognizes the
/// failure without string matching and can honour a server-sent hint.
#[derive(Debug, Clone, Error)]
#[error("rate limited by remote (HTTP {status})")]
pub struct RateLimitSignal {
    /// HTTP status the remote answered with.
    pub status: u16,
    /// `Retry-After` hint, if the remote sent one.
    pub retry_after: Option<Duration>,
}

impl RateLimitSignal {
    /// HTTP 429 with an optional hint.
    #[must_use]
    pub const fn too_many_requests(retry_after: Option<Duration>) -> Self {
        Self {
            status: 429,
            retry_after,
        }
    }
}
