//! Reference-time collaborator.
#![allow(clippy::future_not_send)]

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-side time observation for one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceTime {
    /// Server clock at the time of the response.
    pub server_time: DateTime<Utc>,
    /// Start of the current round, if one is running.
    #[serde(default)]
    pub round_start: Option<DateTime<Utc>>,
}

/// Source of reference time for countdown synchronization.
///
/// Uses `trait_variant::make` to generate a `Send`-bound async trait.
#[allow(clippy::module_name_repetitions)]
#[trait_variant::make(ReferenceTimeProvider: Send)]
pub trait LocalReferenceTimeProvider {
    /// Fetches the server time and round start for `thread_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote fetch fails.
    async fn reference_time(&self, thread_id: &str) -> Result<ReferenceTime>;
}
