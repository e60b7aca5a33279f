//! Typed update events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of update categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// A round was opened.
    SessionStart,
    /// A round was closed.
    SessionEnd,
    /// A reply to a round prompt.
    Submission,
    /// A rank/name/score table.
    Standings,
    /// A remaining-time announcement.
    Timer,
    /// A session status change, including the terminal connection loss.
    Status,
}

impl UpdateKind {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::Submission => "submission",
            Self::Standings => "standings",
            Self::Timer => "timer",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State announced by a status item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    /// Accepting submissions.
    Open,
    /// Temporarily halted.
    Paused,
    /// Finished for good.
    Closed,
    /// Polling gave up; no further updates will arrive.
    ConnectionLost,
}

/// One row of a standings table. Columns that failed to parse are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandingRow {
    /// 1-based rank.
    pub rank: Option<u32>,
    /// Participant name.
    pub name: String,
    /// Score column.
    pub score: Option<i64>,
}

/// Parsed payload of an update. Fields the text did not carry are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdatePayload {
    /// Round opened.
    SessionStart {
        /// Round number.
        round: Option<u32>,
        /// Round length in seconds.
        duration_secs: Option<u64>,
        /// Prompt text.
        prompt: Option<String>,
    },
    /// Round closed.
    SessionEnd {
        /// Round number.
        round: Option<u32>,
        /// Winner name.
        winner: Option<String>,
        /// Winner points.
        points: Option<i64>,
    },
    /// Reply to a round prompt.
    Submission {
        /// Author reference.
        author: String,
        /// Reply text.
        text: String,
        /// Prompt item the reply answers.
        prompt_id: String,
        /// Round of the prompt.
        round: Option<u32>,
    },
    /// Standings table.
    Standings {
        /// Parsed rows in table order.
        rows: Vec<StandingRow>,
    },
    /// Remaining time announcement.
    Timer {
        /// Seconds left.
        remaining_secs: u64,
    },
    /// Status change.
    Status {
        /// New state.
        state: StatusState,
        /// Free-text detail.
        message: Option<String>,
    },
}

impl UpdatePayload {
    /// Kind implied by the payload.
    #[must_use]
    pub const fn kind(&self) -> UpdateKind {
        match self {
            Self::SessionStart { .. } => UpdateKind::SessionStart,
            Self::SessionEnd { .. } => UpdateKind::SessionEnd,
            Self::Submission { .. } => UpdateKind::Submission,
            Self::Standings { .. } => UpdateKind::Standings,
            Self::Timer { .. } => UpdateKind::Timer,
            Self::Status { .. } => UpdateKind::Status,
        }
    }
}

/// A parsed, typed change detected in polled content.
///
/// Built only by the polling parser and the poller itself; serializable for
/// forwarding, but never read back from the wire.
///
/// ```compile_fail
/// let _: roundfeed_core::UpdateEvent = serde_json::from_str("{}").unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct UpdateEvent {
    /// Category.
    pub kind: UpdateKind,
    /// Creation time of the source item.
    pub timestamp: DateTime<Utc>,
    /// Parsed content.
    pub payload: UpdatePayload,
    /// Identity of the source item; `None` for poller-generated events.
    pub source_id: Option<String>,
}

impl UpdateEvent {
    pub(crate) const fn new(
        timestamp: DateTime<Utc>,
        payload: UpdatePayload,
        source_id: Option<String>,
    ) -> Self {
        Self {
            kind: payload.kind(),
            timestamp,
            payload,
            source_id,
        }
    }

    /// Terminal event emitted when polling gives up.
    pub(crate) fn connection_lost(timestamp: DateTime<Utc>, message: String) -> Self {
        Self::new(
            timestamp,
            UpdatePayload::Status {
                state: StatusState::ConnectionLost,
                message: Some(message),
            },
            None,
        )
    }

    /// Whether this is the terminal connection-lost event.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        matches!(
            self.payload,
            UpdatePayload::Status {
                state: StatusState::ConnectionLost,
                ..
            }
        )
    }
}
