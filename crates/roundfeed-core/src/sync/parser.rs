//! Text classification of polled content items.
//!
//! Best-effort and panic-free: a field that does not parse is left `None`
//! and an item that matches nothing yields no update.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::event::{StandingRow, StatusState, UpdateEvent, UpdatePayload};
use super::source::ContentItem;

#[allow(clippy::expect_used)]
static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\W*status\s*:\s*(?P<state>[a-z]+)\b[\s.:\-]*(?P<message>.*?)\s*$")
        .expect("failed to compile status regex")
});

#[allow(clippy::expect_used)]
static WINNER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)\bwinner\s*:\s*(?P<name>[^(\n]+?)\s*(?:\(\s*(?P<points>-?\d+)\s*(?:points?|pts)\s*\))?\s*$",
    )
    .expect("failed to compile winner regex")
});

#[allow(clippy::expect_used)]
static ROUND_END_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bround\s*#?\s*(?P<round>\d+)\s+(?:has\s+)?(?:ended|is over|closed|finished)\b")
        .expect("failed to compile round end regex")
});

#[allow(clippy::expect_used)]
static ROUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bround\s*#?\s*(?P<round>\d+)\b").expect("failed to compile round regex")
});

#[allow(clippy::expect_used)]
static ROUND_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\W*round\s*#?\s*(?P<round>\d+)\b")
        .expect("failed to compile round start regex")
});

#[allow(clippy::expect_used)]
static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:duration|time limit|you have)\s*:?\s*(?P<n>\d+)\s*(?P<unit>seconds?|secs?|s|minutes?|mins?|m)\b",
    )
    .expect("failed to compile duration regex")
});

#[allow(clippy::expect_used)]
static PROMPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\W*prompt\s*:\s*(?P<prompt>.+?)\s*$").expect("failed to compile prompt regex")
});

#[allow(clippy::expect_used)]
static TIMER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?P<n>\d+)\s*(?P<unit>seconds?|secs?|minutes?|mins?)\s+(?:remaining|left)\b")
        .expect("failed to compile timer regex")
});

#[allow(clippy::expect_used)]
static STANDINGS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:standings|leaderboard|scoreboard)\b")
        .expect("failed to compile standings regex")
});

#[allow(clippy::expect_used)]
static NUMBERED_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<rank>\d+)[.)]\s+(?P<name>.+?)\s*(?:[-:]\s*(?P<score>-?\d+)\s*(?:points?|pts)?)?\s*$",
    )
    .expect("failed to compile numbered row regex")
});

/// Round prompts seen by one polling session, keyed by item id.
#[derive(Debug, Default)]
pub(crate) struct RoundPrompts {
    rounds: HashMap<String, Option<u32>>,
}

impl RoundPrompts {
    /// Remembers `item_id` as the prompt of `round`.
    pub(crate) fn record(&mut self, item_id: &str, round: Option<u32>) {
        self.rounds.insert(item_id.to_owned(), round);
    }

    /// Round of the prompt `item_id`, if it is a known prompt.
    pub(crate) fn round_of(&self, item_id: &str) -> Option<Option<u32>> {
        self.rounds.get(item_id).copied()
    }
}

/// Classifies one item into an update event.
///
/// Replies to a known round prompt are submissions; anything else is matched
/// against the structural text markers. Unmatched items are logged at debug
/// level and skipped.
pub(crate) fn parse_item(item: &ContentItem, prompts: &RoundPrompts) -> Option<UpdateEvent> {
    let reply_to = item
        .parent_id
        .as_deref()
        .and_then(|parent| prompts.round_of(parent).map(|round| (parent, round)));

    let payload = match reply_to {
        Some((prompt_id, round)) => Some(UpdatePayload::Submission {
            author: item.author.clone(),
            text: item.text.trim().to_owned(),
            prompt_id: prompt_id.to_owned(),
            round,
        }),
        None => parse_text(&item.text),
    };

    match payload {
        Some(payload) => Some(UpdateEvent::new(item.created_at, payload, Some(item.id.clone()))),
        None => {
            tracing::debug!(item_id = %item.id, "content item matched no update pattern, skipped");
            None
        }
    }
}

/// Matches free text against the structural update markers.
///
/// Checked in order: status, round end (winner), standings table, round
/// start, remaining time. A `Prompt:` line marks a round start, so a prompt
/// mentioning a winner is not a round end, and a `Round N` line without a
/// prompt that announces remaining time is a timer update.
#[must_use]
pub fn parse_text(text: &str) -> Option<UpdatePayload> {
    parse_status(text)
        .or_else(|| parse_session_end(text))
        .or_else(|| parse_standings(text))
        .or_else(|| parse_session_start(text))
        .or_else(|| parse_timer(text))
}

fn parse_status(text: &str) -> Option<UpdatePayload> {
    let caps = STATUS_RE.captures(text)?;
    let state = match caps.name("state")?.as_str().to_ascii_lowercase().as_str() {
        "open" | "active" | "started" | "running" | "live" => StatusState::Open,
        "paused" | "hold" | "suspended" => StatusState::Paused,
        "closed" | "ended" | "finished" | "over" => StatusState::Closed,
        _ => return None,
    };
    let message = caps
        .name("message")
        .map(|m| m.as_str().trim())
        .filter(|m| !m.is_empty())
        .map(str::to_owned);
    Some(UpdatePayload::Status { state, message })
}

fn parse_session_end(text: &str) -> Option<UpdatePayload> {
    let round = capture_number::<u32>(ROUND_RE.captures(text).as_ref(), "round");

    if let Some(caps) = WINNER_RE.captures(text).filter(|_| !PROMPT_RE.is_match(text)) {
        let winner = caps
            .name("name")
            .map(|m| m.as_str().trim().trim_matches(|c| c == '*' || c == '_'))
            .filter(|name| !name.is_empty())
            .map(str::to_owned);
        return Some(UpdatePayload::SessionEnd {
            round,
            winner,
            points: capture_number(Some(&caps), "points"),
        });
    }

    let caps = ROUND_END_RE.captures(text)?;
    Some(UpdatePayload::SessionEnd {
        round: capture_number(Some(&caps), "round"),
        winner: None,
        points: None,
    })
}

fn parse_standings(text: &str) -> Option<UpdatePayload> {
    if !STANDINGS_RE.is_match(text) {
        return None;
    }
    let rows = text.lines().filter_map(parse_standing_row).collect();
    Some(UpdatePayload::Standings { rows })
}

/// Parses a `| rank | name | score |` or `1. name - score` line.
fn parse_standing_row(line: &str) -> Option<StandingRow> {
    let trimmed = line.trim();
    if trimmed.starts_with('|') {
        let cells: Vec<&str> = trimmed
            .trim_matches('|')
            .split('|')
            .map(str::trim)
            .collect();
        let is_separator = cells
            .iter()
            .all(|c| !c.is_empty() && c.chars().all(|ch| matches!(ch, '-' | ':' | ' ')));
        if is_separator {
            return None;
        }
        let rank = cells.first().and_then(|c| c.trim_start_matches('#').parse().ok());
        let score = cells.get(2).and_then(|c| c.parse().ok());
        let name = cells.get(1).copied().unwrap_or_default();
        // Header rows carry neither a numeric rank nor a numeric score.
        if (rank.is_none() && score.is_none()) || name.is_empty() {
            return None;
        }
        return Some(StandingRow {
            rank,
            name: name.to_owned(),
            score,
        });
    }

    let caps = NUMBERED_ROW_RE.captures(trimmed)?;
    Some(StandingRow {
        rank: capture_number(Some(&caps), "rank"),
        name: caps.name("name")?.as_str().to_owned(),
        score: capture_number(Some(&caps), "score"),
    })
}

fn parse_session_start(text: &str) -> Option<UpdatePayload> {
    let caps = ROUND_START_RE.captures(text)?;
    let prompt = PROMPT_RE
        .captures(text)
        .and_then(|c| c.name("prompt"))
        .map(|m| m.as_str().to_owned());
    if prompt.is_none() && TIMER_RE.is_match(text) {
        return None;
    }
    let duration_secs = DURATION_RE
        .captures(text)
        .and_then(|c| seconds_from(&c));
    Some(UpdatePayload::SessionStart {
        round: capture_number(Some(&caps), "round"),
        duration_secs,
        prompt,
    })
}

fn parse_timer(text: &str) -> Option<UpdatePayload> {
    let caps = TIMER_RE.captures(text)?;
    Some(UpdatePayload::Timer {
        remaining_secs: seconds_from(&caps)?,
    })
}

/// Converts `n` + `unit` captures to seconds.
fn seconds_from(caps: &Captures<'_>) -> Option<u64> {
    let n: u64 = capture_number(Some(caps), "n")?;
    let unit = caps.name("unit")?.as_str().to_ascii_lowercase();
    if unit.starts_with('m') {
        n.checked_mul(60)
    } else {
        Some(n)
    }
}

fn capture_number<T: std::str::FromStr>(caps: Option<&Captures<'_>>, name: &str) -> Option<T> {
    caps?.name(name)?.as_str().parse().ok()
}
