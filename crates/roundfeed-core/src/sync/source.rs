//! Content fetch collaborator.
#![allow(clippy::future_not_send)]

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One timestamped, free-text item attached to a remote thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Remote identity of the item.
    pub id: String,
    /// Raw text body.
    pub text: String,
    /// Author reference.
    pub author: String,
    /// Item this one replies to, if any.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Creation time on the remote side.
    pub created_at: DateTime<Utc>,
}

/// Source of thread content items.
///
/// Uses `trait_variant::make` to generate a `Send`-bound async trait.
#[allow(clippy::module_name_repetitions)]
#[trait_variant::make(ContentSource: Send)]
pub trait LocalContentSource {
    /// Fetches items of `thread_id` created after `watermark`.
    ///
    /// Implementations may return items in any order and may include items
    /// at or before the watermark; the poller filters them.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote fetch fails.
    async fn fetch_items_since(
        &self,
        thread_id: &str,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<ContentItem>>;
}
