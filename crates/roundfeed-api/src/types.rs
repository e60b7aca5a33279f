//! JSON bodies of the content API.

use roundfeed_core::ContentItem;
use serde::Deserialize;

/// Response of `GET threads/{id}/items`.
#[derive(Debug, Clone, Deserialize)]
#[allow(clippy::module_name_repetitions)]
pub struct ItemsResponse {
    /// Items, in any order.
    #[serde(default)]
    pub items: Vec<ContentItem>,
}

/// Error body returned with non-2xx statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    /// Machine-readable error code.
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable message.
    pub message: String,
}
