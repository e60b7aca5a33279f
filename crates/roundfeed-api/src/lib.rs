//! HTTP adapter for roundfeed.
//!
//! Implements the content fetch source and the reference-time provider of
//! `roundfeed-core` against a JSON content API.

/// Content API client.
pub mod client;

/// Wire types.
pub mod types;

pub use client::{ContentApiClient, ContentApiClientBuilder};
