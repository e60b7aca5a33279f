//! `ContentApiClient` - content API client implementation.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use roundfeed_core::{
    ContentItem, ContentSource, RateLimitSignal, ReferenceTime, ReferenceTimeProvider,
};
use tracing::instrument;
use url::Url;

use super::types::{ApiErrorResponse, ItemsResponse};

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Content API client.
///
/// Does not retry: rate-limit answers surface as `RateLimitSignal` so the
/// scheduler decides when to call again.
#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct ContentApiClient {
    /// HTTP client.
    http_client: Client,
    /// Base URL for API requests. Always ends with `/`.
    base_url: Url,
}

/// Builder for `ContentApiClient`.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct ContentApiClientBuilder {
    base_url: Option<Url>,
    user_agent: Option<String>,
    timeout: Option<Duration>,
}

impl ContentApiClientBuilder {
    /// Creates a new builder.
    const fn new() -> Self {
        Self {
            base_url: None,
            user_agent: None,
            timeout: None,
        }
    }

    /// Sets the API base URL (required).
    #[must_use]
    pub fn base_url(mut self, url: Url) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Sets the User-Agent (required).
    #[must_use]
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Sets the per-request timeout (default: 30s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// - `base_url` is not set.
    /// - `user_agent` is not set.
    /// - `reqwest::Client` build fails.
    pub fn build(self) -> Result<ContentApiClient> {
        let mut base_url = self.base_url.context("base_url is required")?;
        let user_agent = self.user_agent.context("user_agent is required")?;

        // `Url::join` drops the last segment unless the path ends with `/`.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http_client = Client::builder()
            .user_agent(&user_agent)
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .gzip(true)
            .build()
            .context("failed to build HTTP client")?;

        Ok(ContentApiClient {
            http_client,
            base_url,
        })
    }
}

/// Parses a `Retry-After` header given in seconds or as an HTTP date.
fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some(at.signed_duration_since(now).to_std().unwrap_or_default())
}

impl ContentApiClient {
    /// Creates a new builder.
    #[must_use]
    pub const fn builder() -> ContentApiClientBuilder {
        ContentApiClientBuilder::new()
    }

    /// Base URL in use.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sends a GET request and decodes the JSON body.
    ///
    /// HTTP 429 becomes a `RateLimitSignal` carrying the `Retry-After` hint.
    #[instrument(skip_all)]
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self
            .base_url
            .join(path)
            .with_context(|| format!("failed to join URL path: {path}"))?;

        let mut builder = self.http_client.get(url);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        let request = builder
            .build()
            .with_context(|| format!("failed to build request: {path}"))?;

        tracing::debug!(url = %request.url(), "content API request");

        let result = self.http_client.execute(request).await;
        let response = result.with_context(|| format!("request failed: {path}"))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let hint = retry_after(response.headers(), Utc::now());
            tracing::debug!(?hint, "content API rate limited (429)");
            return Err(anyhow::Error::new(RateLimitSignal::too_many_requests(hint))
                .context(format!("content API rate limited: {path}")));
        }

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<failed to read body>"));
            if let Ok(error_response) = serde_json::from_str::<ApiErrorResponse>(&body) {
                bail!(
                    "content API error (HTTP {}): code={}, message={}",
                    status,
                    error_response.code.as_deref().unwrap_or("-"),
                    error_response.message,
                );
            }
            bail!("content API error (HTTP {status}): {body}");
        }

        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read response body: {path}"))?;
        let raw_result: std::result::Result<T, _> = serde_json::from_str(&body);
        let parsed =
            raw_result.with_context(|| format!("failed to decode JSON response: {path}"))?;
        Ok(parsed)
    }
}

impl ContentSource for ContentApiClient {
    #[instrument(skip_all, fields(thread_id = %thread_id))]
    async fn fetch_items_since(
        &self,
        thread_id: &str,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<ContentItem>> {
        let path = format!("threads/{thread_id}/items");
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(since) = watermark {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::Millis, true)));
        }

        let response: ItemsResponse = self.get_json(&path, &query).await?;
        Ok(response.items)
    }
}

impl ReferenceTimeProvider for ContentApiClient {
    #[instrument(skip_all, fields(thread_id = %thread_id))]
    async fn reference_time(&self, thread_id: &str) -> Result<ReferenceTime> {
        let path = format!("threads/{thread_id}/clock");
        self.get_json(&path, &[]).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    use super::*;

    fn client(server: &wiremock::MockServer) -> ContentApiClient {
        ContentApiClient::builder()
            .base_url(format!("{}/api/v1", server.uri()).parse().unwrap())
            .user_agent("test/0.0.0")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_base_url() {
        // Arrange & Act
        let result = ContentApiClient::builder().user_agent("test/0.0.0").build();

        // Assert
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("base_url is required")
        );
    }

    #[test]
    fn test_builder_requires_user_agent() {
        // Arrange & Act
        let result = ContentApiClient::builder()
            .base_url(Url::parse("http://localhost:8080/").unwrap())
            .build();

        // Assert
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("user_agent is required")
        );
    }

    #[test]
    fn test_builder_appends_trailing_slash() {
        // Arrange & Act
        let client = ContentApiClient::builder()
            .base_url(Url::parse("http://localhost:8080/api/v1").unwrap())
            .user_agent("test/0.0.0")
            .build()
            .unwrap();

        // Assert
        assert_eq!(client.base_url().as_str(), "http://localhost:8080/api/v1/");
    }

    #[test]
    fn test_retry_after_header_forms() {
        // Arrange
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 20, 0, 0).unwrap();
        let mut seconds = HeaderMap::new();
        seconds.insert(RETRY_AFTER, HeaderValue::from_static("17"));
        let mut date = HeaderMap::new();
        date.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Fri, 01 May 2026 20:00:30 +0000"),
        );
        let mut garbage = HeaderMap::new();
        garbage.insert(RETRY_AFTER, HeaderValue::from_static("soon"));

        // Act & Assert
        assert_eq!(retry_after(&seconds, now), Some(Duration::from_secs(17)));
        assert_eq!(retry_after(&date, now), Some(Duration::from_secs(30)));
        assert_eq!(retry_after(&garbage, now), None);
        assert_eq!(retry_after(&HeaderMap::new(), now), None);
    }

    #[tokio::test]
    async fn test_fetch_items_since_via_http() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;
        let body = r#"{"items":[{"id":"c7","text":"Status: open","author":"host","created_at":"2026-05-01T20:00:10Z"}]}"#;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/api/v1/threads/t3_abc/items"))
            .and(wiremock::matchers::query_param(
                "since",
                "2026-05-01T20:00:00.000Z",
            ))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(body))
            .mount(&mock_server)
            .await;

        let client = client(&mock_server);
        let watermark = Utc.with_ymd_and_hms(2026, 5, 1, 20, 0, 0).unwrap();

        // Act
        let items = client
            .fetch_items_since("t3_abc", Some(watermark))
            .await
            .unwrap();

        // Assert
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "c7");
        assert_eq!(items[0].text, "Status: open");
    }

    #[tokio::test]
    async fn test_fetch_without_watermark_sends_no_since() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/api/v1/threads/t1/items"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(r#"{"items":[]}"#))
            .mount(&mock_server)
            .await;

        let client = client(&mock_server);

        // Act
        let items = client.fetch_items_since("t1", None).await.unwrap();

        // Assert
        assert!(items.is_empty());
        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.query().is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_surfaces_signal() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .mount(&mock_server)
            .await;

        let client = client(&mock_server);

        // Act
        let err = client.fetch_items_since("t1", None).await.unwrap_err();

        // Assert
        let signal = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<RateLimitSignal>())
            .unwrap();
        assert_eq!(signal.status, 429);
        assert_eq!(signal.retry_after, Some(Duration::from_secs(12)));
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_body_in_message() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(404)
                    .set_body_string(r#"{"code":"not_found","message":"thread not found"}"#),
            )
            .mount(&mock_server)
            .await;

        let client = client(&mock_server);

        // Act
        let err = client.reference_time("missing").await.unwrap_err();

        // Assert
        let message = err.to_string();
        assert!(message.contains("HTTP 404"));
        assert!(message.contains("thread not found"));
    }

    #[tokio::test]
    async fn test_reference_time_via_http() {
        // Arrange
        let mock_server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/api/v1/threads/t1/clock"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(
                r#"{"server_time":"2026-05-01T20:01:00Z","round_start":"2026-05-01T20:00:00Z"}"#,
            ))
            .mount(&mock_server)
            .await;

        let client = client(&mock_server);

        // Act
        let reference = client.reference_time("t1").await.unwrap();

        // Assert
        assert_eq!(
            reference.server_time,
            Utc.with_ymd_and_hms(2026, 5, 1, 20, 1, 0).unwrap()
        );
        assert_eq!(
            reference.round_start,
            Some(Utc.with_ymd_and_hms(2026, 5, 1, 20, 0, 0).unwrap())
        );
    }
}
