//! Classification of remote call failures.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::RateLimitSignal;

/// Text markers of quota exhaustion.
#[allow(clippy::expect_used)]
static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b429\b|rate[ _-]?limit|too many requests|quota exceeded")
        .expect("failed to compile rate limit regex")
});

/// Text markers of network or timeout failures.
#[allow(clippy::expect_used)]
static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)timed? ?out|timeout|connection (reset|refused|aborted|closed)|broken pipe|dns|name resolution|temporarily unavailable|\b50[234]\b",
    )
    .expect("failed to compile transient error regex")
});

/// How the scheduler reacts to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureClass {
    /// Quota exhausted; back off and retry.
    RateLimited {
        /// Server-provided retry hint.
        hint: Option<Duration>,
    },
    /// Network-class failure; retried through the same backoff path.
    Transient,
    /// Anything else; surfaced immediately.
    Fatal,
}

impl FailureClass {
    /// Whether the failure is retried.
    pub(crate) const fn is_retryable(self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

/// Classifies a remote call error.
///
/// A `RateLimitSignal` anywhere in the chain wins; otherwise the rendered
/// chain is matched against known markers.
pub(crate) fn classify(err: &anyhow::Error) -> FailureClass {
    for cause in err.chain() {
        if let Some(signal) = cause.downcast_ref::<RateLimitSignal>() {
            return FailureClass::RateLimited {
                hint: signal.retry_after,
            };
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return FailureClass::Transient;
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>()
            && matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            )
        {
            return FailureClass::Transient;
        }
    }

    let rendered = format!("{err:#}");
    if RATE_LIMIT_RE.is_match(&rendered) {
        FailureClass::RateLimited { hint: None }
    } else if TRANSIENT_RE.is_match(&rendered) {
        FailureClass::Transient
    } else {
        FailureClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use anyhow::{Context, anyhow};

    use super::*;

    #[test]
    fn test_classify_by_message() {
        let cases = [
            ("HTTP 429", FailureClass::RateLimited { hint: None }),
            ("Rate limit exceeded", FailureClass::RateLimited { hint: None }),
            ("RATELIMIT hit", FailureClass::RateLimited { hint: None }),
            ("Too Many Requests", FailureClass::RateLimited { hint: None }),
            ("daily quota exceeded", FailureClass::RateLimited { hint: None }),
            ("operation timed out", FailureClass::Transient),
            ("connection reset by peer", FailureClass::Transient),
            ("dns error: no such host", FailureClass::Transient),
            ("HTTP 503 Service Unavailable", FailureClass::Transient),
            ("thread not found", FailureClass::Fatal),
            ("HTTP 4290 bytes", FailureClass::Fatal),
        ];

        for (message, expected) in cases {
            assert_eq!(classify(&anyhow!(message)), expected, "message: {message}");
        }
    }

    #[test]
    fn test_classify_signal_in_chain() {
        // Arrange
        let err = anyhow::Error::new(RateLimitSignal::too_many_requests(Some(
            Duration::from_secs(12),
        )))
        .context("fetch items for thread t3_abc");

        // Act
        let class = classify(&err);

        // Assert
        assert_eq!(
            class,
            FailureClass::RateLimited {
                hint: Some(Duration::from_secs(12))
            }
        );
    }

    #[test]
    fn test_classify_io_error() {
        // Arrange
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let result: Result<(), std::io::Error> = Err(io);

        // Act
        let err = result.context("connect").unwrap_err();

        // Assert
        assert_eq!(classify(&err), FailureClass::Transient);
        assert!(FailureClass::Transient.is_retryable());
        assert!(!FailureClass::Fatal.is_retryable());
    }
}
