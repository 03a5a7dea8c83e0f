//! Error types for the HTTP layer.

use thiserror::Error;

use crate::error::ErrorKind;

/// Errors returned by [`ResilientClient::fetch`](super::ResilientClient::fetch).
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request did not complete within the profile timeout.
    #[error("timeout after {timeout_ms}ms fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
        /// Timeout that was applied.
        timeout_ms: u64,
    },

    /// Non-success, non-redirect HTTP response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// The redirect chain exceeded the hop cap.
    #[error("too many redirects ({hops}) fetching {url}")]
    TooManyRedirects {
        /// The URL originally requested.
        url: String,
        /// Hops followed before giving up.
        hops: usize,
    },

    /// The URL (or a redirect target) could not be parsed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The underlying reqwest client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        /// Builder error.
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    /// Creates a network error, promoting reqwest timeouts to [`FetchError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error, timeout_ms: u64) -> Self {
        let url = url.into();
        if source.is_timeout() {
            return Self::Timeout { url, timeout_ms };
        }
        Self::Network { url, source }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            url: url.into(),
            timeout_ms,
        }
    }

    /// Creates a redirect-cap error.
    pub fn too_many_redirects(url: impl Into<String>, hops: usize) -> Self {
        Self::TooManyRedirects {
            url: url.into(),
            hops,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Job-level classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } | Self::InvalidUrl { .. } | Self::ClientBuild { .. } => {
                ErrorKind::NetworkError
            }
            Self::Timeout { .. } => ErrorKind::TimeoutError,
            Self::HttpStatus { status, .. } => ErrorKind::HttpError(*status),
            Self::TooManyRedirects { .. } => ErrorKind::TooManyRedirects,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            FetchError::http_status("https://a.example/x", 503).kind(),
            ErrorKind::HttpError(503)
        );
        assert_eq!(
            FetchError::timeout("https://a.example/x", 30_000).kind(),
            ErrorKind::TimeoutError
        );
        assert_eq!(
            FetchError::too_many_redirects("https://a.example/x", 11).kind(),
            ErrorKind::TooManyRedirects
        );
        assert_eq!(
            FetchError::invalid_url("::").kind(),
            ErrorKind::NetworkError
        );
    }

    #[test]
    fn test_display_includes_url_and_status() {
        let err = FetchError::http_status("https://a.example/page/3", 404);
        assert_eq!(err.to_string(), "HTTP 404 fetching https://a.example/page/3");
    }
}
