//! Job-level error taxonomy.
//!
//! Each module has its own `thiserror` enum with context fields. When a
//! failure leaves a module and becomes a job outcome it is reduced to an
//! [`ErrorKind`], which is what progress consumers and the resume store see.
//! Every kind carries an actionable hint that is appended to terminal
//! failure messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No adapter recognizes the URL.
    UnsupportedSource,
    /// An adapter matched but the bootstrap document was malformed.
    ManifestParseError,
    /// The source is known but needs a capability we do not implement.
    UnsupportedFeature,
    /// Connection-level failure (DNS, refused, reset, TLS).
    NetworkError,
    /// The origin answered with a non-success status.
    HttpError(u16),
    /// A single request exceeded its timeout.
    TimeoutError,
    /// Redirect chain exceeded the hop cap.
    TooManyRedirects,
    /// One or more tiles were still missing after retries.
    PartialTileFailure,
    /// Tile grid declaration does not reconcile with decoded tiles.
    GridInconsistency,
    /// Page bytes were rejected by the validator on every attempt.
    PageValidationFailure,
    /// The assembler was asked to finalize with pages missing.
    IncompletePageSet,
    /// The job-level wall-clock deadline elapsed.
    JobTimeout,
    /// Local filesystem or database failure.
    Storage,
}

impl ErrorKind {
    /// Stable identifier used in persisted job state and event payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedSource => "unsupported_source",
            Self::ManifestParseError => "manifest_parse_error",
            Self::UnsupportedFeature => "unsupported_feature",
            Self::NetworkError => "network_error",
            Self::HttpError(_) => "http_error",
            Self::TimeoutError => "timeout_error",
            Self::TooManyRedirects => "too_many_redirects",
            Self::PartialTileFailure => "partial_tile_failure",
            Self::GridInconsistency => "grid_inconsistency",
            Self::PageValidationFailure => "page_validation_failure",
            Self::IncompletePageSet => "incomplete_page_set",
            Self::JobTimeout => "job_timeout",
            Self::Storage => "storage",
        }
    }

    /// Returns `true` for failures that may go away on a later attempt.
    ///
    /// Used to tell "temporarily unreachable" apart from "format unsupported"
    /// when manifest resolution fails.
    #[must_use]
    pub fn is_transient(self) -> bool {
        match self {
            Self::NetworkError | Self::TimeoutError | Self::JobTimeout => true,
            Self::HttpError(status) => status == 408 || status == 429 || status >= 500,
            _ => false,
        }
    }

    /// User-facing remediation for this kind of failure.
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub fn hint(self) -> &'static str {
        match self {
            Self::UnsupportedSource => {
                "This viewer is not recognized. Check the URL points at a manuscript viewer or IIIF manifest."
            }
            Self::ManifestParseError => {
                "The library returned an unexpected document format. Retry later or report the URL."
            }
            Self::UnsupportedFeature => {
                "This library requires a full browser. Open it in a browser and download manually."
            }
            Self::NetworkError => {
                "The library is temporarily unreachable. Check network connectivity/VPN access and retry."
            }
            Self::HttpError(401 | 403) => {
                "Access was refused; the collection is likely geo-restricted or blocking automated clients. Try from another network."
            }
            Self::HttpError(404 | 410) => {
                "The page or manifest no longer exists. Verify the viewer URL is still valid."
            }
            Self::HttpError(429) => "The library is rate limiting requests. Reduce concurrency and retry.",
            Self::HttpError(_) => "The library server reported an error. Retry later.",
            Self::TimeoutError => "The library is responding slowly. Reduce concurrency and retry.",
            Self::TooManyRedirects => {
                "The library redirects in a loop. The viewer may be misconfigured; retry later."
            }
            Self::PartialTileFailure => {
                "Some image tiles could not be fetched. Reduce concurrency and retry the job."
            }
            Self::GridInconsistency => {
                "The tile grid is inconsistent or too large for the memory budget. Raise tile_memory_budget_mb or report the URL."
            }
            Self::PageValidationFailure => {
                "The library returned placeholder or non-image content. The pages may be unavailable; retry later."
            }
            Self::IncompletePageSet => {
                "Some pages are missing. Resume the job or use --best-effort to assemble the rest."
            }
            Self::JobTimeout => {
                "The job exceeded its deadline. Resume the job or raise the deadline."
            }
            Self::Storage => "Check free disk space and write permissions for the work directory.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpError(status) => write!(f, "http_error({status})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Appends the kind's hint to a failure message unless one is already present.
#[must_use]
pub fn actionable_message(kind: ErrorKind, message: &str) -> String {
    if message.contains("Suggestion:") {
        return message.to_string();
    }
    format!("{message}\n  Suggestion: {}", kind.hint())
}

/// Parses a persisted kind identifier back into an [`ErrorKind`].
///
/// HTTP kinds are stored as `http_error(<status>)`.
#[must_use]
pub fn parse_error_kind(value: &str) -> Option<ErrorKind> {
    if let Some(status) = value
        .strip_prefix("http_error(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return status.parse().ok().map(ErrorKind::HttpError);
    }
    let kind = match value {
        "unsupported_source" => ErrorKind::UnsupportedSource,
        "manifest_parse_error" => ErrorKind::ManifestParseError,
        "unsupported_feature" => ErrorKind::UnsupportedFeature,
        "network_error" => ErrorKind::NetworkError,
        "timeout_error" => ErrorKind::TimeoutError,
        "too_many_redirects" => ErrorKind::TooManyRedirects,
        "partial_tile_failure" => ErrorKind::PartialTileFailure,
        "grid_inconsistency" => ErrorKind::GridInconsistency,
        "page_validation_failure" => ErrorKind::PageValidationFailure,
        "incomplete_page_set" => ErrorKind::IncompletePageSet,
        "job_timeout" => ErrorKind::JobTimeout,
        "storage" => ErrorKind::Storage,
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_actionable_message_appends_hint() {
        let msg = actionable_message(ErrorKind::HttpError(403), "HTTP 403 fetching page 4");
        assert!(msg.starts_with("HTTP 403 fetching page 4"));
        assert!(msg.contains("Suggestion:"));
        assert!(msg.contains("geo-restricted"));
    }

    #[test]
    fn test_actionable_message_keeps_existing_suggestion() {
        let original = "bad thing\n  Suggestion: do the other thing";
        assert_eq!(
            actionable_message(ErrorKind::NetworkError, original),
            original
        );
    }

    #[test]
    fn test_rate_limit_and_timeout_hints_mention_concurrency() {
        assert!(ErrorKind::HttpError(429).hint().contains("concurrency"));
        assert!(ErrorKind::TimeoutError.hint().contains("concurrency"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ErrorKind::NetworkError.is_transient());
        assert!(ErrorKind::HttpError(503).is_transient());
        assert!(ErrorKind::HttpError(429).is_transient());
        assert!(!ErrorKind::HttpError(404).is_transient());
        assert!(!ErrorKind::UnsupportedSource.is_transient());
        assert!(!ErrorKind::ManifestParseError.is_transient());
    }

    #[test]
    fn test_display_and_parse_agree() {
        let kinds = [
            ErrorKind::UnsupportedSource,
            ErrorKind::HttpError(502),
            ErrorKind::PartialTileFailure,
            ErrorKind::JobTimeout,
        ];
        for kind in kinds {
            assert_eq!(parse_error_kind(&kind.to_string()), Some(kind));
        }
        assert_eq!(parse_error_kind("nonsense"), None);
    }
}
