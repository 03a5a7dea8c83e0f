//! Error types for manifest resolution.
//!
//! Messages follow the What/Why/Fix pattern: each variant ends with a
//! `Suggestion:` line. Transport failures are kept separate from format
//! failures so users can tell "temporarily unreachable" from "unsupported".

use thiserror::Error;

use crate::error::ErrorKind;
use crate::http::FetchError;
use crate::manifest::ManifestError;

/// Errors that can occur while turning a viewer URL into a manifest.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// No registered adapter recognizes the URL.
    #[error("no adapter recognizes '{url}'\n  Suggestion: {suggestion}")]
    UnsupportedSource {
        /// The submitted URL.
        url: String,
        /// How to fix the issue.
        suggestion: String,
    },

    /// An adapter matched but could not extract pages.
    #[error("could not read manifest from '{url}': {reason}\n  Suggestion: The library may have changed its viewer format; report the URL")]
    ManifestParse {
        /// URL of the document that failed to parse.
        url: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The extracted page list violates a manifest invariant.
    #[error("invalid manifest for '{url}': {source}\n  Suggestion: The library returned inconsistent page data; report the URL")]
    InvalidManifest {
        /// The submitted URL.
        url: String,
        /// The violated invariant.
        #[source]
        source: ManifestError,
    },

    /// The source is known but needs a capability we do not implement.
    #[error("'{url}' requires {feature}, which is not supported\n  Suggestion: Open the manuscript in a web browser and download it manually")]
    UnsupportedFeature {
        /// The submitted URL.
        url: String,
        /// The missing capability.
        feature: String,
    },

    /// The library could not be reached while loading the manifest.
    #[error("library temporarily unreachable while loading '{url}': {source}\n  Suggestion: Check network connectivity and retry later")]
    Fetch {
        /// URL being fetched.
        url: String,
        /// Transport failure.
        #[source]
        source: FetchError,
    },
}

impl AdapterError {
    /// Creates an `UnsupportedSource` error.
    #[must_use]
    pub fn unsupported_source(url: &str) -> Self {
        Self::UnsupportedSource {
            url: url.to_string(),
            suggestion: "Check the URL points at a supported manuscript viewer or a IIIF manifest"
                .to_string(),
        }
    }

    /// Creates a `ManifestParse` error.
    #[must_use]
    pub fn parse(url: &str, reason: impl Into<String>) -> Self {
        Self::ManifestParse {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidManifest` error.
    #[must_use]
    pub fn invalid(url: &str, source: ManifestError) -> Self {
        Self::InvalidManifest {
            url: url.to_string(),
            source,
        }
    }

    /// Creates an `UnsupportedFeature` error.
    #[must_use]
    pub fn unsupported_feature(url: &str, feature: impl Into<String>) -> Self {
        Self::UnsupportedFeature {
            url: url.to_string(),
            feature: feature.into(),
        }
    }

    /// Wraps a transport failure.
    #[must_use]
    pub fn fetch(url: &str, source: FetchError) -> Self {
        Self::Fetch {
            url: url.to_string(),
            source,
        }
    }

    /// Job-level classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedSource { .. } => ErrorKind::UnsupportedSource,
            Self::ManifestParse { .. } | Self::InvalidManifest { .. } => {
                ErrorKind::ManifestParseError
            }
            Self::UnsupportedFeature { .. } => ErrorKind::UnsupportedFeature,
            Self::Fetch { source, .. } => source.kind(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_every_variant_carries_a_suggestion() {
        let errors = [
            AdapterError::unsupported_source("https://x.example"),
            AdapterError::parse("https://x.example", "no canvases"),
            AdapterError::invalid("https://x.example", ManifestError::Empty),
            AdapterError::unsupported_feature("https://x.example", "browser automation"),
            AdapterError::fetch(
                "https://x.example",
                FetchError::http_status("https://x.example", 503),
            ),
        ];
        for error in errors {
            assert!(error.to_string().contains("Suggestion:"), "{error}");
        }
    }

    #[test]
    fn test_fetch_error_reads_as_unreachable_not_unsupported() {
        let error = AdapterError::fetch(
            "https://x.example/manifest",
            FetchError::timeout("https://x.example/manifest", 30_000),
        );
        assert_eq!(error.kind(), ErrorKind::TimeoutError);
        assert!(error.to_string().contains("temporarily unreachable"));
        assert!(!error.to_string().contains("not supported"));
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            AdapterError::unsupported_source("u").kind(),
            ErrorKind::UnsupportedSource
        );
        assert_eq!(
            AdapterError::invalid("u", ManifestError::Empty).kind(),
            ErrorKind::ManifestParseError
        );
        assert_eq!(
            AdapterError::unsupported_feature("u", "x").kind(),
            ErrorKind::UnsupportedFeature
        );
    }
}
