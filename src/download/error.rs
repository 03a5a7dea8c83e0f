//! Error types for page downloads.

use std::path::PathBuf;

use thiserror::Error;

use super::validate::ValidationError;
use crate::error::ErrorKind;
use crate::http::FetchError;
use crate::stitch::StitchError;

/// Why a single page could not be produced.
#[derive(Debug, Error)]
pub enum PageError {
    /// The page request failed after the client's retries.
    #[error("page {page}: {source}")]
    Fetch {
        /// 1-based page number.
        page: usize,
        /// Transport failure.
        #[source]
        source: FetchError,
    },

    /// The page could not be stitched from tiles.
    #[error("page {page}: {source}")]
    Stitch {
        /// 1-based page number.
        page: usize,
        /// Stitch failure.
        #[source]
        source: StitchError,
    },

    /// Every attempt returned a body the validator rejected.
    #[error("page {page}: rejected after {attempts} attempts: {source}")]
    Validation {
        /// 1-based page number.
        page: usize,
        /// Attempts made.
        attempts: u32,
        /// Last rejection reason.
        #[source]
        source: ValidationError,
    },

    /// The page could not be written to the work directory.
    #[error("page {page}: failed to write {path}: {source}")]
    Storage {
        /// 1-based page number.
        page: usize,
        /// Target file.
        path: PathBuf,
        /// IO failure.
        #[source]
        source: std::io::Error,
    },

    /// The job deadline elapsed before the page finished.
    #[error("page {page}: job deadline elapsed before the page finished")]
    Deadline {
        /// 1-based page number.
        page: usize,
    },
}

impl PageError {
    /// Job-level classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch { source, .. } => source.kind(),
            Self::Stitch { source, .. } => source.kind(),
            Self::Validation { .. } => ErrorKind::PageValidationFailure,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Deadline { .. } => ErrorKind::JobTimeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_cause() {
        let fetch = PageError::Fetch {
            page: 4,
            source: FetchError::http_status("https://img.example/4.jpg", 403),
        };
        assert_eq!(fetch.kind(), ErrorKind::HttpError(403));
        assert!(fetch.to_string().starts_with("page 4:"));

        let validation = PageError::Validation {
            page: 2,
            attempts: 3,
            source: ValidationError::Placeholder { len: 27_287 },
        };
        assert_eq!(validation.kind(), ErrorKind::PageValidationFailure);
        assert!(validation.to_string().contains("27287 bytes"));
    }
}
