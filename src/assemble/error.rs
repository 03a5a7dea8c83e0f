//! Error types for document assembly.

use std::path::PathBuf;

use thiserror::Error;

use crate::error::ErrorKind;

/// Why pages could not be assembled or written.
#[derive(Debug, Error)]
pub enum AssembleError {
    /// Expected pages have no bytes and the policy does not allow gaps.
    #[error("{} pages missing: {}", missing.len(), format_indices(missing))]
    IncompletePageSet {
        /// 1-based page numbers, ascending.
        missing: Vec<usize>,
    },

    /// Two consecutive pages have identical bytes.
    #[error("pages {first} and {second} are byte-identical")]
    DuplicatePage {
        /// 1-based page number of the earlier page.
        first: usize,
        /// 1-based page number of the later page.
        second: usize,
    },

    /// An artifact's page count does not match its range.
    #[error("{label}: {actual} pages for a range of {expected}")]
    CountMismatch {
        /// Artifact label.
        label: String,
        /// Range length minus skipped pages.
        expected: usize,
        /// Pages actually present.
        actual: usize,
    },

    /// A page image could not be decoded or re-encoded.
    #[error("page {page}: cannot embed image: {reason}")]
    Image {
        /// 1-based page number.
        page: usize,
        /// Decoder message.
        reason: String,
    },

    /// The PDF could not be built.
    #[error("failed to build PDF {path}: {reason}")]
    Pdf {
        /// Target file.
        path: PathBuf,
        /// lopdf message.
        reason: String,
    },

    /// Output IO failure.
    #[error("failed to write {path}: {source}")]
    Io {
        /// Target file or directory.
        path: PathBuf,
        /// IO failure.
        #[source]
        source: std::io::Error,
    },
}

impl AssembleError {
    /// Creates an incomplete-set error from zero-based indices.
    #[must_use]
    pub fn incomplete(mut missing_indices: Vec<usize>) -> Self {
        missing_indices.sort_unstable();
        missing_indices.dedup();
        Self::IncompletePageSet {
            missing: missing_indices.into_iter().map(|index| index + 1).collect(),
        }
    }

    /// Job-level classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IncompletePageSet { .. } | Self::CountMismatch { .. } => {
                ErrorKind::IncompletePageSet
            }
            Self::DuplicatePage { .. } | Self::Image { .. } => ErrorKind::PageValidationFailure,
            Self::Pdf { .. } | Self::Io { .. } => ErrorKind::Storage,
        }
    }
}

/// Renders page numbers, eliding the middle of long lists.
fn format_indices(pages: &[usize]) -> String {
    const SHOWN: usize = 20;
    let mut out = pages
        .iter()
        .take(SHOWN)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    if pages.len() > SHOWN {
        out.push_str(&format!(", ... ({} more)", pages.len() - SHOWN));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_reports_one_based_pages() {
        let err = AssembleError::incomplete(vec![4, 1, 4]);
        assert_eq!(err.to_string(), "2 pages missing: 2, 5");
        assert_eq!(err.kind(), ErrorKind::IncompletePageSet);
    }

    #[test]
    fn test_long_missing_list_is_elided() {
        let err = AssembleError::incomplete((0..25).collect());
        assert!(err.to_string().ends_with("20, ... (5 more)"));
    }
}
