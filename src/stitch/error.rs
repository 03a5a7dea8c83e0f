//! Error types for tile stitching.

use thiserror::Error;

use crate::error::ErrorKind;
use crate::manifest::TileCoord;

/// Errors that prevent a stitched page from being produced.
///
/// No partial image is ever emitted alongside these.
#[derive(Debug, Error)]
pub enum StitchError {
    /// Some tiles were still missing after the client's retries.
    #[error("{} of {total} tiles missing at (col, row) {}\n  Suggestion: Reduce concurrency and retry the job", missing.len(), format_coords(missing))]
    PartialTileFailure {
        /// Missing coordinates, sorted row-major.
        missing: Vec<TileCoord>,
        /// Tiles the level declares.
        total: usize,
    },

    /// The grid declaration does not reconcile with the canvas or the tiles.
    #[error("tile grid is inconsistent: {detail}\n  Suggestion: Raise tile_memory_budget_mb if the image is large, otherwise report the URL")]
    GridInconsistency {
        /// What did not add up.
        detail: String,
    },

    /// The composited canvas could not be encoded.
    #[error("failed to encode stitched page: {reason}")]
    Encode {
        /// Encoder or worker failure.
        reason: String,
    },
}

impl StitchError {
    /// Creates a `GridInconsistency` error.
    #[must_use]
    pub fn grid(detail: impl Into<String>) -> Self {
        Self::GridInconsistency {
            detail: detail.into(),
        }
    }

    /// Creates a `PartialTileFailure`, sorting the coordinates.
    #[must_use]
    pub fn partial(mut missing: Vec<TileCoord>, total: usize) -> Self {
        missing.sort_unstable();
        missing.dedup();
        Self::PartialTileFailure { missing, total }
    }

    /// Job-level classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PartialTileFailure { .. } => ErrorKind::PartialTileFailure,
            Self::GridInconsistency { .. } => ErrorKind::GridInconsistency,
            Self::Encode { .. } => ErrorKind::PageValidationFailure,
        }
    }
}

fn format_coords(coords: &[TileCoord]) -> String {
    coords
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_sorted_and_listed() {
        let err = StitchError::partial(
            vec![TileCoord::new(3, 2), TileCoord::new(0, 1), TileCoord::new(2, 1)],
            12,
        );
        let StitchError::PartialTileFailure { missing, .. } = &err else {
            panic!("wrong variant");
        };
        assert_eq!(
            missing,
            &vec![TileCoord::new(0, 1), TileCoord::new(2, 1), TileCoord::new(3, 2)]
        );
        assert!(err.to_string().starts_with("3 of 12 tiles missing at (col, row) (0, 1), (2, 1), (3, 2)"));
        assert_eq!(err.kind(), ErrorKind::PartialTileFailure);
    }
}
