//! Canonical description of a document's pages.
//!
//! Every adapter, whatever the source format, produces a [`Manifest`]. The
//! order of [`Manifest::pages`] is the presentation order declared by the
//! source and is never re-sorted downstream.

mod grid;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use grid::{TileCoord, TileGrid, TileLevel, TileRect};

/// How the bytes of one page are obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchStrategy {
    /// A single URL returns the whole page image.
    DirectImage {
        /// Image URL.
        url: String,
    },
    /// The page must be stitched from tiles.
    TiledImage {
        /// Tile description.
        grid: TileGrid,
    },
}

impl FetchStrategy {
    /// Key used for duplicate detection and in-flight de-duplication.
    #[must_use]
    pub fn identity(&self) -> String {
        match self {
            Self::DirectImage { url } => url.clone(),
            Self::TiledImage { grid } => grid.identity(),
        }
    }
}

/// One page of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDescriptor {
    /// Zero-based position in presentation order.
    pub index: usize,
    /// How to fetch the page.
    pub strategy: FetchStrategy,
    /// Human-readable label ("f. 12r", "Page 3").
    pub label: String,
}

impl PageDescriptor {
    /// Page served as one image.
    #[must_use]
    pub fn direct(index: usize, url: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            index,
            strategy: FetchStrategy::DirectImage { url: url.into() },
            label: label.into(),
        }
    }

    /// Page reconstructed from tiles.
    #[must_use]
    pub fn tiled(index: usize, grid: TileGrid, label: impl Into<String>) -> Self {
        Self {
            index,
            strategy: FetchStrategy::TiledImage { grid },
            label: label.into(),
        }
    }

    /// URL whose origin governs this page's profile: the image URL, or the
    /// first tile level's template.
    #[must_use]
    pub fn profile_url(&self) -> &str {
        match &self.strategy {
            FetchStrategy::DirectImage { url } => url,
            FetchStrategy::TiledImage { grid } => grid
                .levels
                .first()
                .map_or("", |level| level.tile_url_template.as_str()),
        }
    }
}

/// Structural problems in a manifest.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    /// No pages were extracted.
    #[error("manifest contains no pages")]
    Empty,

    /// Declared page count disagrees with the page list.
    #[error("manifest declares {declared} pages but lists {actual}")]
    CountMismatch {
        /// `total_pages`.
        declared: usize,
        /// `pages.len()`.
        actual: usize,
    },

    /// A page's index does not match its position.
    #[error("page at position {position} carries index {index}")]
    IndexMismatch {
        /// Position in the list.
        position: usize,
        /// Index stored on the page.
        index: usize,
    },

    /// Two pages resolve to the same URL.
    #[error("pages {first} and {second} resolve to the same URL {url}")]
    DuplicatePageUrl {
        /// Index of the first occurrence.
        first: usize,
        /// Index of the duplicate.
        second: usize,
        /// The shared URL (or tile identity).
        url: String,
    },

    /// A requested page range does not intersect the manifest.
    #[error("page range {start}-{end} is outside 1-{total}")]
    RangeOutOfBounds {
        /// First requested page (1-based).
        start: usize,
        /// Last requested page (1-based).
        end: usize,
        /// Pages available.
        total: usize,
    },
}

/// Inclusive, 1-based page range as users write it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    /// First page (1-based).
    pub start: usize,
    /// Last page (1-based, inclusive).
    pub end: usize,
}

impl PageRange {
    /// Creates a range; `start` and `end` are swapped if reversed.
    #[must_use]
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start.min(end).max(1),
            end: start.max(end).max(1),
        }
    }

    /// Parses `"5-20"` or `"7"`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match value.split_once('-') {
            Some((start, end)) => Some(Self::new(
                start.trim().parse().ok()?,
                end.trim().parse().ok()?,
            )),
            None => value.parse().ok().map(|page| Self::new(page, page)),
        }
    }
}

/// The canonical page list for one submitted URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// URL the user submitted.
    pub source_url: String,
    /// Library identifier (adapter-specific).
    pub library: String,
    /// Title shown to the user and used for output file names.
    pub display_name: String,
    /// Always equal to `pages.len()` for a validated manifest.
    pub total_pages: usize,
    /// Pages in presentation order.
    pub pages: Vec<PageDescriptor>,
}

impl Manifest {
    /// Builds and validates a manifest; page indices are assigned by position.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the page list is empty or two pages
    /// share a URL.
    pub fn new(
        source_url: impl Into<String>,
        library: impl Into<String>,
        display_name: impl Into<String>,
        pages: Vec<PageDescriptor>,
    ) -> Result<Self, ManifestError> {
        let pages: Vec<PageDescriptor> = pages
            .into_iter()
            .enumerate()
            .map(|(index, page)| PageDescriptor { index, ..page })
            .collect();
        let manifest = Self {
            source_url: source_url.into(),
            library: library.into(),
            display_name: display_name.into(),
            total_pages: pages.len(),
            pages,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks the count, index and uniqueness invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.pages.is_empty() {
            return Err(ManifestError::Empty);
        }
        if self.total_pages != self.pages.len() {
            return Err(ManifestError::CountMismatch {
                declared: self.total_pages,
                actual: self.pages.len(),
            });
        }
        let mut seen: HashMap<String, usize> = HashMap::with_capacity(self.pages.len());
        for (position, page) in self.pages.iter().enumerate() {
            if page.index != position {
                return Err(ManifestError::IndexMismatch {
                    position,
                    index: page.index,
                });
            }
            let identity = page.strategy.identity();
            if let Some(&first) = seen.get(&identity) {
                return Err(ManifestError::DuplicatePageUrl {
                    first,
                    second: position,
                    url: identity,
                });
            }
            seen.insert(identity, position);
        }
        Ok(())
    }

    /// Zero-based indices selected by an optional 1-based range.
    ///
    /// The range is clamped to the manifest; a range entirely past the end
    /// is an error.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::RangeOutOfBounds`] if nothing is selected.
    pub fn selected_indices(&self, range: Option<PageRange>) -> Result<Vec<usize>, ManifestError> {
        let Some(range) = range else {
            return Ok((0..self.total_pages).collect());
        };
        if range.start > self.total_pages {
            return Err(ManifestError::RangeOutOfBounds {
                start: range.start,
                end: range.end,
                total: self.total_pages,
            });
        }
        let end = range.end.min(self.total_pages);
        Ok((range.start - 1..end).collect())
    }
}
