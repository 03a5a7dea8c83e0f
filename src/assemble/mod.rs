//! Document assembly.
//!
//! Orders validated pages, checks integrity and splits them into output
//! artifacts at page boundaries. Only page metadata is handled here; the
//! bytes stay in the work directory until [`write_pdf`] embeds them.

mod error;
mod filename;
mod pdf;

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

pub use error::AssembleError;
pub use filename::{artifact_file_name, resolve_unique_path, sanitize_display_name};
pub use pdf::{write_artifacts, write_pdf};

use crate::download::{FailurePolicy, PageData};

/// Assembly options.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssembleOptions {
    /// Start a new artifact before the accumulated size would exceed this.
    /// `None` keeps everything in one artifact.
    pub split_threshold_bytes: Option<u64>,
    /// Whether gaps are an error or skipped.
    pub failure_policy: FailurePolicy,
}

/// A contiguous page range destined for one output file.
#[derive(Debug, Clone)]
pub struct DocumentArtifact {
    /// `pages {first}-{last}`.
    pub label: String,
    /// 1-based first page of the range.
    pub first_page: usize,
    /// 1-based last page of the range.
    pub last_page: usize,
    /// Pages in index order.
    pub pages: Vec<PageData>,
    /// 1-based pages inside the range that were skipped as missing.
    pub skipped: Vec<usize>,
    /// Sum of page sizes.
    pub total_bytes: u64,
}

#[derive(Default)]
struct ArtifactBuilder {
    pages: Vec<PageData>,
    skipped: Vec<usize>,
    total_bytes: u64,
}

impl ArtifactBuilder {
    fn is_started(&self) -> bool {
        !self.pages.is_empty()
    }

    fn finish(self, expected: &BTreeSet<usize>) -> Result<DocumentArtifact, AssembleError> {
        let first = self
            .pages
            .first()
            .map(|p| p.index + 1)
            .into_iter()
            .chain(self.skipped.first().copied())
            .min()
            .unwrap_or(1);
        let last = self
            .pages
            .last()
            .map(|p| p.index + 1)
            .into_iter()
            .chain(self.skipped.last().copied())
            .max()
            .unwrap_or(first);
        let label = format!("pages {first}-{last}");

        let expected_in_range = expected.range(first - 1..last).count() - self.skipped.len();
        if self.pages.len() != expected_in_range {
            return Err(AssembleError::CountMismatch {
                label,
                expected: expected_in_range,
                actual: self.pages.len(),
            });
        }
        Ok(DocumentArtifact {
            label,
            first_page: first,
            last_page: last,
            pages: self.pages,
            skipped: self.skipped,
            total_bytes: self.total_bytes,
        })
    }
}

/// Orders `pages`, checks them against `expected` and splits them into
/// artifacts.
///
/// `expected` holds the zero-based indices the job selected. A page larger
/// than the threshold forms its own artifact; pages are never split.
///
/// # Errors
///
/// - [`AssembleError::IncompletePageSet`] when expected pages are missing
///   and the policy aborts on failure, or when nothing is left to assemble
/// - [`AssembleError::DuplicatePage`] when two consecutive pages are
///   byte-identical
/// - [`AssembleError::CountMismatch`] if an artifact's pages disagree with
///   its range
pub fn assemble(
    mut pages: Vec<PageData>,
    expected: &[usize],
    options: &AssembleOptions,
) -> Result<Vec<DocumentArtifact>, AssembleError> {
    let expected: BTreeSet<usize> = expected.iter().copied().collect();
    pages.sort_by_key(|page| page.index);
    pages.dedup_by_key(|page| page.index);
    pages.retain(|page| {
        let wanted = expected.contains(&page.index);
        if !wanted {
            debug!(index = page.index, "dropping page outside the selection");
        }
        wanted
    });

    let mut by_index: HashMap<usize, PageData> =
        pages.into_iter().map(|page| (page.index, page)).collect();
    let missing: Vec<usize> = expected
        .iter()
        .copied()
        .filter(|index| !by_index.contains_key(index))
        .collect();
    if by_index.is_empty()
        || (!missing.is_empty() && options.failure_policy == FailurePolicy::AbortOnFirstFailure)
    {
        let missing = if missing.is_empty() {
            expected.iter().copied().collect()
        } else {
            missing
        };
        return Err(AssembleError::incomplete(missing));
    }
    if !missing.is_empty() {
        warn!(
            missing = missing.len(),
            "assembling with gaps under the best-effort policy"
        );
    }

    let mut artifacts = Vec::new();
    let mut current = ArtifactBuilder::default();
    let mut pending_skips: Vec<usize> = Vec::new();
    let mut previous: Option<(usize, [u8; 32])> = None;

    for index in expected.iter().copied() {
        let Some(page) = by_index.remove(&index) else {
            pending_skips.push(index + 1);
            continue;
        };

        let digest = page.digest;
        if let Some((previous_index, previous_digest)) = previous
            && previous_digest == digest
        {
            return Err(AssembleError::DuplicatePage {
                first: previous_index + 1,
                second: index + 1,
            });
        }
        previous = Some((index, digest));

        let size = page.size;
        if let Some(threshold) = options.split_threshold_bytes
            && current.is_started()
            && current.total_bytes + size > threshold
        {
            artifacts.push(std::mem::take(&mut current).finish(&expected)?);
        }
        current.skipped.append(&mut pending_skips);
        current.total_bytes += size;
        current.pages.push(page);
    }
    current.skipped.append(&mut pending_skips);
    artifacts.push(current.finish(&expected)?);

    info!(
        artifacts = artifacts.len(),
        pages = artifacts.iter().map(|a| a.pages.len()).sum::<usize>(),
        "assembled pages"
    );
    Ok(artifacts)
}
