//! Progress snapshots and ETA estimation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// A point-in-time view of a job's page progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Pages finished (validated and stored).
    pub completed: usize,
    /// Pages selected for this job.
    pub total: usize,
    /// Seconds remaining, `None` while the rate is unknown.
    pub eta_seconds: Option<u64>,
    /// Label of the most recently finished page.
    pub current_page_label: Option<String>,
}

/// Linear ETA from the observed completion rate.
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    started: Instant,
    total: usize,
}

impl EtaEstimator {
    /// Starts the clock for `total` pages.
    #[must_use]
    pub fn start(total: usize) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    /// ETA after `completed` pages, measured from [`start`](Self::start).
    #[must_use]
    pub fn estimate(&self, completed: usize) -> Option<u64> {
        eta_from(self.started.elapsed(), completed, self.total)
    }
}

/// `elapsed / completed * remaining`, or `None` before the first page.
///
/// Zero completed pages means the rate is undefined; reporting `0` would
/// read as "almost done".
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn eta_from(elapsed: Duration, completed: usize, total: usize) -> Option<u64> {
    if completed == 0 {
        return None;
    }
    let remaining = total.saturating_sub(completed);
    let per_page = elapsed.as_secs_f64() / completed as f64;
    Some((per_page * remaining as f64).round() as u64)
}
