//! Jobs: the public surface of the engine.
//!
//! A job takes a viewer URL through resolution, page download and assembly.
//! Progress and terminal outcomes are published on a broadcast channel;
//! resume state is persisted after every page so an interrupted or paused
//! job can be continued with [`JobManager::resume`]. A pause keeps every
//! stored page; a cancel keeps them only when `retain_partial` is set.
//!
//! # Example
//!
//! ```no_run
//! use manuscript_core::job::{JobManager, SubmitOptions};
//! # async fn example(manager: JobManager) -> Result<(), Box<dyn std::error::Error>> {
//! let id = manager
//!     .submit("https://digi.vatlib.it/view/MSS_Vat.lat.3225", SubmitOptions::default())
//!     .await?;
//! let status = manager.wait(id).await?;
//! println!("{status:?}");
//! # Ok(())
//! # }
//! ```

mod deadline;
mod error;
mod manager;
mod store;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use deadline::{BASE_JOB_DEADLINE, auto_deadline};
pub use error::JobError;
pub use manager::{JobManager, JobSettings};
pub use store::{JobRecord, JobState, JobStore, bitmap_from, bitmap_indices};

use crate::download::FailurePolicy;
use crate::error::ErrorKind;
use crate::manifest::PageRange;

/// Identifier of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller options for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitOptions {
    /// 1-based inclusive pages to fetch, clamped to the manifest.
    pub page_range: Option<PageRange>,
    /// Split output documents before they exceed this many bytes.
    pub output_size_threshold_bytes: Option<u64>,
    /// Lowers the profile's worker count.
    pub max_concurrency_override: Option<usize>,
    /// Page failure handling.
    pub failure_policy: FailurePolicy,
    /// Wall-clock limit for the whole job.
    pub deadline: Option<Duration>,
    /// Ignore the manifest cache.
    pub refresh_manifest: bool,
    /// Keep downloaded pages when the job is cancelled.
    pub retain_partial: bool,
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// Output documents were written.
    Completed {
        /// Output files in page order.
        artifacts: Vec<PathBuf>,
        /// 1-based pages skipped under the best-effort policy.
        missing: Vec<usize>,
    },
    /// The job stopped on an error.
    Failed {
        /// Failure classification.
        kind: ErrorKind,
        /// Message with a suggestion line.
        message: String,
    },
    /// The job was cancelled.
    Cancelled,
    /// The job was paused; stored pages are kept for a resume.
    Paused,
}

/// Published on [`JobManager::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A page finished.
    Progress {
        /// Job.
        job_id: JobId,
        /// Pages finished, including pages restored on resume.
        completed: usize,
        /// Pages selected.
        total: usize,
        /// Seconds remaining, unknown before the first page.
        eta_seconds: Option<u64>,
        /// Label of the page that just finished.
        current_page_label: Option<String>,
    },
    /// The job reached a terminal state.
    Terminal {
        /// Job.
        job_id: JobId,
        /// Outcome.
        status: JobStatus,
    },
}

impl JobEvent {
    /// Job the event belongs to.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Progress { job_id, .. } | Self::Terminal { job_id, .. } => *job_id,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_options_defaults_from_empty_json() {
        let options: SubmitOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, SubmitOptions::default());
        assert_eq!(options.failure_policy, FailurePolicy::AbortOnFirstFailure);
    }

    #[test]
    fn test_terminal_event_json_shape() {
        let event = JobEvent::Terminal {
            job_id: JobId(7),
            status: JobStatus::Cancelled,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "terminal");
        assert_eq!(json["job_id"], 7);
        assert_eq!(json["status"]["status"], "cancelled");
        assert_eq!(event.job_id(), JobId(7));

        let paused = serde_json::to_value(JobStatus::Paused).unwrap();
        assert_eq!(paused["status"], "paused");
    }
}
