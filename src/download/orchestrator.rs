//! Download orchestrator: one manifest in, a stream of page results out.
//!
//! # Concurrency Model
//!
//! - Each distinct page URL is fetched by its own Tokio task, at most
//!   `profile.effective_concurrency(override)` at a time
//! - Page fetches and the tile fetches of stitched pages draw from one
//!   per-job semaphore of that size, so a job never has more requests in
//!   flight against its origin than the limit
//! - Workers never touch shared state; they report through an `mpsc`
//!   channel and the orchestrator loop is the only writer of the result
//!   buffer and the URL de-duplication map
//! - A URL scheduled twice while in flight is fetched once and both indices
//!   receive the bytes
//! - Cancellation is cooperative: no task is scheduled after the flag is
//!   set, running tasks finish or time out on their own
//! - Pausing stops scheduling the same way but always keeps finished pages
//! - A job deadline aborts running tasks and fails the rest with
//!   `JobTimeout`
//!
//! Results are streamed in completion order. [`PageStream::collect`]
//! returns them ordered by index. Page bytes live only in the work
//! directory; results carry the path, size and digest.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::error::PageError;
use super::progress::{EtaEstimator, Progress};
use super::task::{DownloadTask, TaskState};
use super::validate::{PageFormat, sniff_format, validate_page};
use crate::error::{ErrorKind, actionable_message};
use crate::http::{FailureType, ResilientClient, RetryDecision, RetryPolicy};
use crate::manifest::{FetchStrategy, Manifest, PageDescriptor};
use crate::profile::{ProfileRegistry, SourceProfile};
use crate::stitch::TileStitcher;

/// Buffered results before the orchestrator waits for the consumer.
const RESULT_CHANNEL_CAPACITY: usize = 64;

/// What to do when a page fails permanently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop scheduling and fail the job.
    #[default]
    AbortOnFirstFailure,
    /// Record the gap and keep going.
    BestEffort,
}

const RUNNING: u8 = 0;
const CANCELLED: u8 = 1;
const PAUSED: u8 = 2;

/// Cooperative stop flag shared between a job and its caller.
///
/// A cancel requested after a pause wins; a pause never overrides a cancel.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicU8>);

impl CancelFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(CANCELLED, Ordering::SeqCst);
    }

    /// Requests a pause: stop scheduling and keep finished pages.
    pub fn pause(&self) {
        // Already cancelled or paused: nothing to do.
        let _ = self
            .0
            .compare_exchange(RUNNING, PAUSED, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) == CANCELLED
    }

    /// Returns true once [`pause`](Self::pause) took effect.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst) == PAUSED
    }

    /// Returns true once either stop was requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.0.load(Ordering::SeqCst) != RUNNING
    }
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Zero-based pages to fetch, in scheduling order; `None` means all.
    pub indices: Option<Vec<usize>>,
    /// Caller concurrency; can only lower the profile limit.
    pub concurrency_override: Option<usize>,
    /// Page failure handling.
    pub failure_policy: FailurePolicy,
    /// Keep finished pages when the run is cancelled.
    pub retain_partial: bool,
    /// Directory for finished page files.
    pub work_dir: PathBuf,
    /// Cancellation flag.
    pub cancel: CancelFlag,
    /// Wall-clock deadline for the whole run.
    pub deadline: Option<Instant>,
}

impl RunOptions {
    /// Options with defaults and the given work directory.
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            indices: None,
            concurrency_override: None,
            failure_policy: FailurePolicy::default(),
            retain_partial: false,
            work_dir: work_dir.into(),
            cancel: CancelFlag::new(),
            deadline: None,
        }
    }
}

/// A validated page stored in the work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageData {
    /// Zero-based index in the manifest.
    pub index: usize,
    /// Page label.
    pub label: String,
    /// Image container.
    pub format: PageFormat,
    /// Where the bytes are stored.
    pub path: PathBuf,
    /// Stored size in bytes.
    pub size: u64,
    /// SHA-256 of the stored bytes.
    pub digest: [u8; 32],
}

impl PageData {
    /// Describes `bytes` stored at `path`; the bytes are not kept.
    #[must_use]
    pub fn new(
        index: usize,
        label: impl Into<String>,
        format: PageFormat,
        path: impl Into<PathBuf>,
        bytes: &[u8],
    ) -> Self {
        Self {
            index,
            label: label.into(),
            format,
            path: path.into(),
            size: bytes.len() as u64,
            digest: Sha256::digest(bytes).into(),
        }
    }

    /// Reads the stored bytes back from disk.
    ///
    /// # Errors
    ///
    /// Returns the IO error if the file is gone or unreadable.
    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }
}

/// Outcome of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageResult {
    /// Page validated and stored.
    Completed(PageData),
    /// Page given up on.
    Failed {
        /// Zero-based index.
        index: usize,
        /// Page label.
        label: String,
        /// Failure classification.
        kind: ErrorKind,
        /// Human-readable cause.
        message: String,
    },
}

impl PageResult {
    /// Zero-based index this result belongs to.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::Completed(page) => page.index,
            Self::Failed { index, .. } => *index,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Every page was attempted (best-effort runs may still have gaps).
    Completed,
    /// The run stopped on a failure or the deadline.
    Failed {
        /// Failure classification.
        kind: ErrorKind,
        /// Message including a suggestion line.
        message: String,
    },
    /// The cancel flag was set.
    Cancelled,
    /// A pause stopped the run with pages left; finished pages are kept.
    Paused,
}

/// Statistics from a run.
///
/// Uses atomic counters so workers can record validation retries.
#[derive(Debug, Default)]
pub struct DownloadStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    deduplicated: AtomicUsize,
}

impl DownloadStats {
    /// Creates a new stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pages validated and stored.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Pages given up on.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Validation retries across all pages.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Pages served by another page's in-flight fetch.
    #[must_use]
    pub fn deduplicated(&self) -> usize {
        self.deduplicated.load(Ordering::SeqCst)
    }

    fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// Terminal status.
    pub status: RunStatus,
    /// Validated pages ordered by index.
    pub pages: Vec<PageData>,
    /// Selected indices without a validated page, ascending.
    pub missing: Vec<usize>,
    /// Counters.
    pub stats: Arc<DownloadStats>,
}

struct RunSummary {
    status: RunStatus,
    missing: Vec<usize>,
    stats: Arc<DownloadStats>,
    discard_partial: bool,
}

/// Incrementally consumable results of a run.
#[derive(Debug)]
pub struct PageStream {
    results: mpsc::Receiver<PageResult>,
    progress: watch::Receiver<Progress>,
    handle: JoinHandle<RunSummary>,
}

impl std::fmt::Debug for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSummary")
            .field("status", &self.status)
            .field("missing", &self.missing)
            .finish_non_exhaustive()
    }
}

impl PageStream {
    /// Next page result in completion order; `None` when the run is over.
    pub async fn recv(&mut self) -> Option<PageResult> {
        self.results.recv().await
    }

    /// Watch channel carrying the latest progress snapshot.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Waits for the run to finish and returns pages ordered by index.
    pub async fn collect(mut self) -> RunOutcome {
        let mut pages = Vec::new();
        while let Some(result) = self.results.recv().await {
            if let PageResult::Completed(page) = result {
                pages.push(page);
            }
        }
        let summary = match self.handle.await {
            Ok(summary) => summary,
            Err(e) => RunSummary {
                status: RunStatus::Failed {
                    kind: ErrorKind::Storage,
                    message: format!("download orchestrator stopped unexpectedly: {e}"),
                },
                missing: Vec::new(),
                stats: Arc::new(DownloadStats::new()),
                discard_partial: false,
            },
        };
        pages.sort_by_key(|page| page.index);
        if summary.discard_partial {
            pages.clear();
        }
        RunOutcome {
            status: summary.status,
            pages,
            missing: summary.missing,
            stats: summary.stats,
        }
    }
}

/// Schedules, validates and stores the pages of a manifest.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    client: ResilientClient,
    stitcher: TileStitcher,
    profiles: Arc<ProfileRegistry>,
}

impl Orchestrator {
    /// Creates an orchestrator over shared client and profiles.
    #[must_use]
    pub fn new(
        client: ResilientClient,
        profiles: Arc<ProfileRegistry>,
        stitch_budget_bytes: u64,
    ) -> Self {
        let stitcher = TileStitcher::new(client.clone(), stitch_budget_bytes);
        Self {
            client,
            stitcher,
            profiles,
        }
    }

    /// Starts downloading `manifest`; results arrive on the returned stream.
    #[must_use]
    pub fn run(&self, manifest: Arc<Manifest>, options: RunOptions) -> PageStream {
        let (results_tx, results) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let (progress_tx, progress) = watch::channel(Progress::default());
        let this = self.clone();
        let handle =
            tokio::spawn(async move { this.drive(manifest, options, results_tx, progress_tx).await });
        PageStream {
            results,
            progress,
            handle,
        }
    }

    /// Profile governing the worker pool: the one for the first page's origin.
    fn job_profile(&self, manifest: &Manifest) -> Arc<SourceProfile> {
        let url = manifest
            .pages
            .first()
            .map_or(manifest.source_url.as_str(), PageDescriptor::profile_url);
        self.profiles.select(url)
    }

    #[instrument(skip_all, fields(library = %manifest.library, pages = manifest.total_pages))]
    async fn drive(
        self,
        manifest: Arc<Manifest>,
        options: RunOptions,
        results_tx: mpsc::Sender<PageResult>,
        progress_tx: watch::Sender<Progress>,
    ) -> RunSummary {
        let stats = Arc::new(DownloadStats::new());
        let mut queue: VecDeque<usize> = options
            .indices
            .clone()
            .unwrap_or_else(|| (0..manifest.total_pages).collect())
            .into_iter()
            .filter(|&index| {
                let known = index < manifest.pages.len();
                if !known {
                    warn!(index, "ignoring page index outside the manifest");
                }
                known
            })
            .collect();
        let total = queue.len();

        if let Err(source) = tokio::fs::create_dir_all(&options.work_dir).await {
            let message = format!(
                "failed to create work directory {}: {source}",
                options.work_dir.display()
            );
            return RunSummary {
                status: RunStatus::Failed {
                    kind: ErrorKind::Storage,
                    message: actionable_message(ErrorKind::Storage, &message),
                },
                missing: queue.into_iter().collect(),
                stats,
                discard_partial: false,
            };
        }

        let job_profile = self.job_profile(&manifest);
        let concurrency = job_profile.effective_concurrency(options.concurrency_override);
        let batch_pause = job_profile.rate_limit_delay();
        info!(
            total,
            concurrency,
            profile = %job_profile.name,
            policy = ?options.failure_policy,
            "starting page downloads"
        );

        let eta = EtaEstimator::start(total);
        progress_tx.send_replace(Progress {
            completed: 0,
            total,
            eta_seconds: None,
            current_page_label: None,
        });

        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let (report_tx, mut report_rx) = mpsc::channel::<WorkerReport>(concurrency.max(1));
        let mut workers = JoinSet::new();
        let mut task_identities: HashMap<tokio::task::Id, String> = HashMap::new();
        // URL identity -> indices waiting for that fetch.
        let mut in_flight: HashMap<String, Vec<usize>> = HashMap::new();
        let mut missing: Vec<usize> = Vec::new();
        let mut completed = 0usize;
        let mut abort: Option<(ErrorKind, String)> = None;
        let mut timed_out = false;
        let mut scheduled_in_batch = 0usize;

        loop {
            while abort.is_none()
                && !options.cancel.is_stopping()
                && in_flight.len() < concurrency
            {
                let Some(index) = queue.pop_front() else {
                    break;
                };
                let page = &manifest.pages[index];
                let identity = page.strategy.identity();
                if let Some(waiters) = in_flight.get_mut(&identity) {
                    debug!(index, "page shares an in-flight fetch");
                    stats.increment_deduplicated();
                    waiters.push(index);
                    continue;
                }

                if !batch_pause.is_zero() && scheduled_in_batch >= concurrency {
                    debug!(pause_ms = batch_pause.as_millis(), "pausing between batches");
                    tokio::time::sleep(batch_pause).await;
                    scheduled_in_batch = 0;
                }

                in_flight.insert(identity.clone(), vec![index]);
                let worker = PageWorker {
                    client: self.client.clone(),
                    stitcher: self.stitcher.clone(),
                    profile: self.profiles.select(page.profile_url()),
                    permits: Arc::clone(&permits),
                    stats: Arc::clone(&stats),
                };
                let page = page.clone();
                let report_tx = report_tx.clone();
                let task_identity = identity.clone();
                let abort_handle = workers.spawn(async move {
                    let result = worker.fetch(&page).await;
                    // The orchestrator outlives its workers unless the run was torn down.
                    let _ = report_tx
                        .send(WorkerReport {
                            identity: task_identity,
                            result,
                        })
                        .await;
                });
                task_identities.insert(abort_handle.id(), identity);
                scheduled_in_batch += 1;
            }

            if in_flight.is_empty() {
                break;
            }

            let event = tokio::select! {
                Some(report) = report_rx.recv() => LoopEvent::Report(report),
                Some(joined) = workers.join_next_with_id() => LoopEvent::Joined(joined),
                () = sleep_until_deadline(options.deadline) => LoopEvent::Deadline,
            };

            let (identity, result) = match event {
                LoopEvent::Report(report) => (report.identity, report.result),
                LoopEvent::Joined(Ok((id, ()))) => {
                    task_identities.remove(&id);
                    continue;
                }
                LoopEvent::Joined(Err(join_error)) => {
                    let Some(identity) = task_identities.remove(&join_error.id()) else {
                        continue;
                    };
                    warn!(error = %join_error, "page worker stopped unexpectedly");
                    (identity, Err(WorkerFailure::Panicked(join_error.to_string())))
                }
                LoopEvent::Deadline => {
                    warn!("job deadline elapsed, aborting running page tasks");
                    workers.abort_all();
                    timed_out = true;
                    break;
                }
            };

            let waiters = in_flight.remove(&identity).unwrap_or_default();
            match result {
                Ok(fetched) => {
                    for index in waiters {
                        let page = &manifest.pages[index];
                        match store_page(&options.work_dir, page, &fetched).await {
                            Ok(data) => {
                                completed += 1;
                                stats.increment_completed();
                                progress_tx.send_replace(Progress {
                                    completed,
                                    total,
                                    eta_seconds: eta.estimate(completed),
                                    current_page_label: Some(page.label.clone()),
                                });
                                let _ = results_tx.send(PageResult::Completed(data)).await;
                            }
                            Err(error) => {
                                record_failure(
                                    &mut abort,
                                    &mut missing,
                                    &stats,
                                    &results_tx,
                                    options.failure_policy,
                                    page,
                                    error.kind(),
                                    error.to_string(),
                                )
                                .await;
                            }
                        }
                    }
                }
                Err(failure) => {
                    let (kind, message) = failure.describe();
                    for index in waiters {
                        record_failure(
                            &mut abort,
                            &mut missing,
                            &stats,
                            &results_tx,
                            options.failure_policy,
                            &manifest.pages[index],
                            kind,
                            message.clone(),
                        )
                        .await;
                    }
                }
            }
        }

        let unfinished: Vec<usize> = in_flight.into_values().flatten().chain(queue).collect();
        if timed_out {
            for &index in &unfinished {
                let page = &manifest.pages[index];
                let error = PageError::Deadline { page: index + 1 };
                stats.increment_failed();
                let _ = results_tx
                    .send(PageResult::Failed {
                        index,
                        label: page.label.clone(),
                        kind: error.kind(),
                        message: error.to_string(),
                    })
                    .await;
            }
        }
        let interrupted = !unfinished.is_empty();
        missing.extend(unfinished);
        missing.sort_unstable();
        missing.dedup();

        let status = if timed_out {
            let message = format!("job deadline elapsed with {completed} of {total} pages finished");
            RunStatus::Failed {
                kind: ErrorKind::JobTimeout,
                message: actionable_message(ErrorKind::JobTimeout, &message),
            }
        } else if let Some((kind, message)) = abort {
            RunStatus::Failed { kind, message }
        } else if options.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if options.cancel.is_paused() && interrupted {
            RunStatus::Paused
        } else {
            RunStatus::Completed
        };

        let discard_partial = status == RunStatus::Cancelled && !options.retain_partial;
        if discard_partial {
            remove_stored_pages(&options.work_dir, manifest.total_pages).await;
        }

        info!(
            completed = stats.completed(),
            failed = stats.failed(),
            retried = stats.retried(),
            deduplicated = stats.deduplicated(),
            missing = missing.len(),
            status = ?status,
            "page downloads finished"
        );

        RunSummary {
            status,
            missing,
            stats,
            discard_partial,
        }
    }
}

enum LoopEvent {
    Report(WorkerReport),
    Joined(Result<(tokio::task::Id, ()), tokio::task::JoinError>),
    Deadline,
}

struct WorkerReport {
    identity: String,
    result: Result<FetchedPage, WorkerFailure>,
}

enum WorkerFailure {
    Page(PageError),
    Panicked(String),
}

impl WorkerFailure {
    fn describe(&self) -> (ErrorKind, String) {
        match self {
            Self::Page(error) => (error.kind(), error.to_string()),
            Self::Panicked(reason) => (
                ErrorKind::PageValidationFailure,
                format!("page worker stopped unexpectedly: {reason}"),
            ),
        }
    }
}

struct FetchedPage {
    bytes: Vec<u8>,
    format: PageFormat,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn record_failure(
    abort: &mut Option<(ErrorKind, String)>,
    missing: &mut Vec<usize>,
    stats: &DownloadStats,
    results_tx: &mpsc::Sender<PageResult>,
    policy: FailurePolicy,
    page: &PageDescriptor,
    kind: ErrorKind,
    message: String,
) {
    warn!(index = page.index, label = %page.label, kind = %kind, error = %message, "page failed");
    stats.increment_failed();
    missing.push(page.index);
    if policy == FailurePolicy::AbortOnFirstFailure && abort.is_none() {
        *abort = Some((kind, actionable_message(kind, &message)));
    }
    let _ = results_tx
        .send(PageResult::Failed {
            index: page.index,
            label: page.label.clone(),
            kind,
            message,
        })
        .await;
}

/// File name of a stored page (`page_00001.jpg` for index 0).
#[must_use]
pub fn page_file_name(index: usize, format: PageFormat) -> String {
    format!("page_{:05}.{}", index + 1, format.extension())
}

/// Finds a previously stored page for `index`, whatever its format.
#[must_use]
pub fn find_stored_page(work_dir: &Path, index: usize) -> Option<PathBuf> {
    PageFormat::ALL
        .iter()
        .map(|format| work_dir.join(page_file_name(index, *format)))
        .find(|path| path.is_file())
}

async fn store_page(
    work_dir: &Path,
    page: &PageDescriptor,
    fetched: &FetchedPage,
) -> Result<PageData, PageError> {
    let path = work_dir.join(page_file_name(page.index, fetched.format));
    tokio::fs::write(&path, &fetched.bytes)
        .await
        .map_err(|source| PageError::Storage {
            page: page.index + 1,
            path: path.clone(),
            source,
        })?;
    Ok(PageData::new(
        page.index,
        page.label.clone(),
        fetched.format,
        path,
        &fetched.bytes,
    ))
}

async fn remove_stored_pages(work_dir: &Path, total_pages: usize) {
    for index in 0..total_pages {
        if let Some(path) = find_stored_page(work_dir, index)
            && let Err(error) = tokio::fs::remove_file(&path).await
        {
            debug!(path = %path.display(), %error, "could not remove partial page");
        }
    }
}

/// Everything one page task needs; owned by the task.
struct PageWorker {
    client: ResilientClient,
    stitcher: TileStitcher,
    profile: Arc<SourceProfile>,
    permits: Arc<Semaphore>,
    stats: Arc<DownloadStats>,
}

impl PageWorker {
    #[instrument(skip_all, fields(index = page.index, label = %page.label))]
    async fn fetch(self, page: &PageDescriptor) -> Result<FetchedPage, WorkerFailure> {
        let mut task = DownloadTask::new(page.index);
        let result = match &page.strategy {
            FetchStrategy::DirectImage { url } => self.fetch_direct(&mut task, url).await,
            FetchStrategy::TiledImage { grid } => {
                advance(&mut task, TaskState::Fetching);
                advance(&mut task, TaskState::Stitching);
                self.stitcher
                    .stitch(grid, &self.profile, &self.permits)
                    .await
                    .map(|bytes| FetchedPage {
                        format: sniff_format(&bytes).unwrap_or(PageFormat::Jpeg),
                        bytes,
                    })
                    .map_err(|source| PageError::Stitch {
                        page: page.index + 1,
                        source,
                    })
            }
        };
        match &result {
            Ok(_) => advance(&mut task, TaskState::Done),
            Err(error) => {
                if let Err(e) = task.fail(error.kind()) {
                    warn!(error = %e, "task state out of sync");
                }
            }
        }
        result.map_err(WorkerFailure::Page)
    }

    /// Fetch + validate, re-fetching while the validator rejects the body.
    async fn fetch_direct(
        &self,
        task: &mut DownloadTask,
        url: &str,
    ) -> Result<FetchedPage, PageError> {
        let policy = RetryPolicy::for_profile(&self.profile);
        let page = task.index() + 1;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            advance(task, TaskState::Fetching);
            let fetched = {
                // The job semaphore is never closed.
                let _permit = self.permits.acquire().await.ok();
                self.client.fetch(url, &self.profile).await
            };
            let body = fetched.map_err(|source| PageError::Fetch { page, source })?;
            advance(task, TaskState::Validating);

            match validate_page(&body.bytes, body.content_type.as_deref(), &self.profile) {
                Ok(format) => {
                    return Ok(FetchedPage {
                        bytes: body.bytes,
                        format,
                    });
                }
                Err(rejection) => match policy.should_retry(FailureType::Transient, attempt) {
                    RetryDecision::Retry { delay, .. } => {
                        info!(
                            url,
                            attempt,
                            delay_ms = delay.as_millis(),
                            reason = %rejection,
                            "page rejected by validator, refetching"
                        );
                        self.stats.increment_retried();
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::DoNotRetry { .. } => {
                        return Err(PageError::Validation {
                            page,
                            attempts: attempt,
                            source: rejection,
                        });
                    }
                },
            }
        }
    }
}

fn advance(task: &mut DownloadTask, to: TaskState) {
    if let Err(error) = task.transition(to) {
        warn!(%error, "task state out of sync");
    }
}
