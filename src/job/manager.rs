//! Job lifecycle: resolve, download, assemble, persist.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::store::{JobRecord, JobState, JobStore, bitmap_from};
use super::{JobError, JobEvent, JobId, JobStatus, SubmitOptions, auto_deadline};
use crate::adapter::{AdapterContext, AdapterRegistry};
use crate::assemble::{
    AssembleOptions, artifact_file_name, assemble, resolve_unique_path, write_pdf,
};
use crate::download::{
    CancelFlag, EtaEstimator, Orchestrator, PageData, PageResult, RunOptions, RunOutcome,
    RunStatus, find_stored_page, validate_page,
};
use crate::error::{ErrorKind, actionable_message};
use crate::http::ResilientClient;
use crate::manifest::Manifest;
use crate::profile::ProfileRegistry;
use crate::stitch::DEFAULT_MEMORY_BUDGET_BYTES;

/// Events buffered per subscriber before the oldest are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Engine-wide job settings.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Parent of per-job page directories.
    pub work_root: PathBuf,
    /// Where documents are written.
    pub output_dir: PathBuf,
    /// Largest stitched canvas, in bytes of RGB pixels.
    pub stitch_budget_bytes: u64,
    /// Split threshold when the caller gives none.
    pub default_split_threshold_bytes: Option<u64>,
    /// Derive a deadline from page count when the caller gives none.
    pub auto_deadline: bool,
}

impl JobSettings {
    /// Settings with defaults for everything but the directories.
    #[must_use]
    pub fn new(work_root: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            output_dir: output_dir.into(),
            stitch_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
            default_split_threshold_bytes: None,
            auto_deadline: false,
        }
    }
}

/// Runs jobs and publishes their progress.
///
/// Cheap to clone; clones share the same jobs and event channel.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManager")
            .field("settings", &self.inner.settings)
            .field("adapters", &self.inner.adapters)
            .field("jobs", &self.inner.running.len())
            .finish_non_exhaustive()
    }
}

struct Inner {
    adapters: AdapterRegistry,
    context: AdapterContext,
    orchestrator: Orchestrator,
    store: JobStore,
    settings: JobSettings,
    events: broadcast::Sender<JobEvent>,
    running: DashMap<JobId, RunningJob>,
}

struct RunningJob {
    cancel: CancelFlag,
    done: watch::Receiver<Option<JobStatus>>,
}

/// Why a job stopped early.
enum Halt {
    Status(JobStatus),
    Store(JobError),
}

impl From<JobError> for Halt {
    fn from(error: JobError) -> Self {
        Self::Store(error)
    }
}

fn failed(kind: ErrorKind, message: &str) -> Halt {
    Halt::Status(JobStatus::Failed {
        kind,
        message: actionable_message(kind, message),
    })
}

impl JobManager {
    /// Creates a manager over shared client, profiles, adapters and store.
    #[must_use]
    pub fn new(
        client: ResilientClient,
        profiles: Arc<ProfileRegistry>,
        adapters: AdapterRegistry,
        store: JobStore,
        settings: JobSettings,
    ) -> Self {
        let context = AdapterContext::new(client.clone(), Arc::clone(&profiles));
        let orchestrator = Orchestrator::new(client, profiles, settings.stitch_budget_bytes);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                adapters,
                context,
                orchestrator,
                store,
                settings,
                events,
                running: DashMap::new(),
            }),
        }
    }

    /// Receives events for every job started after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// The job store.
    #[must_use]
    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// Persists a new job and starts it in the background.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] if the job cannot be recorded.
    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn submit(&self, url: &str, options: SubmitOptions) -> Result<JobId, JobError> {
        let (id, work_dir) = self
            .inner
            .store
            .create(url, &options, &self.inner.settings.work_root)
            .await?;
        info!(%id, "job submitted");
        self.spawn(id, url.to_string(), options, work_dir, false);
        Ok(id)
    }

    /// Requests cancellation; returns false if the job is not running here.
    pub fn cancel(&self, id: JobId) -> bool {
        self.signal(id, |flag| flag.cancel(), "cancellation requested")
    }

    /// Requests a pause; returns false if the job is not running here.
    ///
    /// No further pages are scheduled, pages in flight finish, and every
    /// stored page is kept for [`resume`](Self::resume) whatever the job's
    /// `retain_partial` option says.
    pub fn pause(&self, id: JobId) -> bool {
        self.signal(id, |flag| flag.pause(), "pause requested")
    }

    fn signal(&self, id: JobId, raise: impl FnOnce(&CancelFlag), what: &str) -> bool {
        match self.inner.running.get(&id) {
            Some(job) if job.done.borrow().is_none() => {
                raise(&job.cancel);
                info!(%id, "{what}");
                true
            }
            _ => false,
        }
    }

    /// Waits for a job's terminal status.
    ///
    /// Jobs from earlier processes are answered from the store.
    ///
    /// # Errors
    ///
    /// - [`JobError::NotFound`] for an unknown id
    /// - [`JobError::Interrupted`] for a job left unfinished by another process
    pub async fn wait(&self, id: JobId) -> Result<JobStatus, JobError> {
        let done = self.inner.running.get(&id).map(|job| job.done.clone());
        if let Some(mut done) = done
            && let Ok(status) = done.wait_for(Option::is_some).await
            && let Some(status) = status.clone()
        {
            return Ok(status);
        }
        self.persisted_status(id).await
    }

    /// Persisted lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] for an unknown id.
    pub async fn state(&self, id: JobId) -> Result<JobState, JobError> {
        self.inner.store.get(id).await?.state()
    }

    /// Continues a failed, cancelled, paused or interrupted job.
    ///
    /// Stored pages are re-validated before they are trusted; everything
    /// else in the selection is fetched again.
    ///
    /// # Errors
    ///
    /// - [`JobError::AlreadyRunning`] if the job is still running here
    /// - [`JobError::NotResumable`] for a completed job
    #[instrument(skip(self))]
    pub async fn resume(&self, id: JobId) -> Result<JobId, JobError> {
        let active = self
            .inner
            .running
            .get(&id)
            .is_some_and(|job| job.done.borrow().is_none());
        if active {
            return Err(JobError::AlreadyRunning(id));
        }

        let record = self.inner.store.get(id).await?;
        let state = record.state()?;
        if state == JobState::Completed {
            return Err(JobError::NotResumable {
                id,
                state: state.to_string(),
            });
        }
        let options = record.options()?;
        info!(%id, %state, "resuming job");
        self.spawn(
            id,
            record.source_url.clone(),
            options,
            PathBuf::from(&record.work_dir),
            true,
        );
        Ok(id)
    }

    fn spawn(
        &self,
        id: JobId,
        url: String,
        options: SubmitOptions,
        work_dir: PathBuf,
        resume: bool,
    ) {
        let cancel = CancelFlag::new();
        let (done_tx, done) = watch::channel(None);
        self.inner.running.insert(
            id,
            RunningJob {
                cancel: cancel.clone(),
                done,
            },
        );
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner
                .run(id, &url, &options, &work_dir, &cancel, resume, done_tx)
                .await;
        });
    }

    async fn persisted_status(&self, id: JobId) -> Result<JobStatus, JobError> {
        let record = self.inner.store.get(id).await?;
        match record.state()? {
            JobState::Completed => Ok(JobStatus::Completed {
                artifacts: record.artifacts()?,
                missing: missing_pages(&record)?,
            }),
            JobState::Failed => Ok(JobStatus::Failed {
                kind: record.error_kind().unwrap_or(ErrorKind::Storage),
                message: record.error_message.clone().unwrap_or_default(),
            }),
            JobState::Cancelled => Ok(JobStatus::Cancelled),
            JobState::Paused => Ok(JobStatus::Paused),
            state => Err(JobError::Interrupted {
                id,
                state: state.to_string(),
            }),
        }
    }
}

/// 1-based selected pages not marked complete.
fn missing_pages(record: &JobRecord) -> Result<Vec<usize>, JobError> {
    let Some(manifest) = record.manifest()? else {
        return Ok(Vec::new());
    };
    let done: HashSet<usize> = record.completed_indices().into_iter().collect();
    let selected = manifest
        .selected_indices(record.options()?.page_range)
        .unwrap_or_default();
    Ok(selected
        .into_iter()
        .filter(|index| !done.contains(index))
        .map(|index| index + 1)
        .collect())
}

impl Inner {
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        id: JobId,
        url: &str,
        options: &SubmitOptions,
        work_dir: &Path,
        cancel: &CancelFlag,
        resume: bool,
        done_tx: watch::Sender<Option<JobStatus>>,
    ) {
        let status = match self.execute(id, url, options, work_dir, cancel, resume).await {
            Ok(status) | Err(Halt::Status(status)) => status,
            Err(Halt::Store(error)) => JobStatus::Failed {
                kind: ErrorKind::Storage,
                message: actionable_message(ErrorKind::Storage, &error.to_string()),
            },
        };

        if let Err(error) = self.persist_terminal(id, &status).await {
            warn!(%id, %error, "failed to persist job outcome");
        }
        match &status {
            JobStatus::Completed { artifacts, missing } => {
                info!(%id, artifacts = artifacts.len(), missing = missing.len(), "job completed");
            }
            JobStatus::Failed { kind, message } => {
                warn!(%id, %kind, %message, "job failed");
            }
            JobStatus::Cancelled => info!(%id, "job cancelled"),
            JobStatus::Paused => info!(%id, "job paused"),
        }
        // No subscribers is fine.
        let _ = self.events.send(JobEvent::Terminal {
            job_id: id,
            status: status.clone(),
        });
        done_tx.send_replace(Some(status));
    }

    async fn persist_terminal(&self, id: JobId, status: &JobStatus) -> Result<(), JobError> {
        match status {
            JobStatus::Completed { artifacts, .. } => self.store.complete(id, artifacts).await,
            JobStatus::Failed { kind, message } => self.store.fail(id, *kind, message).await,
            JobStatus::Cancelled => self.store.set_state(id, JobState::Cancelled).await,
            JobStatus::Paused => self.store.set_state(id, JobState::Paused).await,
        }
    }

    #[instrument(skip(self, options, work_dir, cancel), fields(job = %id))]
    async fn execute(
        &self,
        id: JobId,
        url: &str,
        options: &SubmitOptions,
        work_dir: &Path,
        cancel: &CancelFlag,
        resume: bool,
    ) -> Result<JobStatus, Halt> {
        let started = Instant::now();
        self.store.set_state(id, JobState::Resolving).await?;
        let manifest = self
            .manifest_for(id, url, options, resume, options.deadline.map(|d| started + d))
            .await?;
        self.store.record_manifest(id, &manifest).await?;

        let selected = manifest
            .selected_indices(options.page_range)
            .map_err(|e| failed(ErrorKind::IncompletePageSet, &e.to_string()))?;
        let deadline = options
            .deadline
            .or_else(|| {
                self.settings.auto_deadline.then(|| {
                    let profile_url = selected
                        .first()
                        .map_or(manifest.source_url.as_str(), |&index| {
                            manifest.pages[index].profile_url()
                        });
                    auto_deadline(selected.len(), &self.context.profile_for(profile_url))
                })
            })
            .map(|d| started + d);

        let mut pages = if resume {
            self.restore_pages(id, &manifest, &selected, work_dir).await?
        } else {
            Vec::new()
        };
        let restored: HashSet<usize> = pages.iter().map(|page| page.index).collect();
        let remaining: Vec<usize> = selected
            .iter()
            .copied()
            .filter(|index| !restored.contains(index))
            .collect();

        let manifest = Arc::new(manifest);
        let mut missing = Vec::new();
        if !remaining.is_empty() {
            self.store.set_state(id, JobState::Downloading).await?;
            let run_options = RunOptions {
                indices: Some(remaining),
                concurrency_override: options.max_concurrency_override,
                failure_policy: options.failure_policy,
                retain_partial: options.retain_partial,
                work_dir: work_dir.to_path_buf(),
                cancel: cancel.clone(),
                deadline,
            };
            let outcome = self
                .download(id, &manifest, run_options, selected.len(), pages.len())
                .await;
            match outcome.status {
                RunStatus::Cancelled => {
                    if !options.retain_partial {
                        self.store
                            .set_bitmap(id, &bitmap_from(manifest.total_pages, &[]))
                            .await?;
                    }
                    return Ok(JobStatus::Cancelled);
                }
                RunStatus::Paused => return Ok(JobStatus::Paused),
                RunStatus::Failed { kind, message } => {
                    return Ok(JobStatus::Failed { kind, message });
                }
                RunStatus::Completed => {}
            }
            pages.extend(outcome.pages);
            missing = outcome.missing;
        }
        if cancel.is_cancelled() {
            return Ok(JobStatus::Cancelled);
        }

        self.store.set_state(id, JobState::Assembling).await?;
        let artifacts = self
            .write_documents(id, &manifest, pages, &selected, options)
            .await?;
        if let Err(error) = tokio::fs::remove_dir_all(work_dir).await {
            debug!(path = %work_dir.display(), %error, "could not remove work directory");
        }
        Ok(JobStatus::Completed {
            artifacts,
            missing: missing.into_iter().map(|index| index + 1).collect(),
        })
    }

    async fn manifest_for(
        &self,
        id: JobId,
        url: &str,
        options: &SubmitOptions,
        resume: bool,
        deadline: Option<Instant>,
    ) -> Result<Manifest, Halt> {
        if resume && let Some(manifest) = self.store.get(id).await?.manifest()? {
            debug!(pages = manifest.total_pages, "using manifest snapshot");
            return Ok(manifest);
        }
        if !options.refresh_manifest
            && let Some(manifest) = self.store.cached_manifest(url).await?
        {
            info!(pages = manifest.total_pages, "using cached manifest");
            return Ok(manifest);
        }

        let resolution = self.adapters.resolve(url, &self.context);
        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, resolution)
                .await
                .map_err(|_| {
                    failed(
                        ErrorKind::JobTimeout,
                        "job deadline elapsed while resolving the manifest",
                    )
                })?,
            None => resolution.await,
        };
        let manifest = result.map_err(|e| failed(e.kind(), &e.to_string()))?;

        if let Err(error) = self.store.cache_manifest(url, &manifest).await {
            warn!(%error, "failed to cache manifest");
        }
        Ok(manifest)
    }

    /// Stored pages of the selection that still pass validation.
    async fn restore_pages(
        &self,
        id: JobId,
        manifest: &Manifest,
        selected: &[usize],
        work_dir: &Path,
    ) -> Result<Vec<PageData>, Halt> {
        let mut restored = Vec::new();
        for &index in selected {
            let Some(path) = find_stored_page(work_dir, index) else {
                continue;
            };
            let page = &manifest.pages[index];
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(index, path = %path.display(), %error, "cannot read stored page");
                    continue;
                }
            };
            let profile = self.context.profile_for(page.profile_url());
            match validate_page(&bytes, None, &profile) {
                Ok(format) => {
                    restored.push(PageData::new(index, page.label.clone(), format, path, &bytes));
                }
                Err(reason) => {
                    warn!(index, %reason, "discarding stored page that fails validation");
                    if let Err(error) = tokio::fs::remove_file(&path).await {
                        debug!(path = %path.display(), %error, "could not remove stored page");
                    }
                }
            }
        }

        let indices: Vec<usize> = restored.iter().map(|page| page.index).collect();
        self.store
            .set_bitmap(id, &bitmap_from(manifest.total_pages, &indices))
            .await?;
        info!(restored = restored.len(), selected = selected.len(), "restored stored pages");
        Ok(restored)
    }

    /// Runs the orchestrator, persisting and announcing every finished page.
    async fn download(
        &self,
        id: JobId,
        manifest: &Arc<Manifest>,
        run_options: RunOptions,
        total: usize,
        restored: usize,
    ) -> RunOutcome {
        let retain_partial = run_options.retain_partial;
        let eta = EtaEstimator::start(total.saturating_sub(restored));
        let mut stream = self.orchestrator.run(Arc::clone(manifest), run_options);
        self.announce(id, restored, total, None, None);

        let mut pages = Vec::new();
        while let Some(result) = stream.recv().await {
            match result {
                PageResult::Completed(page) => {
                    if let Err(error) = self.store.mark_page(id, page.index).await {
                        warn!(index = page.index, %error, "failed to record page completion");
                    }
                    self.announce(
                        id,
                        restored + pages.len() + 1,
                        total,
                        eta.estimate(pages.len() + 1),
                        Some(page.label.clone()),
                    );
                    pages.push(page);
                }
                PageResult::Failed { index, kind, .. } => {
                    debug!(index, %kind, "page failed");
                }
            }
        }

        let mut outcome = stream.collect().await;
        pages.append(&mut outcome.pages);
        if outcome.status == RunStatus::Cancelled && !retain_partial {
            pages.clear();
        }
        pages.sort_by_key(|page| page.index);
        outcome.pages = pages;
        outcome
    }

    fn announce(
        &self,
        id: JobId,
        completed: usize,
        total: usize,
        eta_seconds: Option<u64>,
        current_page_label: Option<String>,
    ) {
        // No subscribers is fine.
        let _ = self.events.send(JobEvent::Progress {
            job_id: id,
            completed,
            total,
            eta_seconds,
            current_page_label,
        });
    }

    async fn write_documents(
        &self,
        id: JobId,
        manifest: &Manifest,
        pages: Vec<PageData>,
        selected: &[usize],
        options: &SubmitOptions,
    ) -> Result<Vec<PathBuf>, Halt> {
        let assemble_options = AssembleOptions {
            split_threshold_bytes: options
                .output_size_threshold_bytes
                .or(self.settings.default_split_threshold_bytes),
            failure_policy: options.failure_policy,
        };
        let expected = selected.to_vec();
        let artifacts =
            tokio::task::spawn_blocking(move || assemble(pages, &expected, &assemble_options))
                .await
                .map_err(|e| failed(ErrorKind::Storage, &format!("assembly task failed: {e}")))?
                .map_err(|e| failed(e.kind(), &e.to_string()))?;

        let mut paths = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let planned = resolve_unique_path(
                &self.settings.output_dir,
                &artifact_file_name(
                    &manifest.display_name,
                    artifact.first_page,
                    artifact.last_page,
                ),
            );
            self.store
                .set_artifact_in_progress(id, Some(&planned))
                .await?;

            let display_name = manifest.display_name.clone();
            let out_dir = self.settings.output_dir.clone();
            let path =
                tokio::task::spawn_blocking(move || write_pdf(&artifact, &display_name, &out_dir))
                    .await
                    .map_err(|e| {
                        failed(ErrorKind::Storage, &format!("document writer failed: {e}"))
                    })?
                    .map_err(|e| failed(e.kind(), &e.to_string()))?;
            paths.push(path);
        }
        self.store.set_artifact_in_progress(id, None).await?;
        Ok(paths)
    }
}
