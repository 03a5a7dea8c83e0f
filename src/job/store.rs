//! Persisted job state.
//!
//! Each job row carries its manifest snapshot, a per-page completion bitmap
//! (`'0'`/`'1'` per manifest page), the artifact currently being written and
//! the lifecycle state. The manifest cache is keyed by viewer URL.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::{debug, instrument};

use super::{JobError, JobId, SubmitOptions};
use crate::db::Database;
use crate::error::{ErrorKind, parse_error_kind};
use crate::manifest::Manifest;

/// Persisted lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not started.
    Pending,
    /// Resolving the viewer URL into a manifest.
    Resolving,
    /// Fetching pages.
    Downloading,
    /// Writing output documents.
    Assembling,
    /// Finished with artifacts.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped on request.
    Cancelled,
    /// Stopped on request with every stored page kept for resume.
    Paused,
}

impl JobState {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }

    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    ///
    /// `Paused` is not terminal: the job is waiting for a resume.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolving" => Ok(Self::Resolving),
            "downloading" => Ok(Self::Downloading),
            "assembling" => Ok(Self::Assembling),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("invalid job state: {s}")),
        }
    }
}

/// A row of the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    /// Unique identifier.
    pub id: i64,
    /// Viewer URL as submitted.
    pub source_url: String,
    /// Manuscript title once resolved.
    pub display_name: Option<String>,
    /// Serialized manifest snapshot.
    pub manifest_json: Option<String>,
    /// Serialized [`SubmitOptions`].
    pub options_json: String,
    /// Directory holding stored pages.
    pub work_dir: String,
    /// Per-page completion bitmap.
    pub page_bitmap: String,
    /// Artifact being written while assembling.
    pub artifact_path: Option<String>,
    /// JSON array of finished artifacts.
    pub artifact_paths: Option<String>,
    /// Lifecycle state string.
    pub status: String,
    /// Failure kind identifier.
    pub error_kind: Option<String>,
    /// Failure message.
    pub error_message: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

impl JobRecord {
    /// Typed job id.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        JobId(self.id)
    }

    /// Parsed lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::CorruptState`] for an unknown state string.
    pub fn state(&self) -> Result<JobState, JobError> {
        self.status.parse().map_err(|detail| JobError::CorruptState {
            id: self.job_id(),
            detail,
        })
    }

    /// Parsed submit options.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Serialization`] if the stored JSON is invalid.
    pub fn options(&self) -> Result<SubmitOptions, JobError> {
        Ok(serde_json::from_str(&self.options_json)?)
    }

    /// Parsed manifest snapshot, if resolution got that far.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Serialization`] if the stored JSON is invalid.
    pub fn manifest(&self) -> Result<Option<Manifest>, JobError> {
        self.manifest_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(JobError::from)
    }

    /// Finished artifacts.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Serialization`] if the stored JSON is invalid.
    pub fn artifacts(&self) -> Result<Vec<PathBuf>, JobError> {
        Ok(self
            .artifact_paths
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default())
    }

    /// Failure kind, if the job failed.
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind.as_deref().and_then(parse_error_kind)
    }

    /// Zero-based indices marked complete in the bitmap.
    #[must_use]
    pub fn completed_indices(&self) -> Vec<usize> {
        bitmap_indices(&self.page_bitmap)
    }
}

/// Zero-based positions of `'1'` in a completion bitmap.
#[must_use]
pub fn bitmap_indices(bitmap: &str) -> Vec<usize> {
    bitmap
        .bytes()
        .enumerate()
        .filter_map(|(index, b)| (b == b'1').then_some(index))
        .collect()
}

/// Bitmap of `total` pages with `done` set.
#[must_use]
pub fn bitmap_from(total: usize, done: &[usize]) -> String {
    let mut bits = vec![b'0'; total];
    for &index in done {
        if let Some(bit) = bits.get_mut(index) {
            *bit = b'1';
        }
    }
    bits.into_iter().map(char::from).collect()
}

/// Returns `Ok(())` if a row was affected; otherwise [`JobError::NotFound`].
fn check_affected(id: JobId, rows_affected: u64) -> Result<(), JobError> {
    if rows_affected == 0 {
        Err(JobError::NotFound(id))
    } else {
        Ok(())
    }
}

/// Job persistence over [`Database`].
#[derive(Debug, Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a pending job; its work directory is `work_root/job-{id}`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Database`] if the insert fails.
    #[instrument(skip(self, options, work_root), fields(url = %source_url))]
    pub async fn create(
        &self,
        source_url: &str,
        options: &SubmitOptions,
        work_root: &Path,
    ) -> Result<(JobId, PathBuf), JobError> {
        let options_json = serde_json::to_string(options)?;
        let mut tx = self.db.pool().begin().await?;
        let id: i64 = sqlx::query_scalar(
            r"INSERT INTO jobs (source_url, options_json, work_dir, status)
              VALUES (?, ?, '', ?)
              RETURNING id",
        )
        .bind(source_url)
        .bind(&options_json)
        .bind(JobState::Pending.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let work_dir = work_root.join(format!("job-{id}"));
        sqlx::query("UPDATE jobs SET work_dir = ? WHERE id = ?")
            .bind(work_dir.display().to_string())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(id, work_dir = %work_dir.display(), "created job");
        Ok((JobId(id), work_dir))
    }

    /// Loads a job.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] if there is no such job.
    pub async fn get(&self, id: JobId) -> Result<JobRecord, JobError> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(JobError::NotFound(id))
    }

    /// Most recent jobs first.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Database`] if the query fails.
    pub async fn list(&self, limit: u32) -> Result<Vec<JobRecord>, JobError> {
        Ok(
            sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs ORDER BY id DESC LIMIT ?")
                .bind(i64::from(limit))
                .fetch_all(self.db.pool())
                .await?,
        )
    }

    /// Moves a job to `state`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] if there is no such job.
    pub async fn set_state(&self, id: JobId, state: JobState) -> Result<(), JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(id.0)
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Stores the manifest snapshot and sizes the bitmap to it.
    ///
    /// An existing bitmap of the right length is kept.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] if there is no such job.
    pub async fn record_manifest(&self, id: JobId, manifest: &Manifest) -> Result<(), JobError> {
        let json = serde_json::to_string(manifest)?;
        let empty = bitmap_from(manifest.total_pages, &[]);
        let result = sqlx::query(
            r"UPDATE jobs
              SET manifest_json = ?,
                  display_name = ?,
                  page_bitmap = CASE WHEN length(page_bitmap) = ? THEN page_bitmap ELSE ? END,
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(json)
        .bind(&manifest.display_name)
        .bind(i64::try_from(manifest.total_pages).unwrap_or(i64::MAX))
        .bind(empty)
        .bind(id.0)
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Marks one page complete in the bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] if there is no such job.
    pub async fn mark_page(&self, id: JobId, index: usize) -> Result<(), JobError> {
        let position = i64::try_from(index).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r"UPDATE jobs
              SET page_bitmap = substr(page_bitmap, 1, ?) || '1' || substr(page_bitmap, ? + 2),
                  updated_at = datetime('now')
              WHERE id = ? AND length(page_bitmap) > ?",
        )
        .bind(position)
        .bind(position)
        .bind(id.0)
        .bind(position)
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Replaces the bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] if there is no such job.
    pub async fn set_bitmap(&self, id: JobId, bitmap: &str) -> Result<(), JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET page_bitmap = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(bitmap)
        .bind(id.0)
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Records the artifact currently being written (or clears it).
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] if there is no such job.
    pub async fn set_artifact_in_progress(
        &self,
        id: JobId,
        path: Option<&Path>,
    ) -> Result<(), JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET artifact_path = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(path.map(|p| p.display().to_string()))
        .bind(id.0)
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Marks a job completed with its artifacts.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] if there is no such job.
    pub async fn complete(&self, id: JobId, artifacts: &[PathBuf]) -> Result<(), JobError> {
        let json = serde_json::to_string(artifacts)?;
        let result = sqlx::query(
            r"UPDATE jobs
              SET status = ?, artifact_paths = ?, artifact_path = NULL,
                  error_kind = NULL, error_message = NULL, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(JobState::Completed.as_str())
        .bind(json)
        .bind(id.0)
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Marks a job failed.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] if there is no such job.
    pub async fn fail(&self, id: JobId, kind: ErrorKind, message: &str) -> Result<(), JobError> {
        let result = sqlx::query(
            r"UPDATE jobs
              SET status = ?, error_kind = ?, error_message = ?, artifact_path = NULL,
                  updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(JobState::Failed.as_str())
        .bind(kind.to_string())
        .bind(message)
        .bind(id.0)
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Caches a resolved manifest for `source_url`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Database`] if the upsert fails.
    pub async fn cache_manifest(&self, source_url: &str, manifest: &Manifest) -> Result<(), JobError> {
        let json = serde_json::to_string(manifest)?;
        sqlx::query(
            r"INSERT INTO manifest_cache (source_url, manifest_json)
              VALUES (?, ?)
              ON CONFLICT(source_url) DO UPDATE
              SET manifest_json = excluded.manifest_json, cached_at = datetime('now')",
        )
        .bind(source_url)
        .bind(json)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Cached manifest for `source_url`; unreadable entries count as a miss.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Database`] if the query fails.
    pub async fn cached_manifest(&self, source_url: &str) -> Result<Option<Manifest>, JobError> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT manifest_json FROM manifest_cache WHERE source_url = ?")
                .bind(source_url)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.and_then(|json| match serde_json::from_str::<Manifest>(&json) {
            Ok(manifest) if manifest.validate().is_ok() => Some(manifest),
            _ => {
                debug!(url = source_url, "ignoring unreadable cached manifest");
                None
            }
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::PageDescriptor;

    async fn store() -> JobStore {
        JobStore::new(Database::new_in_memory().await.unwrap())
    }

    fn manifest(pages: usize) -> Manifest {
        let pages = (0..pages)
            .map(|i| PageDescriptor::direct(i, format!("https://img.example/{i}.jpg"), format!("{}", i + 1)))
            .collect();
        Manifest::new("https://viewer.example/1", "example", "Codex", pages).unwrap()
    }

    #[test]
    fn test_bitmap_helpers() {
        assert_eq!(bitmap_from(5, &[0, 3, 9]), "10010");
        assert_eq!(bitmap_indices("10010"), vec![0, 3]);
    }

    #[test]
    fn test_job_state_roundtrip() {
        for state in [
            JobState::Pending,
            JobState::Resolving,
            JobState::Downloading,
            JobState::Assembling,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
            JobState::Paused,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!(!JobState::Paused.is_terminal());
        assert!("bogus".parse::<JobState>().is_err());
    }

    #[tokio::test]
    async fn test_create_assigns_work_dir() {
        let store = store().await;
        let (id, work_dir) = store
            .create("https://viewer.example/1", &SubmitOptions::default(), Path::new("/tmp/work"))
            .await
            .unwrap();
        assert_eq!(work_dir, Path::new("/tmp/work").join(format!("job-{id}")));

        let record = store.get(id).await.unwrap();
        assert_eq!(record.state().unwrap(), JobState::Pending);
        assert_eq!(PathBuf::from(&record.work_dir), work_dir);
        assert_eq!(record.options().unwrap(), SubmitOptions::default());
    }

    #[tokio::test]
    async fn test_bitmap_tracks_completed_pages() {
        let store = store().await;
        let (id, _) = store
            .create("https://viewer.example/1", &SubmitOptions::default(), Path::new("/tmp"))
            .await
            .unwrap();
        store.record_manifest(id, &manifest(4)).await.unwrap();
        store.mark_page(id, 0).await.unwrap();
        store.mark_page(id, 2).await.unwrap();
        store.mark_page(id, 2).await.unwrap();

        let record = store.get(id).await.unwrap();
        assert_eq!(record.page_bitmap, "1010");
        assert_eq!(record.completed_indices(), vec![0, 2]);
        assert_eq!(record.manifest().unwrap().unwrap().total_pages, 4);
        assert_eq!(record.display_name.as_deref(), Some("Codex"));

        store.record_manifest(id, &manifest(4)).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().page_bitmap, "1010");
    }

    #[tokio::test]
    async fn test_terminal_states_persist_details() {
        let store = store().await;
        let (id, _) = store
            .create("https://viewer.example/1", &SubmitOptions::default(), Path::new("/tmp"))
            .await
            .unwrap();
        store
            .fail(id, ErrorKind::HttpError(403), "forbidden")
            .await
            .unwrap();
        let record = store.get(id).await.unwrap();
        assert_eq!(record.state().unwrap(), JobState::Failed);
        assert_eq!(record.error_kind(), Some(ErrorKind::HttpError(403)));

        let artifacts = vec![PathBuf::from("/out/Codex_pages_1-4.pdf")];
        store.complete(id, &artifacts).await.unwrap();
        let record = store.get(id).await.unwrap();
        assert_eq!(record.artifacts().unwrap(), artifacts);
        assert_eq!(record.error_kind(), None);
    }

    #[tokio::test]
    async fn test_missing_job_is_not_found() {
        let store = store().await;
        assert!(matches!(store.get(JobId(99)).await, Err(JobError::NotFound(JobId(99)))));
        assert!(matches!(
            store.set_state(JobId(99), JobState::Failed).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_manifest_cache_upsert() {
        let store = store().await;
        assert!(store.cached_manifest("https://viewer.example/1").await.unwrap().is_none());
        store.cache_manifest("https://viewer.example/1", &manifest(2)).await.unwrap();
        store.cache_manifest("https://viewer.example/1", &manifest(3)).await.unwrap();
        let cached = store.cached_manifest("https://viewer.example/1").await.unwrap().unwrap();
        assert_eq!(cached.total_pages, 3);
    }
}
