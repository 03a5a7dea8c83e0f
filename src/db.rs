//! SQLite store for job resume state and the manifest cache.
//!
//! File databases run in WAL mode so progress writes from running jobs do
//! not block `--list` readers. Migrations under `migrations/` are embedded
//! and applied on open.
//!
//! # Example
//!
//! ```no_run
//! use manuscript_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("jobs.db")).await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite serializes writers, so a small pool is enough.
const MAX_CONNECTIONS: u32 = 4;

/// How long a writer waits on a locked database before `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Failures opening the job store.
#[derive(Error, Debug)]
pub enum DbError {
    /// The database could not be opened or queried.
    #[error("job store unavailable: {0}")]
    Connection(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("job store schema upgrade failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The directory holding the database could not be created.
    #[error("failed to create job store directory {path}: {source}")]
    Directory {
        /// Directory path.
        path: String,
        /// IO failure.
        #[source]
        source: std::io::Error,
    },
}

/// Pooled handle on the job store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the store at `db_path`, creating the file and its directory.
    ///
    /// # Errors
    ///
    /// - [`DbError::Directory`] if the parent directory cannot be created
    /// - [`DbError::Connection`] if SQLite refuses the file
    /// - [`DbError::Migration`] if the schema cannot be brought up to date
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| DbError::Directory {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        Self::migrated(pool).await
    }

    /// Private in-memory store on a single connection.
    ///
    /// # Errors
    ///
    /// Same as [`Database::new`], minus directory creation.
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DbError> {
        MIGRATOR.run(&pool).await?;
        debug!(migrations = MIGRATOR.iter().count(), "job store schema ready");
        Ok(Self { pool })
    }

    /// Connection pool for queries.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Active journal mode, lowercased (`wal`, `memory`, ...).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the pragma cannot be read.
    pub async fn journal_mode(&self) -> Result<String, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.to_lowercase())
    }
}
