//! Engine configuration loaded from TOML.
//!
//! ```toml
//! base_timeout_secs = 30
//! max_sockets = 32
//! tile_memory_budget_mb = 512
//! split_threshold_mb = 200
//! output_dir = "~/Manuscripts"
//! auto_deadline = true
//!
//! [[profiles]]
//! name = "slow-library"
//! origin_pattern = "images\\.slow-library\\.org"
//! max_concurrency = 2
//! timeout_multiplier = 2.5
//!
//! [[iiif_rules]]
//! library = "example"
//! pattern = "^https://viewer\\.example\\.org/item/(\\d+)"
//! template = "https://iiif.example.org/$1/manifest"
//! ```
//!
//! Profiles listed here are checked before the built-in table.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::adapter::{ManifestRule, build_default_adapter_registry};
use crate::db::{Database, DbError};
use crate::http::constants::{CONNECT_TIMEOUT, DEFAULT_BASE_TIMEOUT, DEFAULT_MAX_IN_FLIGHT};
use crate::http::{ClientOptions, FetchError, ResilientClient};
use crate::job::{JobManager, JobSettings, JobStore};
use crate::profile::{ProfileError, ProfileRegistry, SourceProfile};
use crate::stitch::DEFAULT_MEMORY_BUDGET_BYTES;

const APP_DIR: &str = "manuscript-dl";
const MIB: u64 = 1024 * 1024;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Config path.
        path: PathBuf,
        /// IO failure.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// Config path.
        path: PathBuf,
        /// TOML error with line information.
        #[source]
        source: toml::de::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Offending key.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A profile override is invalid.
    #[error(transparent)]
    Profile(#[from] ProfileError),

    /// The HTTP client could not be built.
    #[error(transparent)]
    Client(#[from] FetchError),

    /// The job store could not be opened.
    #[error(transparent)]
    Store(#[from] DbError),
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Request timeout before profile scaling.
    pub base_timeout_secs: u64,
    /// TCP connect timeout.
    pub connect_timeout_secs: u64,
    /// Cap on concurrent requests across all jobs.
    pub max_sockets: usize,
    /// Largest stitched canvas in MiB of RGB pixels.
    pub tile_memory_budget_mb: u64,
    /// Default document split threshold in MiB.
    pub split_threshold_mb: Option<u64>,
    /// Parent of per-job page directories.
    pub work_dir: PathBuf,
    /// Where documents are written.
    pub output_dir: PathBuf,
    /// Job store location.
    pub database_path: PathBuf,
    /// Derive a job deadline from page count when none is given.
    pub auto_deadline: bool,
    /// Profiles checked before the built-in table.
    pub profiles: Vec<SourceProfile>,
    /// Extra viewer-to-manifest rules for the IIIF adapter.
    pub iiif_rules: Vec<ManifestRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            base_timeout_secs: DEFAULT_BASE_TIMEOUT.as_secs(),
            connect_timeout_secs: CONNECT_TIMEOUT.as_secs(),
            max_sockets: DEFAULT_MAX_IN_FLIGHT,
            tile_memory_budget_mb: DEFAULT_MEMORY_BUDGET_BYTES / MIB,
            split_threshold_mb: None,
            work_dir: data_dir.join("work"),
            output_dir: PathBuf::from("."),
            database_path: data_dir.join("jobs.db"),
            auto_deadline: false,
            profiles: Vec::new(),
            iiif_rules: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates TOML text.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for syntax or schema errors, otherwise the
    /// first validation failure.
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.expand_home();
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, otherwise see
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&raw, path)?;
        info!(path = %path.display(), profiles = config.profiles.len(), "loaded config");
        Ok(config)
    }

    /// Loads the default config file if it exists, else the defaults.
    ///
    /// Returns the config and the path it came from.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn load_default() -> Result<(Self, Option<PathBuf>), ConfigError> {
        match resolve_default_config_path() {
            Some(path) if path.exists() => Ok((Self::load(&path)?, Some(path))),
            other => {
                debug!(path = ?other, "no config file, using defaults");
                Ok((Self::default(), None))
            }
        }
    }

    /// Checks ranges, profile overrides and rule patterns.
    ///
    /// # Errors
    ///
    /// Returns the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("base_timeout_secs", self.base_timeout_secs, 1..=3600)?;
        check_range("connect_timeout_secs", self.connect_timeout_secs, 1..=600)?;
        check_range("max_sockets", self.max_sockets as u64, 1..=256)?;
        check_range("tile_memory_budget_mb", self.tile_memory_budget_mb, 16..=16_384)?;
        if let Some(split) = self.split_threshold_mb {
            check_range("split_threshold_mb", split, 1..=1_048_576)?;
        }
        ProfileRegistry::with_overrides(self.profiles.clone())?;
        for (position, rule) in self.iiif_rules.iter().enumerate() {
            Regex::new(&rule.pattern).map_err(|e| {
                invalid(format!("iiif_rules[{position}].pattern"), e.to_string())
            })?;
            if rule.template.is_empty() {
                return Err(invalid(
                    format!("iiif_rules[{position}].template"),
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }

    /// HTTP client options.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            base_timeout: Duration::from_secs(self.base_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_in_flight: self.max_sockets,
        }
    }

    /// Job manager settings.
    #[must_use]
    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            work_root: self.work_dir.clone(),
            output_dir: self.output_dir.clone(),
            stitch_budget_bytes: self.tile_memory_budget_mb * MIB,
            default_split_threshold_bytes: self.split_threshold_mb.map(|mb| mb * MIB),
            auto_deadline: self.auto_deadline,
        }
    }

    /// Builds the client, profile table, adapters and store into a manager.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any component cannot be built.
    pub async fn open_manager(&self) -> Result<JobManager, ConfigError> {
        let client = ResilientClient::new(self.client_options())?;
        let profiles = Arc::new(ProfileRegistry::with_overrides(self.profiles.clone())?);
        let adapters = build_default_adapter_registry(self.iiif_rules.clone());
        let db = Database::new(&self.database_path).await?;
        Ok(JobManager::new(
            client,
            profiles,
            adapters,
            JobStore::new(db),
            self.job_settings(),
        ))
    }

    fn expand_home(&mut self) {
        for path in [&mut self.work_dir, &mut self.output_dir, &mut self.database_path] {
            *path = expand_home(path);
        }
    }
}

fn check_range(
    field: &str,
    value: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(invalid(
            field,
            format!(
                "{value}. Expected range: {}..={}",
                range.start(),
                range.end()
            ),
        ))
    }
}

/// `~/x` to `$HOME/x`; other paths unchanged.
fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = env_var_non_empty_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    path.to_path_buf()
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/manuscript-dl/config.toml`
/// 2. `$HOME/.config/manuscript-dl/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join(APP_DIR).join("config.toml"));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml"),
    )
}

/// `$XDG_DATA_HOME/manuscript-dl`, `~/.local/share/manuscript-dl`, or a
/// relative `.manuscript-dl` when neither is set.
fn default_data_dir() -> PathBuf {
    if let Some(xdg_data_home) = env_var_non_empty_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg_data_home).join(APP_DIR);
    }
    env_var_non_empty_os("HOME").map_or_else(
        || PathBuf::from(format!(".{APP_DIR}")),
        |home| PathBuf::from(home).join(".local").join("share").join(APP_DIR),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}
