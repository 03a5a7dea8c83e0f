//! Manuscript Downloader Core Library
//!
//! Resolves digital-library viewer URLs into page manifests, downloads the
//! pages with per-origin tuning, and assembles them into PDF documents.
//!
//! # Architecture
//!
//! - [`adapter`] - viewer URL to [`Manifest`] resolution (IIIF, ContentDM, Deep Zoom, ...)
//! - [`profile`] - per-origin tuning table
//! - [`http`] - resilient HTTP client with retries and pacing
//! - [`stitch`] - tile reconstruction of pages served only as tiles
//! - [`download`] - concurrent page fetching with validation and progress
//! - [`assemble`] - PDF output with size-based splitting
//! - [`job`] - submit, observe, cancel and resume jobs
//! - [`db`] - job store and manifest cache
//! - [`config`] - TOML engine configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod adapter;
pub mod assemble;
pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod http;
pub mod job;
pub mod manifest;
pub mod profile;
pub mod stitch;

// Re-export commonly used types
pub use adapter::{AdapterError, AdapterRegistry, build_default_adapter_registry};
pub use config::{ConfigError, EngineConfig, resolve_default_config_path};
pub use db::Database;
pub use download::{FailurePolicy, Orchestrator, PageResult, RunOptions};
pub use error::{ErrorKind, actionable_message};
pub use http::{ClientOptions, FetchError, ResilientClient};
pub use job::{JobError, JobEvent, JobId, JobManager, JobStatus, SubmitOptions};
pub use manifest::{Manifest, PageDescriptor, PageRange};
pub use profile::{ProfileRegistry, SourceProfile};
