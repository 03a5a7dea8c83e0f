//! Page download orchestration.
//!
//! Turns a [`Manifest`](crate::manifest::Manifest) into validated page
//! bytes stored in a work directory.
//!
//! # Features
//!
//! - Bounded worker pool sized by the source profile
//! - One fetch per distinct page URL, shared by every index that needs it
//! - Validation against placeholder images and HTML error bodies, with
//!   re-fetch on rejection
//! - Tiled pages routed through the tile stitcher
//! - Best-effort or abort-on-first-failure policies
//! - Progress snapshots with ETA over a `watch` channel
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use manuscript_core::download::{Orchestrator, RunOptions};
//! use manuscript_core::http::{ClientOptions, ResilientClient};
//! use manuscript_core::manifest::{Manifest, PageDescriptor};
//! use manuscript_core::profile::ProfileRegistry;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ResilientClient::new(ClientOptions::default())?;
//! let profiles = Arc::new(ProfileRegistry::builtin()?);
//! let orchestrator = Orchestrator::new(client, profiles, 512 * 1024 * 1024);
//! let manifest = Manifest::new(
//!     "https://viewer.example/item/1",
//!     "example",
//!     "Example codex",
//!     vec![PageDescriptor::direct(0, "https://img.example/1.jpg", "1r")],
//! )?;
//! let outcome = orchestrator
//!     .run(Arc::new(manifest), RunOptions::new("./work"))
//!     .collect()
//!     .await;
//! println!("{} pages", outcome.pages.len());
//! # Ok(())
//! # }
//! ```

mod error;
mod orchestrator;
mod progress;
mod task;
mod validate;

pub use error::PageError;
pub use orchestrator::{
    CancelFlag, DownloadStats, FailurePolicy, Orchestrator, PageData, PageResult, PageStream,
    RunOptions, RunOutcome, RunStatus, find_stored_page, page_file_name,
};
pub use progress::{EtaEstimator, Progress, eta_from};
pub use task::{DownloadTask, TaskState, TransitionError};
pub use validate::{PageFormat, ValidationError, sniff_format, validate_page};
