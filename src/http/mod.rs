//! Resilient HTTP fetching shared by adapters, the stitcher and the orchestrator.
//!
//! - [`ResilientClient`] - profile-parameterized fetch with bounded redirects
//! - [`RetryPolicy`] / [`classify_error`] - the single retry policy
//! - [`RateLimiter`] - per-host request spacing
//! - [`FetchError`] - transport failures

mod client;
pub mod constants;
mod error;
mod rate_limiter;
mod retry;

pub use client::{ClientOptions, FetchedBody, ResilientClient};
pub use constants::MAX_REDIRECTS;
pub use error::FetchError;
pub use rate_limiter::{RateLimiter, origin_host, parse_retry_after};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
