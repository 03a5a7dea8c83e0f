//! Constants for the HTTP layer (timeouts, redirect cap, pacing limits).

use std::time::Duration;

/// Hard cap on redirect hops for a single fetch.
pub const MAX_REDIRECTS: usize = 10;

/// Default per-request timeout before profile scaling (30 seconds).
pub const DEFAULT_BASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TCP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on in-flight requests across all jobs.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// Warning threshold for cumulative pacing delay per host (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Browser User-Agent sent when a profile does not set its own.
///
/// Several libraries answer non-browser agents with an error page or a
/// placeholder image, so the default has to look like a desktop browser.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
