//! Per-host request pacing.
//!
//! Some libraries ban clients that request pages back-to-back. The
//! [`RateLimiter`] hands out request slots per host, spaced by the profile's
//! pacing interval and pushed back by `Retry-After` answers. Hosts never
//! wait on each other.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use manuscript_core::http::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new();
//! let spacing = Duration::from_millis(250);
//!
//! // First request proceeds immediately
//! limiter.acquire("https://www.e-manuscripta.ch/bau/download/webcache/2000/1", spacing).await;
//!
//! // Second request to the same host waits for the spacing
//! limiter.acquire("https://www.e-manuscripta.ch/bau/download/webcache/2000/2", spacing).await;
//! # }
//! ```

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER};

/// Per-host pacing shared by every job.
///
/// Each caller reserves the next free slot for its host under the map's
/// shard lock, then sleeps with the lock released, so concurrent workers
/// for one host queue up in reservation order.
#[derive(Debug, Default)]
pub struct RateLimiter {
    hosts: DashMap<String, HostPacing>,
}

#[derive(Debug)]
struct HostPacing {
    /// Earliest instant the next request may start.
    next_slot: Instant,
    /// Pacing plus server-mandated waits, for the slow-host warning.
    waited: Duration,
}

impl RateLimiter {
    /// Creates a limiter with no recorded hosts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for `url`'s host to be free, keeping requests to one host at
    /// least `spacing` apart.
    ///
    /// The first request to a host proceeds immediately; a zero spacing
    /// never waits.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str, spacing: Duration) {
        if spacing.is_zero() {
            return;
        }
        let host = origin_host(url);
        tracing::Span::current().record("host", &host);

        let now = Instant::now();
        let (slot, waited) = {
            let mut pacing = self.hosts.entry(host.clone()).or_insert(HostPacing {
                next_slot: now,
                waited: Duration::ZERO,
            });
            let slot = pacing.next_slot.max(now);
            pacing.next_slot = slot + spacing;
            pacing.waited += slot - now;
            (slot, pacing.waited)
        };

        let delay = slot - now;
        if delay.is_zero() {
            return;
        }
        debug!(host = %host, delay_ms = delay.as_millis(), "pacing request");
        warn_if_slow(&host, waited);
        tokio::time::sleep_until(slot).await;
    }

    /// Pushes the host's next slot past a server-mandated wait
    /// (`Retry-After`), so other workers back off too.
    pub fn record_rate_limit(&self, url: &str, delay: Duration) {
        let host = origin_host(url);
        let until = Instant::now() + delay;
        let waited = {
            let mut pacing = self.hosts.entry(host.clone()).or_insert(HostPacing {
                next_slot: until,
                waited: Duration::ZERO,
            });
            pacing.next_slot = pacing.next_slot.max(until);
            pacing.waited += delay;
            pacing.waited
        };
        debug!(host = %host, delay_ms = delay.as_millis(), "server asked to slow down");
        warn_if_slow(&host, waited);
    }
}

fn warn_if_slow(host: &str, waited: Duration) {
    if waited >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
        warn!(
            host,
            waited_secs = waited.as_secs(),
            "host is heavily paced; lowering concurrency for this library may help"
        );
    }
}

/// Extracts the lowercase host from a URL, or `"unknown"`.
///
/// ```
/// use manuscript_core::http::origin_host;
///
/// assert_eq!(origin_host("https://Digi.Vatlib.IT/view/MSS"), "digi.vatlib.it");
/// assert_eq!(origin_host("https://localhost:8080/x"), "localhost");
/// assert_eq!(origin_host("not a url"), "unknown");
/// ```
#[must_use]
pub fn origin_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports integer seconds and HTTP-dates (RFC 7231). Returns `None` if the
/// value cannot be parsed. Caps excessive values at 1 hour.
///
/// ```
/// use std::time::Duration;
/// use manuscript_core::http::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        Some(
            datetime
                .duration_since(now)
                .map_or(Duration::ZERO, |duration| duration.min(MAX_RETRY_AFTER)),
        )
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}
