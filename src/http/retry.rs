//! The crate's single retry policy.
//!
//! Libraries differ only in parameters: how many attempts a request gets and
//! how long to wait between them. Both come from the
//! [`SourceProfile`](crate::profile::SourceProfile) governing the URL.
//!
//! Failures are first sorted into a [`FailureType`]:
//! - [`FailureType::Transient`] - connection drops, timeouts, 5xx, 408
//! - [`FailureType::RateLimited`] - 429; the server's `Retry-After` wins
//! - [`FailureType::Permanent`] - other 4xx, redirect loops, TLS failures
//!
//! # Example
//!
//! ```
//! use manuscript_core::http::{FetchError, RetryDecision, RetryPolicy, classify_error};
//! use manuscript_core::profile::SourceProfile;
//!
//! let policy = RetryPolicy::for_profile(&SourceProfile::default());
//! let error = FetchError::http_status("https://example.com/page.jpg", 503);
//!
//! if let RetryDecision::Retry { delay, attempt } = policy.should_retry(classify_error(&error), 1) {
//!     println!("attempt {attempt} in {delay:?}");
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::FetchError;
use crate::profile::{MAX_ATTEMPTS_CEILING, SourceProfile};

/// Attempts granted when a profile does not say otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// First wait of the exponential fallback.
const EXPONENTIAL_BASE: Duration = Duration::from_secs(1);

/// Longest wait of the exponential fallback.
const EXPONENTIAL_CAP: Duration = Duration::from_secs(32);

/// Upper bound on random jitter.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed if tried again.
    Transient,
    /// Will fail the same way every time.
    Permanent,
    /// Server asked us to slow down (HTTP 429).
    RateLimited,
}

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then make attempt number `attempt`.
    Retry {
        /// Wait before the next attempt.
        delay: Duration,
        /// 1-based number of the next attempt.
        attempt: u32,
    },
    /// Give up and surface the last error.
    DoNotRetry {
        /// Why no further attempt is made.
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Backoff {
    /// Doubling from one second, capped at 32 seconds.
    Exponential,
    /// Wait `schedule[n - 1]` after attempt `n`; the last entry repeats.
    Schedule(Vec<Duration>),
}

impl Backoff {
    fn base_delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Exponential => {
                let doublings = attempt.saturating_sub(1).min(16);
                EXPONENTIAL_BASE
                    .saturating_mul(1 << doublings)
                    .min(EXPONENTIAL_CAP)
            }
            Self::Schedule(steps) => {
                let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
                steps
                    .get(index)
                    .or_else(|| steps.last())
                    .copied()
                    .unwrap_or(EXPONENTIAL_BASE)
            }
        }
    }
}

/// Attempt budget plus backoff for one request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Policy for requests governed by `profile`.
    ///
    /// An empty `retry_backoff_ms` falls back to exponential backoff.
    #[must_use]
    pub fn for_profile(profile: &SourceProfile) -> Self {
        let backoff = if profile.retry_backoff_ms.is_empty() {
            Backoff::Exponential
        } else {
            Backoff::Schedule(
                profile
                    .retry_backoff_ms
                    .iter()
                    .map(|ms| Duration::from_millis(*ms))
                    .collect(),
            )
        };
        Self {
            max_attempts: profile.max_attempts.clamp(1, MAX_ATTEMPTS_CEILING),
            backoff,
        }
    }

    /// Total attempts, the first one included.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what to do after attempt `attempt` (1-based) failed.
    #[must_use]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure".to_string(),
            };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::DoNotRetry {
                reason: format!("all {} attempts exhausted", self.max_attempts),
            };
        }
        let delay = self.delay_after(attempt);
        debug!(attempt, delay_ms = delay.as_millis(), "scheduling retry");
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Backoff plus jitter no larger than the backoff itself or 500 ms.
    fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.backoff.base_delay(attempt);
        base + jitter(base.min(MAX_JITTER))
    }
}

fn jitter(cap: Duration) -> Duration {
    let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
    if cap_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
}

/// Sorts a fetch error for the retry decision.
#[must_use]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::HttpStatus { status: 429, .. } => FailureType::RateLimited,
        FetchError::HttpStatus { status: 408, .. } => FailureType::Transient,
        FetchError::HttpStatus { status, .. } if (500..600).contains(status) => {
            FailureType::Transient
        }
        FetchError::Network { source, .. } if !is_tls_error(source) => FailureType::Transient,
        FetchError::Timeout { .. } => FailureType::Transient,
        FetchError::HttpStatus { .. }
        | FetchError::Network { .. }
        | FetchError::TooManyRedirects { .. }
        | FetchError::InvalidUrl { .. }
        | FetchError::ClientBuild { .. } => FailureType::Permanent,
    }
}

/// Certificate and handshake failures do not heal on retry.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let text = error.to_string().to_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| text.contains(needle))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn profile(attempts: u32, backoff_ms: &[u64]) -> SourceProfile {
        SourceProfile {
            max_attempts: attempts,
            retry_backoff_ms: backoff_ms.to_vec(),
            ..SourceProfile::default()
        }
    }

    fn between(value: Duration, low_ms: u64, high_ms: u64) -> bool {
        value >= Duration::from_millis(low_ms) && value <= Duration::from_millis(high_ms)
    }

    #[test]
    fn test_schedule_is_followed_and_last_step_repeats() {
        let policy = RetryPolicy::for_profile(&profile(8, &[10, 20]));
        assert_eq!(policy.max_attempts(), 8);
        assert!(between(policy.delay_after(1), 10, 20));
        assert!(between(policy.delay_after(2), 20, 40));
        assert!(between(policy.delay_after(6), 20, 40));
    }

    #[test]
    fn test_exponential_fallback_doubles_up_to_cap() {
        let policy = RetryPolicy::for_profile(&profile(15, &[]));
        assert!(between(policy.delay_after(1), 1_000, 1_500));
        assert!(between(policy.delay_after(3), 4_000, 4_500));
        assert!(between(policy.delay_after(12), 32_000, 32_500));
    }

    #[test]
    fn test_attempts_clamped_to_ceiling() {
        assert_eq!(RetryPolicy::for_profile(&profile(0, &[])).max_attempts(), 1);
        assert_eq!(RetryPolicy::for_profile(&profile(99, &[])).max_attempts(), 15);
    }

    #[test]
    fn test_jitter_bounded_by_cap() {
        for _ in 0..100 {
            assert!(jitter(MAX_JITTER) <= MAX_JITTER);
            assert!(jitter(Duration::from_millis(5)) <= Duration::from_millis(5));
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_status_classification() {
        let kind = |status| classify_error(&FetchError::http_status("http://x.example", status));
        for status in [400, 401, 403, 404, 410, 451] {
            assert_eq!(kind(status), FailureType::Permanent, "{status}");
        }
        for status in [408, 500, 502, 503, 504, 599] {
            assert_eq!(kind(status), FailureType::Transient, "{status}");
        }
        assert_eq!(kind(429), FailureType::RateLimited);
    }

    #[test]
    fn test_timeouts_retry_but_redirect_loops_do_not() {
        let timeout = FetchError::timeout("http://x.example", 1000);
        assert_eq!(classify_error(&timeout), FailureType::Transient);
        let looped = FetchError::too_many_redirects("http://x.example", 11);
        assert_eq!(classify_error(&looped), FailureType::Permanent);
    }

    #[test]
    fn test_decision_stops_at_budget() {
        let policy = RetryPolicy::for_profile(&profile(3, &[1]));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::RateLimited, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        let RetryDecision::DoNotRetry { reason } = policy.should_retry(FailureType::Transient, 3)
        else {
            panic!("expected the budget to run out");
        };
        assert!(reason.contains("exhausted"));
        assert!(matches!(
            policy.should_retry(FailureType::Permanent, 1),
            RetryDecision::DoNotRetry { .. }
        ));
    }
}
