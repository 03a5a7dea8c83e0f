//! The resilient fetch primitive every other component uses.
//!
//! [`ResilientClient::fetch`] performs one logical GET against an origin,
//! governed by that origin's [`SourceProfile`]:
//! - redirects are followed by hand so the hop count is bounded
//!   ([`MAX_REDIRECTS`]) even for origins that redirect to themselves
//! - the request timeout is the base timeout scaled by the profile
//! - certificate validation is skipped only through a dedicated client and
//!   only for profiles that opt in
//! - profile headers are attached to every hop
//! - transient failures are retried by the shared [`RetryPolicy`]
//!
//! A process-wide semaphore caps in-flight requests across all jobs.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, LOCATION, RETRY_AFTER};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};
use url::Url;

use super::constants::{
    BROWSER_USER_AGENT, CONNECT_TIMEOUT, DEFAULT_BASE_TIMEOUT, DEFAULT_MAX_IN_FLIGHT,
    MAX_REDIRECTS,
};
use super::error::FetchError;
use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use crate::profile::SourceProfile;

/// Engine-wide knobs for the client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout before profile scaling.
    pub base_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Global cap on concurrent requests.
    pub max_in_flight: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_timeout: DEFAULT_BASE_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// A successful response body.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    /// Raw body bytes.
    pub bytes: Vec<u8>,
    /// `Content-Type` header, if the origin sent one.
    pub content_type: Option<String>,
    /// URL after following redirects.
    pub final_url: String,
}

impl FetchedBody {
    /// Body decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Retrying, redirect-bounded HTTP client parameterized per request by a profile.
///
/// Cheap to clone; clones share connection pools, pacing state and the
/// in-flight cap.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    strict: Client,
    lenient: Client,
    options: ClientOptions,
    rate_limiter: Arc<RateLimiter>,
    sockets: Arc<Semaphore>,
}

impl ResilientClient {
    /// Creates a client with a fresh pacing table.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ClientBuild`] if the TLS backend fails to initialize.
    pub fn new(options: ClientOptions) -> Result<Self, FetchError> {
        Self::with_rate_limiter(options, Arc::new(RateLimiter::new()))
    }

    /// Creates a client sharing an existing pacing table.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ClientBuild`] if the TLS backend fails to initialize.
    #[instrument(skip(rate_limiter), fields(base_timeout_ms = options.base_timeout.as_millis()))]
    pub fn with_rate_limiter(
        options: ClientOptions,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, FetchError> {
        let strict = build_client(&options, false)?;
        let lenient = build_client(&options, true)?;
        let sockets = Arc::new(Semaphore::new(options.max_in_flight.max(1)));
        Ok(Self {
            strict,
            lenient,
            options,
            rate_limiter,
            sockets,
        })
    }

    /// Returns the options this client was built with.
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Fetches `url` with retries, redirects and pacing per `profile`.
    ///
    /// # Errors
    ///
    /// Returns the last [`FetchError`] once the retry policy gives up.
    pub async fn fetch(
        &self,
        url: &str,
        profile: &SourceProfile,
    ) -> Result<FetchedBody, FetchError> {
        self.fetch_with_headers(url, profile, &[]).await
    }

    /// Like [`fetch`](Self::fetch) with extra headers for this request only.
    ///
    /// # Errors
    ///
    /// Returns the last [`FetchError`] once the retry policy gives up.
    #[instrument(skip(self, profile, extra_headers), fields(url = %url, profile = %profile.name))]
    pub async fn fetch_with_headers(
        &self,
        url: &str,
        profile: &SourceProfile,
        extra_headers: &[(&str, &str)],
    ) -> Result<FetchedBody, FetchError> {
        let policy = RetryPolicy::for_profile(profile);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.rate_limiter
                .acquire(url, profile.rate_limit_delay())
                .await;

            match self.fetch_once(url, profile, extra_headers).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    let failure_type = classify_error(&e);
                    let retry_after_delay = if failure_type == FailureType::RateLimited {
                        self.extract_retry_after_delay(&e, url)
                    } else {
                        None
                    };

                    match policy.should_retry(failure_type, attempt) {
                        RetryDecision::Retry {
                            delay: backoff_delay,
                            attempt: next_attempt,
                        } => {
                            let delay = retry_after_delay.unwrap_or(backoff_delay);
                            info!(
                                url = %url,
                                attempt = next_attempt,
                                max_attempts = policy.max_attempts(),
                                delay_ms = delay.as_millis(),
                                using_retry_after = retry_after_delay.is_some(),
                                error = %e,
                                "retrying fetch"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(url = %url, %reason, attempts = attempt, "not retrying fetch");
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Single attempt: follows at most [`MAX_REDIRECTS`] hops.
    async fn fetch_once(
        &self,
        url: &str,
        profile: &SourceProfile,
        extra_headers: &[(&str, &str)],
    ) -> Result<FetchedBody, FetchError> {
        let client = if profile.requires_tls_bypass {
            &self.lenient
        } else {
            &self.strict
        };
        let timeout = profile.effective_timeout(self.options.base_timeout);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

        let mut current = Url::parse(url).map_err(|_| FetchError::invalid_url(url))?;
        let mut hops = 0usize;

        loop {
            // The semaphore is never closed, so a failed acquire cannot happen.
            let _permit = self.sockets.acquire().await.ok();

            let mut request = client.get(current.clone()).timeout(timeout);
            for (name, value) in &profile.required_headers {
                request = request.header(name.as_str(), value.as_str());
            }
            for (name, value) in extra_headers {
                request = request.header(*name, *value);
            }

            let response = request
                .send()
                .await
                .map_err(|e| FetchError::network(current.as_str(), e, timeout_ms))?;
            let status = response.status();

            if status.is_redirection()
                && let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
            {
                hops += 1;
                if hops > MAX_REDIRECTS {
                    return Err(FetchError::too_many_redirects(url, hops));
                }
                let next = current
                    .join(location)
                    .map_err(|_| FetchError::invalid_url(location))?;
                debug!(from = %current, to = %next, hops, "following redirect");
                current = next;
                continue;
            }

            if !status.is_success() {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                return Err(FetchError::http_status_with_retry_after(
                    current.as_str(),
                    status.as_u16(),
                    retry_after,
                ));
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let bytes = response
                .bytes()
                .await
                .map_err(|e| FetchError::network(current.as_str(), e, timeout_ms))?;

            return Ok(FetchedBody {
                bytes: bytes.to_vec(),
                content_type,
                final_url: current.to_string(),
            });
        }
    }

    /// Parses Retry-After from a 429 and records it with the pacing table.
    fn extract_retry_after_delay(&self, error: &FetchError, url: &str) -> Option<Duration> {
        let FetchError::HttpStatus {
            retry_after: Some(header),
            ..
        } = error
        else {
            return None;
        };
        let delay = parse_retry_after(header)?;
        self.rate_limiter.record_rate_limit(url, delay);
        debug!(url = %url, retry_after = %header, delay_ms = delay.as_millis(), "using Retry-After header delay");
        Some(delay)
    }
}

fn build_client(options: &ClientOptions, accept_invalid_certs: bool) -> Result<Client, FetchError> {
    Client::builder()
        .connect_timeout(options.connect_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .gzip(true)
        .cookie_store(true)
        .user_agent(BROWSER_USER_AGENT)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .map_err(|source| FetchError::ClientBuild { source })
}
