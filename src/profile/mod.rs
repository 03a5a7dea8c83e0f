//! Per-origin behavioral profiles.
//!
//! A [`SourceProfile`] is pure data: how many concurrent requests an origin
//! tolerates, how long to wait for it, how to back off, which headers it
//! insists on, and whether its certificate chain is broken. Profiles are
//! selected by first-match regex over the full URL, so more specific
//! patterns must be registered before general ones.
//!
//! The [`ProfileRegistry`] is built once at startup (built-in table plus any
//! `[[profiles]]` entries from the config file) and shared by `Arc`.
//!
//! # Example
//!
//! ```
//! use manuscript_core::profile::ProfileRegistry;
//!
//! let registry = ProfileRegistry::builtin().unwrap();
//! let profile = registry.select("https://nbm.regione.veneto.it/Generale/BibliotecaDigitale/caricaVolumi.html");
//! assert!(profile.requires_tls_bypass);
//! ```

mod builtin;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

pub use builtin::builtin_profiles;

/// Lowest per-origin concurrency accepted.
pub const MIN_CONCURRENCY: usize = 1;

/// Highest per-origin concurrency accepted.
pub const MAX_CONCURRENCY: usize = 16;

/// Concurrency used when no profile says otherwise.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Pages shorter than this are treated as placeholder responses.
pub const MIN_VALID_PAGE_BYTES: u64 = 1024;

/// Upper bound on attempts any profile may request.
pub const MAX_ATTEMPTS_CEILING: u32 = 15;

/// Errors raised while building the registry.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// A profile's origin pattern is not a valid regex.
    #[error("profile '{name}' has an invalid origin pattern '{pattern}': {source}")]
    InvalidPattern {
        /// Profile name.
        name: String,
        /// The rejected pattern.
        pattern: String,
        /// Regex compile error.
        #[source]
        source: regex::Error,
    },

    /// A numeric field is outside its accepted range.
    #[error("profile '{name}': {field} {reason}")]
    InvalidValue {
        /// Profile name.
        name: String,
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Tuning parameters for one family of origins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceProfile {
    /// Short name used in logs.
    pub name: String,
    /// Regex matched against the full URL.
    pub origin_pattern: String,
    /// Concurrent page fetches allowed against this origin.
    pub max_concurrency: usize,
    /// Absolute per-request timeout; overrides the engine base timeout.
    pub timeout_ms: Option<u64>,
    /// Multiplier applied to the request timeout.
    pub timeout_multiplier: f64,
    /// Explicit backoff schedule; empty means exponential defaults.
    pub retry_backoff_ms: Vec<u64>,
    /// Attempts per request including the first.
    pub max_attempts: u32,
    /// Accept invalid certificate chains for this origin only.
    pub requires_tls_bypass: bool,
    /// Headers sent with every request (`Referer`, `Accept`, ...).
    pub required_headers: BTreeMap<String, String>,
    /// Minimum spacing between requests to the same host.
    pub rate_limit_delay_ms: u64,
    /// Bodies shorter than this are rejected as placeholders.
    pub min_page_bytes: u64,
    /// Exact body lengths of known "image unavailable" responses.
    pub placeholder_sizes: Vec<u64>,
    /// Largest image edge the origin serves reliably.
    pub max_image_dimension: Option<u32>,
    /// Reconstruct pages from tiles instead of asking for a full image.
    pub prefer_tiles: bool,
}

impl Default for SourceProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            origin_pattern: ".*".to_string(),
            max_concurrency: DEFAULT_CONCURRENCY,
            timeout_ms: None,
            timeout_multiplier: 1.0,
            retry_backoff_ms: Vec::new(),
            max_attempts: 3,
            requires_tls_bypass: false,
            required_headers: BTreeMap::new(),
            rate_limit_delay_ms: 0,
            min_page_bytes: MIN_VALID_PAGE_BYTES,
            placeholder_sizes: Vec::new(),
            max_image_dimension: None,
            prefer_tiles: false,
        }
    }
}

impl SourceProfile {
    /// Creates a profile with defaults for everything but name and pattern.
    #[must_use]
    pub fn new(name: impl Into<String>, origin_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin_pattern: origin_pattern.into(),
            ..Self::default()
        }
    }

    /// Request timeout for this origin given the engine's base timeout.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn effective_timeout(&self, base: Duration) -> Duration {
        let base = self.timeout_ms.map_or(base, Duration::from_millis);
        let scaled_ms = base.as_millis() as f64 * self.timeout_multiplier;
        Duration::from_millis(scaled_ms.round() as u64)
    }

    /// Worker count for a job against this origin.
    ///
    /// A caller override can only lower the profile limit, never raise it
    /// past what the origin tolerates.
    #[must_use]
    pub fn effective_concurrency(&self, override_value: Option<usize>) -> usize {
        let limit = self.max_concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        override_value.map_or(limit, |value| value.clamp(MIN_CONCURRENCY, limit))
    }

    /// Minimum spacing between requests to the same host.
    #[must_use]
    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    fn validate(&self) -> Result<(), ProfileError> {
        let invalid = |field: &'static str, reason: String| ProfileError::InvalidValue {
            name: self.name.clone(),
            field,
            reason,
        };
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.max_concurrency) {
            return Err(invalid(
                "max_concurrency",
                format!(
                    "must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}, got {}",
                    self.max_concurrency
                ),
            ));
        }
        if !(self.timeout_multiplier > 0.0 && self.timeout_multiplier <= 20.0) {
            return Err(invalid(
                "timeout_multiplier",
                format!("must be in (0, 20], got {}", self.timeout_multiplier),
            ));
        }
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS_CEILING {
            return Err(invalid(
                "max_attempts",
                format!(
                    "must be between 1 and {MAX_ATTEMPTS_CEILING}, got {}",
                    self.max_attempts
                ),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(invalid("timeout_ms", "must be positive".to_string()));
        }
        Ok(())
    }
}

struct CompiledProfile {
    pattern: Regex,
    profile: Arc<SourceProfile>,
}

/// Immutable first-match table of profiles.
pub struct ProfileRegistry {
    entries: Vec<CompiledProfile>,
    fallback: Arc<SourceProfile>,
}

impl ProfileRegistry {
    /// Builds a registry from profiles in match order.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError`] if a pattern fails to compile or a value is
    /// out of range.
    #[instrument(skip(profiles), fields(count = profiles.len()))]
    pub fn new(profiles: Vec<SourceProfile>) -> Result<Self, ProfileError> {
        let mut entries = Vec::with_capacity(profiles.len());
        for profile in profiles {
            profile.validate()?;
            let pattern =
                Regex::new(&profile.origin_pattern).map_err(|source| ProfileError::InvalidPattern {
                    name: profile.name.clone(),
                    pattern: profile.origin_pattern.clone(),
                    source,
                })?;
            entries.push(CompiledProfile {
                pattern,
                profile: Arc::new(profile),
            });
        }
        Ok(Self {
            entries,
            fallback: Arc::new(SourceProfile::default()),
        })
    }

    /// Registry containing only the built-in profile table.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError`] if the built-in table is malformed.
    pub fn builtin() -> Result<Self, ProfileError> {
        Self::new(builtin_profiles())
    }

    /// User profiles first, then the built-in table.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError`] if any profile is malformed.
    pub fn with_overrides(overrides: Vec<SourceProfile>) -> Result<Self, ProfileError> {
        let mut profiles = overrides;
        profiles.extend(builtin_profiles());
        Self::new(profiles)
    }

    /// Returns the first profile whose pattern matches `url`, or the default.
    #[must_use]
    pub fn select(&self, url: &str) -> Arc<SourceProfile> {
        let selected = self
            .entries
            .iter()
            .find(|entry| entry.pattern.is_match(url))
            .map_or_else(|| Arc::clone(&self.fallback), |entry| Arc::clone(&entry.profile));
        debug!(url, profile = %selected.name, "selected source profile");
        selected
    }

    /// Number of registered profiles (excluding the fallback).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if only the fallback profile is available.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self
            .entries
            .iter()
            .map(|entry| entry.profile.name.as_str())
            .collect();
        f.debug_struct("ProfileRegistry")
            .field("profiles", &names)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match_wins() {
        let mut specific = SourceProfile::new("specific", r"^https://example\.org/slow/");
        specific.max_concurrency = 2;
        let general = SourceProfile::new("general", r"^https://example\.org/");
        let registry = ProfileRegistry::new(vec![specific, general]).unwrap();

        assert_eq!(registry.select("https://example.org/slow/1").name, "specific");
        assert_eq!(registry.select("https://example.org/fast/1").name, "general");
        assert_eq!(registry.select("https://other.org/").name, "default");
    }

    #[test]
    fn test_override_precedes_builtin() {
        let mut custom = SourceProfile::new("custom-verona", r"nbm\.regione\.veneto\.it");
        custom.max_concurrency = 1;
        let registry = ProfileRegistry::with_overrides(vec![custom]).unwrap();
        let selected = registry.select("https://nbm.regione.veneto.it/x");
        assert_eq!(selected.name, "custom-verona");
        assert_eq!(selected.max_concurrency, 1);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let broken = SourceProfile::new("broken", "(unclosed");
        let err = ProfileRegistry::new(vec![broken]).unwrap_err();
        assert!(matches!(err, ProfileError::InvalidPattern { .. }));
    }

    #[test]
    fn test_out_of_range_concurrency_rejected() {
        let mut profile = SourceProfile::new("greedy", "x");
        profile.max_concurrency = 64;
        let err = ProfileRegistry::new(vec![profile]).unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));
    }

    #[test]
    fn test_effective_timeout_applies_multiplier() {
        let mut profile = SourceProfile::default();
        profile.timeout_multiplier = 3.0;
        assert_eq!(
            profile.effective_timeout(Duration::from_secs(30)),
            Duration::from_secs(90)
        );

        profile.timeout_ms = Some(10_000);
        profile.timeout_multiplier = 1.5;
        assert_eq!(
            profile.effective_timeout(Duration::from_secs(30)),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_override_only_lowers_concurrency() {
        let mut profile = SourceProfile::default();
        profile.max_concurrency = 3;
        assert_eq!(profile.effective_concurrency(None), 3);
        assert_eq!(profile.effective_concurrency(Some(8)), 3);
        assert_eq!(profile.effective_concurrency(Some(2)), 2);
        assert_eq!(profile.effective_concurrency(Some(0)), 1);
    }

    #[test]
    fn test_builtin_table_is_valid() {
        let registry = ProfileRegistry::builtin().unwrap();
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_profile_deserializes_with_defaults() {
        let profile: SourceProfile = serde_json::from_str(
            r#"{"name": "slow", "origin_pattern": "slow\\.example", "timeout_multiplier": 4.0}"#,
        )
        .unwrap();
        assert_eq!(profile.max_concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(profile.min_page_bytes, MIN_VALID_PAGE_BYTES);
        assert!((profile.timeout_multiplier - 4.0).abs() < f64::EPSILON);
    }
}
