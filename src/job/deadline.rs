//! Automatic job deadlines for callers that pass none.

use std::time::Duration;

use crate::profile::SourceProfile;

/// Deadline for a job of up to 200 pages on a profile with multiplier 1.
pub const BASE_JOB_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// Job deadline scaled by page count and the profile's timeout multiplier.
///
/// More than 300 pages triples the base, more than 200 doubles it.
#[must_use]
pub fn auto_deadline(pages: usize, profile: &SourceProfile) -> Duration {
    let size_factor = match pages {
        p if p > 300 => 3.0,
        p if p > 200 => 2.0,
        _ => 1.0,
    };
    BASE_JOB_DEADLINE.mul_f64(size_factor * profile.timeout_multiplier)
}
