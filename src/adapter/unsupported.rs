//! Known sources that cannot be downloaded without a real browser.
//!
//! Matching them explicitly gives users an actionable
//! `UnsupportedFeature` instead of a generic "no adapter" error.

use async_trait::async_trait;
use url::Url;

use super::{Adapter, AdapterContext, AdapterError};
use crate::manifest::Manifest;

/// Host suffix and the capability it requires.
const BROWSER_ONLY_SOURCES: &[(&str, &str)] = &[(
    "cecilia.mediatheques.grand-albigeois.fr",
    "browser automation to render its viewer",
)];

/// Adapter that rejects browser-only sources with a clear message.
#[derive(Debug, Default)]
pub struct UnsupportedAdapter;

impl UnsupportedAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn requirement(url: &Url) -> Option<&'static str> {
        let host = url.host_str()?;
        BROWSER_ONLY_SOURCES
            .iter()
            .find(|(suffix, _)| host == *suffix || host.ends_with(&format!(".{suffix}")))
            .map(|(_, feature)| *feature)
    }
}

#[async_trait]
impl Adapter for UnsupportedAdapter {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn can_handle(&self, url: &Url) -> bool {
        Self::requirement(url).is_some()
    }

    async fn resolve(&self, url: &Url, _ctx: &AdapterContext) -> Result<Manifest, AdapterError> {
        let feature = Self::requirement(url).unwrap_or("a capability that is not implemented");
        Err(AdapterError::unsupported_feature(url.as_str(), feature))
    }
}
