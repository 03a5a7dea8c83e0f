//! Ordered adapter registry.
//!
//! Adapters are consulted in registration order and the first one whose
//! `can_handle` accepts the URL resolves it. Patterns are expected not to
//! overlap; ordering only matters for the generic IIIF fallback, which is
//! registered last.

use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{Adapter, AdapterContext, AdapterError};
use crate::manifest::Manifest;

/// Immutable, ordered collection of adapters.
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn Adapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Appends an adapter; earlier registrations win.
    #[instrument(skip(self, adapter), fields(adapter_name = adapter.name()))]
    pub fn register(&mut self, adapter: Box<dyn Adapter>) {
        debug!("registering adapter");
        self.adapters.push(adapter);
    }

    /// Number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Returns true if no adapters are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// The adapter that would handle `url`, if any.
    #[must_use]
    pub fn find_handler(&self, url: &Url) -> Option<&dyn Adapter> {
        self.adapters
            .iter()
            .find(|adapter| adapter.can_handle(url))
            .map(AsRef::as_ref)
    }

    /// Resolves a viewer URL into a validated manifest.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::UnsupportedSource`] if nothing matches, or
    /// whatever the matching adapter reports.
    #[instrument(skip(self, ctx), fields(adapter))]
    pub async fn resolve(&self, url: &str, ctx: &AdapterContext) -> Result<Manifest, AdapterError> {
        let parsed = Url::parse(url.trim()).map_err(|_| AdapterError::unsupported_source(url))?;
        let Some(adapter) = self.find_handler(&parsed) else {
            return Err(AdapterError::unsupported_source(url));
        };
        tracing::Span::current().record("adapter", adapter.name());

        match adapter.resolve(&parsed, ctx).await {
            Ok(manifest) => {
                manifest
                    .validate()
                    .map_err(|source| AdapterError::invalid(url, source))?;
                info!(
                    adapter = adapter.name(),
                    pages = manifest.total_pages,
                    title = %manifest.display_name,
                    "manifest resolved"
                );
                Ok(manifest)
            }
            Err(error) => {
                warn!(adapter = adapter.name(), error = %error, "manifest resolution failed");
                Err(error)
            }
        }
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.adapters.iter().map(|a| a.name()).collect();
        f.debug_struct("AdapterRegistry")
            .field("adapters", &names)
            .finish()
    }
}
