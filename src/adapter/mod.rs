//! Protocol adapters: viewer URL in, canonical [`Manifest`] out.
//!
//! # Architecture
//!
//! - [`Adapter`] - async trait each source family implements
//! - [`AdapterRegistry`] - ordered first-match collection
//! - [`AdapterContext`] - profile-aware fetch helpers handed to adapters
//! - [`IiifAdapter`] - IIIF Presentation v2/v3 with a viewer-URL rule table
//! - [`ContentDmAdapter`] - `ContentDM` compound objects
//! - [`EManuscriptaAdapter`] - legacy HTML page-select scraping
//! - [`DeepZoomAdapter`] - `.dzi` descriptors (single tiled page)
//! - [`UnsupportedAdapter`] - known sources that need a real browser
//!
//! Adding a library is a registration (a rule, a profile, or a new
//! adapter), not an edit to shared control flow.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use manuscript_core::adapter::{AdapterContext, build_default_adapter_registry};
//! use manuscript_core::http::{ClientOptions, ResilientClient};
//! use manuscript_core::profile::ProfileRegistry;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = AdapterContext::new(
//!     ResilientClient::new(ClientOptions::default())?,
//!     Arc::new(ProfileRegistry::builtin()?),
//! );
//! let registry = build_default_adapter_registry(Vec::new());
//! let manifest = registry
//!     .resolve("https://digi.vatlib.it/view/MSS_Vat.lat.3225", &ctx)
//!     .await?;
//! println!("{} pages", manifest.total_pages);
//! # Ok(())
//! # }
//! ```

mod contentdm;
mod deepzoom;
mod error;
mod html;
mod iiif;
mod registry;
mod unsupported;
mod utils;

pub use contentdm::ContentDmAdapter;
pub use deepzoom::DeepZoomAdapter;
pub use error::AdapterError;
pub use html::EManuscriptaAdapter;
pub use iiif::{IiifAdapter, ManifestRule};
pub use registry::AdapterRegistry;
pub use unsupported::UnsupportedAdapter;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::http::ResilientClient;
use crate::manifest::Manifest;
use crate::profile::{ProfileRegistry, SourceProfile};

/// Builds the default adapter registry.
///
/// `extra_iiif_rules` come from the config file and are tried before the
/// built-in viewer rules.
#[must_use]
pub fn build_default_adapter_registry(extra_iiif_rules: Vec<ManifestRule>) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(Box::new(UnsupportedAdapter::new()));
    registry.register(Box::new(EManuscriptaAdapter::new()));
    registry.register(Box::new(ContentDmAdapter::new()));
    registry.register(Box::new(DeepZoomAdapter::new()));
    registry.register(Box::new(IiifAdapter::with_extra_rules(extra_iiif_rules)));
    registry
}

/// A source family that can turn URLs into manifests.
///
/// Uses `async_trait` so adapters can be stored as `Box<dyn Adapter>`.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Cheap, offline check of whether this adapter owns `url`.
    fn can_handle(&self, url: &Url) -> bool;

    /// Fetches bootstrap documents and extracts the page list.
    async fn resolve(&self, url: &Url, ctx: &AdapterContext) -> Result<Manifest, AdapterError>;
}

/// Fetch helpers with profile selection and challenge detection built in.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    client: ResilientClient,
    profiles: Arc<ProfileRegistry>,
}

impl AdapterContext {
    /// Creates a context over a shared client and profile table.
    #[must_use]
    pub fn new(client: ResilientClient, profiles: Arc<ProfileRegistry>) -> Self {
        Self { client, profiles }
    }

    /// Profile governing requests to `url`.
    #[must_use]
    pub fn profile_for(&self, url: &str) -> Arc<SourceProfile> {
        self.profiles.select(url)
    }

    /// Fetches a document as text.
    ///
    /// # Errors
    ///
    /// [`AdapterError::Fetch`] on transport failure,
    /// [`AdapterError::UnsupportedFeature`] for anti-bot challenge pages.
    pub async fn fetch_text(&self, url: &str) -> Result<String, AdapterError> {
        self.fetch_text_with_headers(url, &[]).await
    }

    /// Fetches a document as text with extra request headers.
    ///
    /// # Errors
    ///
    /// See [`fetch_text`](Self::fetch_text).
    pub async fn fetch_text_with_headers(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<String, AdapterError> {
        let profile = self.profile_for(url);
        let body = self
            .client
            .fetch_with_headers(url, &profile, headers)
            .await
            .map_err(|source| AdapterError::fetch(url, source))?;
        let text = body.text();
        if utils::is_challenge_page(&text) {
            return Err(AdapterError::unsupported_feature(
                url,
                "solving a proof-of-work browser challenge",
            ));
        }
        Ok(text)
    }

    /// Fetches and parses a JSON document.
    ///
    /// # Errors
    ///
    /// See [`fetch_text`](Self::fetch_text); malformed JSON is
    /// [`AdapterError::ManifestParse`].
    pub async fn fetch_json(&self, url: &str) -> Result<Value, AdapterError> {
        let text = self.fetch_text(url).await?;
        serde_json::from_str(&text)
            .map_err(|e| AdapterError::parse(url, format!("response is not valid JSON: {e}")))
    }
}
