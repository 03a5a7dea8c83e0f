//! Legacy HTML adapter for e-manuscripta viewers.
//!
//! The viewer page carries a page selector whose options are
//! `<option value="ID">[N]</option>`; each ID maps to a cached 2000px
//! rendition. Option order is the presentation order. Block ids are not
//! monotonic across bindings and appended technical blocks, so nothing is
//! re-sorted.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, instrument};
use url::Url;

use super::utils::{compile_static_regex, html_title};
use super::{Adapter, AdapterContext, AdapterError};
use crate::manifest::{Manifest, PageDescriptor};

const DEFAULT_BASE_URL: &str = "https://www.e-manuscripta.ch";

static CONTENT_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"^/([^/]+)/content/(?:zoom|titleinfo|thumbview)/(\d+)")
});
static DOI_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"^/([^/]+)/doi/[^/]+/e-manuscripta-(\d+)"));
static PAGE_OPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"<option\s+value="(\d+)"[^>]*>\s*\[(\d+)\]\s*</option>"#)
});

/// Adapter for e-manuscripta.ch page-select viewers.
#[derive(Debug, Clone)]
pub struct EManuscriptaAdapter {
    base_url: String,
    base_host: String,
}

impl EManuscriptaAdapter {
    /// Adapter for the public e-manuscripta site.
    #[must_use]
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Adapter bound to another origin (mirrors and tests).
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let base_host = Url::parse(&base_url)
            .ok()
            .and_then(|url| {
                url.host_str().map(|host| match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                })
            })
            .unwrap_or_default();
        Self {
            base_url,
            base_host,
        }
    }

    fn host_matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let bare = |h: &str| h.strip_prefix("www.").unwrap_or(h).to_string();
        bare(&host) == bare(&self.base_host)
    }

    /// `(library, manuscript id)` from a viewer or DOI path.
    fn parse_path(url: &Url) -> Option<(String, String)> {
        CONTENT_PATH_RE
            .captures(url.path())
            .or_else(|| DOI_PATH_RE.captures(url.path()))
            .map(|caps| (caps[1].to_string(), caps[2].to_string()))
    }
}

impl Default for EManuscriptaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for EManuscriptaAdapter {
    fn name(&self) -> &'static str {
        "e-manuscripta"
    }

    fn can_handle(&self, url: &Url) -> bool {
        self.host_matches(url) && Self::parse_path(url).is_some()
    }

    #[instrument(skip(self, ctx), fields(adapter = "e-manuscripta", url = %url))]
    async fn resolve(&self, url: &Url, ctx: &AdapterContext) -> Result<Manifest, AdapterError> {
        let Some((library, manuscript_id)) = Self::parse_path(url) else {
            return Err(AdapterError::unsupported_source(url.as_str()));
        };

        let mut html = ctx.fetch_text(url.as_str()).await?;
        if needs_javascript_cookie(&html) {
            debug!("javascript check page, retrying with js_enabled cookie");
            html = ctx
                .fetch_text_with_headers(url.as_str(), &[("Cookie", "js_enabled=1")])
                .await?;
            if needs_javascript_cookie(&html) {
                return Err(AdapterError::unsupported_feature(
                    url.as_str(),
                    "a JavaScript verification step that a cookie does not satisfy",
                ));
            }
        }

        let options = page_options(&html);
        if options.is_empty() {
            return Err(AdapterError::parse(
                url.as_str(),
                "viewer page has no page selector",
            ));
        }

        let pages = options
            .into_iter()
            .enumerate()
            .map(|(index, (page_id, number))| {
                PageDescriptor::direct(
                    index,
                    format!("{}/{library}/download/webcache/2000/{page_id}", self.base_url),
                    format!("Page {number}"),
                )
            })
            .collect();

        let display_name = html_title(&html)
            .unwrap_or_else(|| format!("e-manuscripta {library} {manuscript_id}"));
        Manifest::new(url.as_str(), "e-manuscripta", display_name, pages)
            .map_err(|source| AdapterError::invalid(url.as_str(), source))
    }
}

fn needs_javascript_cookie(html: &str) -> bool {
    html.contains("js_enabled") && html.contains("js_check_beacon")
}

/// `(page id, page number)` in document order.
///
/// Viewers repeat the selector (top and bottom toolbars); only the first
/// occurrence of each id or page number is kept.
fn page_options(html: &str) -> Vec<(String, u32)> {
    let mut seen_ids = HashSet::new();
    let mut seen_numbers = HashSet::new();
    PAGE_OPTION_RE
        .captures_iter(html)
        .filter_map(|caps| {
            let id = caps[1].to_string();
            let number: u32 = caps[2].parse().ok()?;
            (seen_ids.insert(id.clone()) && seen_numbers.insert(number)).then_some((id, number))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_recognizes_viewer_and_doi_urls() {
        let adapter = EManuscriptaAdapter::new();
        for url in [
            "https://www.e-manuscripta.ch/bau/content/zoom/5157616",
            "https://www.e-manuscripta.ch/zuz/content/titleinfo/1460717",
            "https://www.e-manuscripta.ch/bau/doi/10.7891/e-manuscripta-54733",
        ] {
            assert!(adapter.can_handle(&Url::parse(url).unwrap()), "{url}");
        }
        assert!(!adapter.can_handle(&Url::parse("https://www.e-manuscripta.ch/about").unwrap()));
        assert!(!adapter.can_handle(
            &Url::parse("https://other.example/bau/content/zoom/5157616").unwrap()
        ));
    }

    #[test]
    fn test_page_options_keep_document_order_and_dedupe() {
        let html = r#"
            <select>
              <option value="5157616">[1] </option>
              <option value="5157620" selected="selected">[2]</option>
              <option value="5157231">[3] </option>
            </select>
            <select>
              <option value="5157616">[1] </option>
            </select>"#;
        assert_eq!(
            page_options(html),
            vec![
                ("5157616".to_string(), 1),
                ("5157620".to_string(), 2),
                ("5157231".to_string(), 3),
            ]
        );
    }

    #[test]
    fn test_javascript_check_detection() {
        assert!(needs_javascript_cookie(
            "<script>document.cookie='js_enabled=1'; fetch('/js_check_beacon')</script>"
        ));
        assert!(!needs_javascript_cookie("<title>Ms</title>"));
    }

    #[test]
    fn test_base_url_override_matches_port() {
        let adapter = EManuscriptaAdapter::with_base_url("http://127.0.0.1:8080/");
        assert!(adapter.can_handle(
            &Url::parse("http://127.0.0.1:8080/bau/content/zoom/1").unwrap()
        ));
        assert!(!adapter.can_handle(
            &Url::parse("http://127.0.0.1:9090/bau/content/zoom/1").unwrap()
        ));
    }
}
