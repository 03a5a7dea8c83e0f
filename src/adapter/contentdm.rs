//! `ContentDM` compound-object adapter.
//!
//! `ContentDM` viewers (`/digital/collection/{alias}/id/{id}`) embed the item
//! state as `window.__INITIAL_STATE__`, either as a `JSON.parse("...")`
//! string or a literal object. A child page carries its siblings under
//! `item.item.parent.children`; a compound root carries `item.children`.
//! When the state is missing the `dmGetCompoundObjectInfo` web service is
//! used instead. Every page maps to the site's IIIF image endpoint.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use super::utils::{compile_static_regex, iiif_image_url};
use super::{Adapter, AdapterContext, AdapterError};
use crate::manifest::{Manifest, PageDescriptor};

static ITEM_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"^/digital/collection/([^/]+)/id/(\d+)"));
static STATE_STRING_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"window\.__INITIAL_STATE__\s*=\s*JSON\.parse\("((?:[^"\\]|\\.)*)"\)"#)
});
static STATE_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"window\.__INITIAL_STATE__\s*=\s*\{"));

/// Binding and calibration shots that are not manuscript pages.
const EXCLUDED_TITLE_MARKERS: &[&str] = &[
    "color chart",
    "dorso",
    "piatto",
    "controguardia",
    "guardia anteriore",
    "guardia posteriore",
];

/// Adapter for `ContentDM` hosted collections.
#[derive(Debug, Default)]
pub struct ContentDmAdapter;

impl ContentDmAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChildPage {
    id: String,
    title: String,
}

#[async_trait]
impl Adapter for ContentDmAdapter {
    fn name(&self) -> &'static str {
        "contentdm"
    }

    fn can_handle(&self, url: &Url) -> bool {
        ITEM_PATH_RE.is_match(url.path())
    }

    #[instrument(skip(self, ctx), fields(adapter = "contentdm", url = %url))]
    async fn resolve(&self, url: &Url, ctx: &AdapterContext) -> Result<Manifest, AdapterError> {
        let Some(caps) = ITEM_PATH_RE.captures(url.path()) else {
            return Err(AdapterError::unsupported_source(url.as_str()));
        };
        let collection = caps[1].to_string();
        let item_id = caps[2].to_string();
        let origin = url.origin().ascii_serialization();

        let html = ctx.fetch_text(url.as_str()).await?;
        let (title, children) = match extract_state(&html) {
            Some(state) => pages_from_state(&state, &item_id)
                .ok_or_else(|| AdapterError::parse(url.as_str(), "page state has no item data"))?,
            None => {
                debug!("no embedded state, falling back to compound object service");
                let api = format!(
                    "{origin}/digital/bl/dmwebservices/index.php?q=dmGetCompoundObjectInfo/{collection}/{item_id}/json"
                );
                let info = ctx.fetch_json(&api).await?;
                (None, pages_from_compound_info(&info, &item_id))
            }
        };

        let children: Vec<ChildPage> = children
            .into_iter()
            .filter(|child| !is_excluded(&child.title))
            .collect();
        if children.is_empty() {
            return Err(AdapterError::parse(url.as_str(), "compound object has no pages"));
        }

        let profile = ctx.profile_for(url.as_str());
        let pages = children
            .into_iter()
            .enumerate()
            .map(|(index, child)| {
                let service = format!("{origin}/iiif/2/{collection}:{}", child.id);
                PageDescriptor::direct(
                    index,
                    iiif_image_url(&service, false, profile.max_image_dimension, None),
                    child.title,
                )
            })
            .collect();

        let display_name = title.unwrap_or_else(|| format!("{collection} {item_id}"));
        Manifest::new(url.as_str(), "contentdm", display_name, pages)
            .map_err(|source| AdapterError::invalid(url.as_str(), source))
    }
}

fn is_excluded(title: &str) -> bool {
    let lower = title.to_lowercase();
    EXCLUDED_TITLE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Reads `window.__INITIAL_STATE__` in either of its two encodings.
fn extract_state(html: &str) -> Option<Value> {
    if let Some(caps) = STATE_STRING_RE.captures(html) {
        // The payload is a JS string literal; JSON string rules cover its escapes.
        let decoded: String = serde_json::from_str(&format!("\"{}\"", &caps[1])).ok()?;
        return serde_json::from_str(&decoded).ok();
    }
    let found = STATE_OBJECT_RE.find(html)?;
    let rest = &html[found.end() - 1..];
    serde_json::Deserializer::from_str(rest)
        .into_iter::<Value>()
        .next()
        .and_then(Result::ok)
}

fn field_value<'a>(fields: Option<&'a Value>, keys: &[&str]) -> Option<&'a str> {
    fields?.as_array()?.iter().find_map(|field| {
        let key = field.get("key").and_then(Value::as_str)?;
        if !keys.contains(&key) {
            return None;
        }
        field
            .get("value")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    })
}

/// Title from `subjec`, `identi` or `title`/`titlea` metadata fields.
fn title_from_fields(fields: Option<&Value>) -> Option<String> {
    let subject = field_value(fields, &["subjec"]);
    let title = field_value(fields, &["title", "titlea"]);
    if let Some(subject) = subject {
        return Some(match title {
            Some(title) => {
                let short: String = title
                    .split('.')
                    .next()
                    .unwrap_or(title)
                    .chars()
                    .take(50)
                    .collect();
                format!("{subject} - {short}")
            }
            None => subject.to_string(),
        });
    }
    field_value(fields, &["identi"])
        .map(str::to_string)
        .or_else(|| title.map(|t| t.chars().take(80).collect()))
}

fn children_of(value: &Value) -> Vec<ChildPage> {
    let mut pages = Vec::new();
    if let Some(children) = value.as_array() {
        for child in children {
            // Nested compound objects list their own children.
            if let Some(nested) = child.get("children").filter(|c| c.is_array())
                && nested.as_array().is_some_and(|c| !c.is_empty())
            {
                pages.extend(children_of(nested));
                continue;
            }
            let Some(id) = child.get("id").and_then(scalar_to_string) else {
                continue;
            };
            let title = child
                .get("title")
                .and_then(Value::as_str)
                .map_or_else(|| format!("Page {id}"), str::to_string);
            pages.push(ChildPage { id, title });
        }
    }
    pages
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn pages_from_state(state: &Value, item_id: &str) -> Option<(Option<String>, Vec<ChildPage>)> {
    let item_state = state.get("item")?;
    let item = item_state.get("item")?;

    let parent_id = item.get("parentId").and_then(Value::as_i64).unwrap_or(-1);
    if parent_id != -1
        && let Some(parent) = item.get("parent")
    {
        return Some((
            title_from_fields(parent.get("fields")),
            children_of(parent.get("children")?),
        ));
    }

    let children = item_state.get("children").map(children_of).unwrap_or_default();
    if !children.is_empty() {
        return Some((title_from_fields(item.get("fields")), children));
    }

    let title = item
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some((
        title.clone(),
        vec![ChildPage {
            id: item_id.to_string(),
            title: title.unwrap_or_else(|| "Page 1".to_string()),
        }],
    ))
}

/// Walks `dmGetCompoundObjectInfo` output (`node` trees and `page` lists).
fn pages_from_compound_info(info: &Value, item_id: &str) -> Vec<ChildPage> {
    fn walk(node: &Value, out: &mut Vec<ChildPage>) {
        match node {
            Value::Array(items) => items.iter().for_each(|item| walk(item, out)),
            Value::Object(map) => {
                if let Some(id) = map.get("pageptr").and_then(scalar_to_string) {
                    let title = map
                        .get("pagetitle")
                        .and_then(Value::as_str)
                        .map_or_else(|| format!("Page {id}"), str::to_string);
                    out.push(ChildPage { id, title });
                    return;
                }
                for key in ["node", "page"] {
                    if let Some(child) = map.get(key) {
                        walk(child, out);
                    }
                }
            }
            _ => {}
        }
    }

    let mut pages = Vec::new();
    walk(info, &mut pages);
    if pages.is_empty() {
        pages.push(ChildPage {
            id: item_id.to_string(),
            title: "Page 1".to_string(),
        });
    }
    pages
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_matches_item_paths_only() {
        let adapter = ContentDmAdapter::new();
        assert!(adapter.can_handle(
            &Url::parse("https://cdm21059.contentdm.oclc.org/digital/collection/plutei/id/317515")
                .unwrap()
        ));
        assert!(!adapter.can_handle(
            &Url::parse("https://cdm21059.contentdm.oclc.org/digital/collection/plutei").unwrap()
        ));
    }

    #[test]
    fn test_escaped_state_is_decoded() {
        let html = r#"<script>window.__INITIAL_STATE__ = JSON.parse("{\"item\":{\"item\":{\"parentId\":-1,\"title\":\"Solo\"}}}");</script>"#;
        let state = extract_state(html).unwrap();
        assert_eq!(state["item"]["item"]["title"], "Solo");
    }

    #[test]
    fn test_object_state_is_decoded() {
        let html = r#"<script>window.__INITIAL_STATE__ = {"item":{"item":{"parentId":-1}},"x":"};"};</script>"#;
        let state = extract_state(html).unwrap();
        assert_eq!(state["x"], "};");
    }

    #[test]
    fn test_child_page_uses_parent_siblings_and_filters_binding() {
        let state = json!({"item": {"item": {
            "parentId": 100,
            "parent": {
                "fields": [
                    {"key": "subjec", "value": "Plut. 16.39"},
                    {"key": "title", "value": "Evangelia. Codex membranaceus"}
                ],
                "children": [
                    {"id": 11, "title": "Piatto anteriore"},
                    {"id": 12, "title": "c. 1r"},
                    {"id": 10, "title": "c. 1v"},
                    {"id": 13, "title": "Color chart"}
                ]
            }
        }}});
        let (title, pages) = pages_from_state(&state, "12").unwrap();
        assert_eq!(title.as_deref(), Some("Plut. 16.39 - Evangelia"));
        let kept: Vec<ChildPage> = pages.into_iter().filter(|p| !is_excluded(&p.title)).collect();
        let ids: Vec<&str> = kept.iter().map(|p| p.id.as_str()).collect();
        // Source order is kept even though ids are not monotonic.
        assert_eq!(ids, vec!["12", "10"]);
    }

    #[test]
    fn test_root_children_and_single_page() {
        let state = json!({"item": {
            "item": {"parentId": -1, "fields": [{"key": "identi", "value": "Ms. 5"}]},
            "children": [{"id": "1", "title": "f. 1"}, {"id": "2", "children": [{"id": "3", "title": "f. 3"}]}]
        }});
        let (title, pages) = pages_from_state(&state, "9").unwrap();
        assert_eq!(title.as_deref(), Some("Ms. 5"));
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].id, "3");

        let single = json!({"item": {"item": {"parentId": -1, "title": "Charter"}}});
        let (title, pages) = pages_from_state(&single, "77").unwrap();
        assert_eq!(title.as_deref(), Some("Charter"));
        assert_eq!(pages, vec![ChildPage { id: "77".into(), title: "Charter".into() }]);
    }

    #[test]
    fn test_compound_info_walks_nodes_and_pages() {
        let info = json!({"type": "Monograph", "node": {"node": [
            {"nodetitle": "Quire 1", "page": [{"pagetitle": "1r", "pageptr": "501"}, {"pagetitle": "1v", "pageptr": "502"}]},
            {"nodetitle": "Quire 2", "page": {"pagetitle": "2r", "pageptr": "503"}}
        ]}});
        let pages = pages_from_compound_info(&info, "500");
        let ids: Vec<&str> = pages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["501", "502", "503"]);
        assert_eq!(pages_from_compound_info(&json!({"code": "-2"}), "9")[0].id, "9");
    }
}
