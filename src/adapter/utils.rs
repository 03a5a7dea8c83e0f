//! Shared helpers for adapters: static regexes, label flattening, URL joining
//! and challenge-page detection.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use url::Url;

/// Compiles a regex at static init; panics on invalid pattern.
pub fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<title[^>]*>([^<]+)</title>"));

/// Returns true if `html` is a proof-of-work anti-bot interstitial.
///
/// These pages only let a client through after running their script, which
/// we do not do.
#[must_use]
pub fn is_challenge_page(html: &str) -> bool {
    html.contains("id=\"anubis_challenge\"")
        || html.contains("anubis_version")
        || (html.contains("Anubis") && html.contains("Making sure you&#39;re not a bot"))
}

/// Extracts and unescapes the document `<title>`.
#[must_use]
pub fn html_title(html: &str) -> Option<String> {
    TITLE_RE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| decode_entities(m.as_str().trim()))
        .filter(|title| !title.is_empty())
}

/// Decodes the handful of HTML entities that appear in viewer titles.
#[must_use]
pub fn decode_entities(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Flattens a IIIF label into plain text.
///
/// Handles plain strings, v3 language maps (`{"en": ["..."]}`, preferring
/// `en`, then `none`, then any language), v2 `@value` objects, and arrays
/// of any of these.
#[must_use]
pub fn label_to_string(label: &Value) -> Option<String> {
    match label {
        Value::String(text) => Some(text.trim().to_string()).filter(|t| !t.is_empty()),
        Value::Array(items) => items.iter().find_map(label_to_string),
        Value::Object(map) => {
            if let Some(value) = map.get("@value") {
                return label_to_string(value);
            }
            ["en", "none"]
                .iter()
                .find_map(|lang| map.get(*lang).and_then(label_to_string))
                .or_else(|| map.values().find_map(label_to_string))
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Reads a JSON-LD identifier (`@id` in v2, `id` in v3).
#[must_use]
pub fn json_id(value: &Value) -> Option<&str> {
    value
        .get("@id")
        .or_else(|| value.get("id"))
        .and_then(Value::as_str)
}

/// Returns the first element if `value` is an array, otherwise `value` itself.
#[must_use]
pub fn first_or_self(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.first(),
        Value::Null => None,
        other => Some(other),
    }
}

/// Resolves a possibly relative URL string against a base URL.
#[must_use]
pub fn absolutize_url(value: &str, base_url: &Url) -> Option<String> {
    if value.starts_with("http://") || value.starts_with("https://") {
        return Some(value.to_string());
    }
    if value.starts_with("//") {
        return Some(format!("https:{value}"));
    }
    base_url.join(value).ok().map(|url| url.to_string())
}

/// IIIF Image API size segment for the largest safe rendition.
///
/// Without a ceiling, or when the image is known to fit under it, the
/// native maximum is requested (`max` for v3 services, `full` for v2).
/// Otherwise the width is bounded by the ceiling.
#[must_use]
pub fn iiif_size_segment(v3: bool, ceiling: Option<u32>, native_width: Option<u32>) -> String {
    let native = if v3 { "max" } else { "full" };
    match (ceiling, native_width) {
        (Some(limit), Some(width)) if width <= limit => native.to_string(),
        (Some(limit), _) => format!("{limit},"),
        (None, _) => native.to_string(),
    }
}

/// Full-image URL for a IIIF image service base.
#[must_use]
pub fn iiif_image_url(service: &str, v3: bool, ceiling: Option<u32>, width: Option<u32>) -> String {
    format!(
        "{}/full/{}/0/default.jpg",
        service.trim_end_matches('/'),
        iiif_size_segment(v3, ceiling, width)
    )
}
