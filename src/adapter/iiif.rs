//! IIIF Presentation API adapter (v2 and v3).
//!
//! Handles direct manifest URLs and, through a rule table, viewer URLs of
//! libraries whose manifest location can be derived from the viewer path.
//! A rule is a regex over the full viewer URL plus a `$1`-style template.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use super::utils::{
    compile_static_regex, first_or_self, iiif_image_url, json_id, label_to_string,
};
use super::{Adapter, AdapterContext, AdapterError};
use crate::manifest::{Manifest, PageDescriptor, TileGrid, TileLevel};
use crate::profile::SourceProfile;

/// Maps a viewer URL to its IIIF manifest URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRule {
    /// Library identifier recorded on the manifest.
    pub library: String,
    /// Regex matched against the full viewer URL.
    pub pattern: String,
    /// Manifest URL with `$1`, `$2`, ... capture references.
    pub template: String,
}

impl ManifestRule {
    /// Creates a rule.
    #[must_use]
    pub fn new(
        library: impl Into<String>,
        pattern: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            library: library.into(),
            pattern: pattern.into(),
            template: template.into(),
        }
    }
}

/// Viewer rules for libraries that publish IIIF behind a viewer page.
fn builtin_rules() -> Vec<ManifestRule> {
    vec![
        ManifestRule::new(
            "bodleian",
            r"^https?://digital\.bodleian\.ox\.ac\.uk/objects/([0-9a-fA-F-]{36})",
            "https://iiif.bodleian.ox.ac.uk/iiif/manifest/$1.json",
        ),
        ManifestRule::new(
            "vatican",
            r"^https?://digi\.vatlib\.it/view/([^/?#]+)",
            "https://digi.vatlib.it/iiif/$1/manifest.json",
        ),
        ManifestRule::new(
            "grenoble",
            r"^https?://pagella\.bm-grenoble\.fr/ark:/12148/([^/?#]+)",
            "https://pagella.bm-grenoble.fr/iiif/ark:/12148/$1/manifest.json",
        ),
        ManifestRule::new(
            "gallica",
            r"^https?://gallica\.bnf\.fr/ark:/12148/([^/?#.]+)",
            "https://gallica.bnf.fr/iiif/ark:/12148/$1/manifest.json",
        ),
        ManifestRule::new(
            "manchester",
            r"^https?://www\.digitalcollections\.manchester\.ac\.uk/view/([^/?#]+)",
            "https://www.digitalcollections.manchester.ac.uk/iiif/$1",
        ),
        ManifestRule::new(
            "heidelberg",
            r"^https?://digi\.ub\.uni-heidelberg\.de/diglit/([^/?#]+)",
            "https://digi.ub.uni-heidelberg.de/diglit/iiif/$1/manifest.json",
        ),
        ManifestRule::new(
            "e-codices",
            r"^https?://www\.e-codices\.unifr\.ch/\w{2}/(?:list/one/)?([a-z]+)/([^/?#]+)",
            "https://www.e-codices.unifr.ch/metadata/iiif/$1-$2/manifest.json",
        ),
        ManifestRule::new(
            "yale",
            r"^https?://collections\.library\.yale\.edu/catalog/(\d+)",
            "https://collections.library.yale.edu/manifests/$1",
        ),
    ]
}

static MANIFEST_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)/manifest(?:\.json)?/?$"));

struct CompiledRule {
    library: String,
    pattern: Regex,
    template: String,
}

/// Adapter for IIIF Presentation manifests.
pub struct IiifAdapter {
    rules: Vec<CompiledRule>,
}

impl IiifAdapter {
    /// Adapter with only the built-in viewer rules.
    #[must_use]
    pub fn new() -> Self {
        Self::with_extra_rules(Vec::new())
    }

    /// Adapter with `extra` rules tried before the built-in ones.
    ///
    /// Rules whose pattern does not compile are skipped with a warning;
    /// config loading rejects them earlier with a proper error.
    #[must_use]
    pub fn with_extra_rules(extra: Vec<ManifestRule>) -> Self {
        let rules = extra
            .into_iter()
            .chain(builtin_rules())
            .filter_map(|rule| match Regex::new(&rule.pattern) {
                Ok(pattern) => Some(CompiledRule {
                    library: rule.library,
                    pattern,
                    template: rule.template,
                }),
                Err(error) => {
                    warn!(library = %rule.library, %error, "skipping IIIF rule with invalid pattern");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// Manifest URL and library for `url`, if this adapter can derive one.
    fn manifest_location(&self, url: &Url) -> Option<(String, String)> {
        if is_manifest_url(url) {
            let library = url.host_str().unwrap_or("iiif").to_string();
            return Some((url.to_string(), library));
        }
        if let Some((_, manifest)) = url.query_pairs().find(|(key, _)| key == "manifest") {
            let library = url.host_str().unwrap_or("iiif").to_string();
            return Some((manifest.into_owned(), library));
        }
        self.rules.iter().find_map(|rule| {
            let caps = rule.pattern.captures(url.as_str())?;
            let mut expanded = String::new();
            caps.expand(&rule.template, &mut expanded);
            Some((expanded, rule.library.clone()))
        })
    }
}

impl Default for IiifAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn is_manifest_url(url: &Url) -> bool {
    MANIFEST_PATH_RE.is_match(url.path())
}

#[async_trait]
impl Adapter for IiifAdapter {
    fn name(&self) -> &'static str {
        "iiif"
    }

    fn can_handle(&self, url: &Url) -> bool {
        self.manifest_location(url).is_some()
    }

    #[instrument(skip(self, ctx), fields(adapter = "iiif", url = %url))]
    async fn resolve(&self, url: &Url, ctx: &AdapterContext) -> Result<Manifest, AdapterError> {
        let Some((manifest_url, library)) = self.manifest_location(url) else {
            return Err(AdapterError::unsupported_source(url.as_str()));
        };
        debug!(manifest_url = %manifest_url, library = %library, "loading IIIF manifest");

        let document = ctx.fetch_json(&manifest_url).await?;
        let doc_type = document
            .get("@type")
            .or_else(|| document.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if doc_type.ends_with("Collection") {
            return Err(AdapterError::unsupported_feature(
                &manifest_url,
                "downloading a whole IIIF collection (open a single manuscript instead)",
            ));
        }

        let canvases = extract_canvases(&document);
        if canvases.is_empty() {
            return Err(AdapterError::parse(&manifest_url, "manifest lists no canvases"));
        }

        let mut pages = Vec::with_capacity(canvases.len());
        for (index, canvas) in canvases.iter().enumerate() {
            let label = canvas
                .label
                .clone()
                .unwrap_or_else(|| format!("Page {}", index + 1));
            let page = match &canvas.image {
                CanvasImage::Service(service) => {
                    let profile = ctx.profile_for(&service.id);
                    if profile.prefer_tiles
                        && let Some(grid) = service.tile_grid()
                    {
                        PageDescriptor::tiled(index, grid, label)
                    } else {
                        PageDescriptor::direct(index, service.image_url(&profile), label)
                    }
                }
                CanvasImage::Direct(image_url) => PageDescriptor::direct(index, image_url, label),
                CanvasImage::Missing => {
                    return Err(AdapterError::parse(
                        &manifest_url,
                        format!("canvas {} ('{label}') has no image", index + 1),
                    ));
                }
            };
            pages.push(page);
        }

        let display_name = document
            .get("label")
            .and_then(label_to_string)
            .unwrap_or_else(|| format!("{library} manuscript"));

        Manifest::new(url.as_str(), library, display_name, pages)
            .map_err(|source| AdapterError::invalid(url.as_str(), source))
    }
}

/// Image service advertised by a canvas.
#[derive(Debug, Clone, PartialEq)]
struct ImageService {
    id: String,
    v3: bool,
    width: Option<u32>,
    height: Option<u32>,
    tile_width: Option<u32>,
    tile_height: Option<u32>,
    scale_factors: Vec<u32>,
}

impl ImageService {
    fn from_json(value: &Value) -> Option<Self> {
        let service = first_or_self(value)?;
        let id = json_id(service)?.trim_end_matches('/').to_string();
        let service_type = service
            .get("@type")
            .or_else(|| service.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let context = service
            .get("@context")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let v3 = service_type == "ImageService3" || context.contains("image/3");
        let tiles = service.get("tiles").and_then(first_or_self);
        let dimension = |value: Option<&Value>| {
            value
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
        };
        Some(Self {
            id,
            v3,
            width: dimension(service.get("width")),
            height: dimension(service.get("height")),
            tile_width: dimension(tiles.and_then(|t| t.get("width"))),
            tile_height: dimension(tiles.and_then(|t| t.get("height"))),
            scale_factors: tiles
                .and_then(|t| t.get("scaleFactors"))
                .and_then(Value::as_array)
                .map(|factors| {
                    factors
                        .iter()
                        .filter_map(|f| f.as_u64().and_then(|n| u32::try_from(n).ok()))
                        .filter(|f| *f > 0)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    fn image_url(&self, profile: &SourceProfile) -> String {
        iiif_image_url(&self.id, self.v3, profile.max_image_dimension, self.width)
    }

    /// Tile grid from the service's `tiles` block, one level per scale factor.
    fn tile_grid(&self) -> Option<TileGrid> {
        let canvas_width = self.width?;
        let canvas_height = self.height?;
        let tile_width = self.tile_width?;
        let tile_height = self.tile_height.unwrap_or(tile_width);
        if self.scale_factors.is_empty() || tile_width == 0 || tile_height == 0 {
            return None;
        }
        let template = format!("{}/{{x}},{{y}},{{w}},{{h}}/{{sw}},/0/default.jpg", self.id);
        let levels = self
            .scale_factors
            .iter()
            .enumerate()
            .map(|(i, &scale)| TileLevel {
                level: u32::try_from(i).unwrap_or(u32::MAX),
                scale,
                tile_width,
                tile_height,
                cols: canvas_width.div_ceil(scale).div_ceil(tile_width),
                rows: canvas_height.div_ceil(scale).div_ceil(tile_height),
                tile_url_template: template.clone(),
                overlap: 0,
            })
            .collect();
        Some(TileGrid {
            levels,
            canvas_width,
            canvas_height,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CanvasImage {
    Service(ImageService),
    Direct(String),
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
struct Canvas {
    label: Option<String>,
    image: CanvasImage,
}

fn is_v3(document: &Value) -> bool {
    let context_mentions_v3 = match document.get("@context") {
        Some(Value::String(context)) => context.contains("presentation/3"),
        Some(Value::Array(contexts)) => contexts
            .iter()
            .filter_map(Value::as_str)
            .any(|context| context.contains("presentation/3")),
        _ => false,
    };
    context_mentions_v3 || (document.get("items").is_some() && document.get("sequences").is_none())
}

fn extract_canvases(document: &Value) -> Vec<Canvas> {
    if is_v3(document) {
        extract_v3(document)
    } else {
        extract_v2(document)
    }
}

/// `sequences[0].canvases[].images[0].resource`
fn extract_v2(document: &Value) -> Vec<Canvas> {
    let Some(canvases) = document
        .get("sequences")
        .and_then(first_or_self)
        .and_then(|sequence| sequence.get("canvases"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    canvases
        .iter()
        .map(|canvas| {
            let resource = canvas
                .get("images")
                .and_then(first_or_self)
                .and_then(|annotation| annotation.get("resource"));
            Canvas {
                label: canvas.get("label").and_then(label_to_string),
                image: resource.map_or(CanvasImage::Missing, |resource| {
                    image_from_body(resource, canvas)
                }),
            }
        })
        .collect()
}

/// `items[].items[0].items[0].body`
fn extract_v3(document: &Value) -> Vec<Canvas> {
    let Some(items) = document.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter(|item| {
            item.get("type")
                .and_then(Value::as_str)
                .is_none_or(|kind| kind == "Canvas")
        })
        .map(|canvas| {
            let body = canvas
                .get("items")
                .and_then(first_or_self)
                .and_then(|page| page.get("items"))
                .and_then(first_or_self)
                .and_then(|annotation| annotation.get("body"))
                .and_then(first_or_self);
            Canvas {
                label: canvas.get("label").and_then(label_to_string),
                image: body.map_or(CanvasImage::Missing, |body| image_from_body(body, canvas)),
            }
        })
        .collect()
}

fn image_from_body(body: &Value, canvas: &Value) -> CanvasImage {
    if let Some(mut service) = body.get("service").and_then(ImageService::from_json) {
        if service.width.is_none() {
            service.width = canvas
                .get("width")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok());
        }
        return CanvasImage::Service(service);
    }
    json_id(body).map_or(CanvasImage::Missing, |id| CanvasImage::Direct(id.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_rule_table_maps_viewer_urls() {
        let adapter = IiifAdapter::new();
        let url = Url::parse("https://digi.vatlib.it/view/MSS_Vat.lat.3225").unwrap();
        assert_eq!(
            adapter.manifest_location(&url),
            Some((
                "https://digi.vatlib.it/iiif/MSS_Vat.lat.3225/manifest.json".to_string(),
                "vatican".to_string()
            ))
        );

        let url = Url::parse(
            "https://digital.bodleian.ox.ac.uk/objects/748a9d50-5a3a-440e-ab9d-567dd68b6abb/",
        )
        .unwrap();
        assert_eq!(
            adapter.manifest_location(&url).unwrap().0,
            "https://iiif.bodleian.ox.ac.uk/iiif/manifest/748a9d50-5a3a-440e-ab9d-567dd68b6abb.json"
        );
    }

    #[test]
    fn test_direct_manifest_url_taken_as_is() {
        let adapter = IiifAdapter::new();
        let url =
            Url::parse("https://digi.ub.uni-heidelberg.de/diglit/iiif/cpg389/manifest.json").unwrap();
        assert_eq!(adapter.manifest_location(&url).unwrap().0, url.as_str());
        assert!(!adapter.can_handle(&Url::parse("https://example.org/about").unwrap()));
    }

    #[test]
    fn test_extra_rules_take_precedence() {
        let adapter = IiifAdapter::with_extra_rules(vec![ManifestRule::new(
            "mirror",
            r"^https://digi\.vatlib\.it/view/(.+)$",
            "https://mirror.example/$1/manifest",
        )]);
        let url = Url::parse("https://digi.vatlib.it/view/X").unwrap();
        assert_eq!(
            adapter.manifest_location(&url),
            Some(("https://mirror.example/X/manifest".to_string(), "mirror".to_string()))
        );
    }

    #[test]
    fn test_v2_canvases_in_declared_order() {
        let doc = json!({
            "@context": "http://iiif.io/api/presentation/2/context.json",
            "sequences": [{"canvases": [
                {"label": "f. 2r", "width": 3000, "images": [{"resource": {
                    "@id": "https://img.example/b/full/full/0/default.jpg",
                    "service": {"@id": "https://img.example/b", "@context": "http://iiif.io/api/image/2/context.json"}
                }}]},
                {"label": "f. 1r", "images": [{"resource": {
                    "@id": "https://img.example/a.jpg"
                }}]}
            ]}]
        });
        let canvases = extract_canvases(&doc);
        assert_eq!(canvases.len(), 2);
        assert_eq!(canvases[0].label.as_deref(), Some("f. 2r"));
        let CanvasImage::Service(service) = &canvases[0].image else {
            panic!("expected service");
        };
        assert!(!service.v3);
        assert_eq!(service.width, Some(3000));
        assert_eq!(
            canvases[1].image,
            CanvasImage::Direct("https://img.example/a.jpg".to_string())
        );
    }

    #[test]
    fn test_v3_body_service_and_language_labels() {
        let doc = json!({
            "@context": "http://iiif.io/api/presentation/3/context.json",
            "type": "Manifest",
            "label": {"en": ["Book of Hours"]},
            "items": [{
                "type": "Canvas",
                "label": {"none": ["1r"]},
                "items": [{"type": "AnnotationPage", "items": [{
                    "type": "Annotation",
                    "body": {"id": "https://img.example/c/full/max/0/default.jpg",
                             "service": [{"id": "https://img.example/c", "type": "ImageService3", "width": 8000}]}
                }]}]
            }]
        });
        let canvases = extract_canvases(&doc);
        assert_eq!(canvases.len(), 1);
        assert_eq!(canvases[0].label.as_deref(), Some("1r"));
        let CanvasImage::Service(service) = &canvases[0].image else {
            panic!("expected service");
        };
        assert!(service.v3);

        let mut profile = SourceProfile::default();
        assert_eq!(service.image_url(&profile), "https://img.example/c/full/max/0/default.jpg");
        profile.max_image_dimension = Some(4000);
        assert_eq!(service.image_url(&profile), "https://img.example/c/full/4000,/0/default.jpg");
    }

    #[test]
    fn test_tile_grid_from_service_tiles() {
        let service = ImageService::from_json(&json!({
            "@id": "https://img.example/t",
            "width": 2000,
            "height": 1000,
            "tiles": [{"width": 512, "scaleFactors": [1, 2, 4]}]
        }))
        .unwrap();
        let grid = service.tile_grid().unwrap();
        assert_eq!(grid.levels.len(), 3);
        assert_eq!((grid.levels[0].cols, grid.levels[0].rows), (4, 2));
        assert_eq!((grid.levels[2].cols, grid.levels[2].rows), (1, 1));
        for level in &grid.levels {
            assert!(grid.check_level(level).is_ok());
        }
    }

    #[test]
    fn test_missing_sequences_yields_no_canvases() {
        assert!(extract_canvases(&json!({"@context": "x", "sequences": []})).is_empty());
    }
}
