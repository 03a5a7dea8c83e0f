//! Deep Zoom (`.dzi`) adapter.
//!
//! A descriptor such as
//!
//! ```xml
//! <Image TileSize="254" Overlap="1" Format="jpg" xmlns="http://schemas.microsoft.com/deepzoom/2008">
//!   <Size Width="4000" Height="3000"/>
//! </Image>
//! ```
//!
//! becomes a one-page manifest whose page is a [`TileGrid`]. Level `L` of
//! `0..=max_level` is downsampled by `2^(max_level - L)`, where
//! `max_level = ceil(log2(max(width, height)))`, and its tiles live at
//! `{base}_files/{L}/{col}_{row}.{format}`.

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tracing::instrument;
use url::Url;

use super::{Adapter, AdapterContext, AdapterError};
use crate::manifest::{Manifest, PageDescriptor, TileGrid, TileLevel};

/// Adapter for Deep Zoom Image descriptors.
#[derive(Debug, Default)]
pub struct DeepZoomAdapter;

impl DeepZoomAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DziDescriptor {
    tile_size: u32,
    overlap: u32,
    format: String,
    width: u32,
    height: u32,
}

#[async_trait]
impl Adapter for DeepZoomAdapter {
    fn name(&self) -> &'static str {
        "deepzoom"
    }

    fn can_handle(&self, url: &Url) -> bool {
        url.path().to_ascii_lowercase().ends_with(".dzi")
    }

    #[instrument(skip(self, ctx), fields(adapter = "deepzoom", url = %url))]
    async fn resolve(&self, url: &Url, ctx: &AdapterContext) -> Result<Manifest, AdapterError> {
        let xml = ctx.fetch_text(url.as_str()).await?;
        let descriptor =
            parse_descriptor(&xml).map_err(|reason| AdapterError::parse(url.as_str(), reason))?;

        let mut base = url.clone();
        base.set_query(None);
        let base = base.as_str();
        let base = &base[..base.len() - ".dzi".len()];
        let grid = build_grid(&descriptor, base);

        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map_or("deepzoom", |file| file.trim_end_matches(".dzi"))
            .to_string();
        let library = url.host_str().unwrap_or("deepzoom").to_string();

        Manifest::new(
            url.as_str(),
            library,
            name,
            vec![PageDescriptor::tiled(0, grid, "Page 1")],
        )
        .map_err(|source| AdapterError::invalid(url.as_str(), source))
    }
}

fn parse_descriptor(xml: &str) -> Result<DziDescriptor, String> {
    let mut reader = Reader::from_str(xml);
    let mut tile_size = None;
    let mut overlap = 0;
    let mut format = None;
    let mut width = None;
    let mut height = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) => {
                let name = e.local_name();
                let is_image = name.as_ref() == b"Image";
                let is_size = name.as_ref() == b"Size";
                if !is_image && !is_size {
                    continue;
                }
                for attr in e.attributes().flatten() {
                    let Ok(value) = std::str::from_utf8(&attr.value) else {
                        continue;
                    };
                    let value = value.trim();
                    match (is_image, attr.key.local_name().as_ref()) {
                        (true, b"TileSize") => tile_size = value.parse().ok(),
                        (true, b"Overlap") => overlap = value.parse().unwrap_or(0),
                        (true, b"Format") => format = Some(value.to_ascii_lowercase()),
                        (false, b"Width") => width = value.parse().ok(),
                        (false, b"Height") => height = value.parse().ok(),
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(format!("descriptor is not valid XML: {e}")),
        }
    }

    let tile_size: u32 = tile_size.ok_or("descriptor has no TileSize")?;
    let width: u32 = width.ok_or("descriptor has no Size Width")?;
    let height: u32 = height.ok_or("descriptor has no Size Height")?;
    if tile_size == 0 || width == 0 || height == 0 {
        return Err("descriptor declares a zero dimension".to_string());
    }
    Ok(DziDescriptor {
        tile_size,
        overlap,
        format: format.unwrap_or_else(|| "jpg".to_string()),
        width,
        height,
    })
}

/// `ceil(log2(dimension))`.
fn max_level(dimension: u32) -> u32 {
    if dimension <= 1 {
        0
    } else {
        u32::BITS - (dimension - 1).leading_zeros()
    }
}

fn build_grid(descriptor: &DziDescriptor, base: &str) -> TileGrid {
    let top = max_level(descriptor.width.max(descriptor.height));
    let template = format!("{base}_files/{{level}}/{{col}}_{{row}}.{}", descriptor.format);
    let levels = (0..=top)
        .map(|level| {
            let scale = 1u32 << (top - level);
            let level_width = descriptor.width.div_ceil(scale);
            let level_height = descriptor.height.div_ceil(scale);
            TileLevel {
                level,
                scale,
                tile_width: descriptor.tile_size,
                tile_height: descriptor.tile_size,
                cols: level_width.div_ceil(descriptor.tile_size),
                rows: level_height.div_ceil(descriptor.tile_size),
                tile_url_template: template.clone(),
                overlap: descriptor.overlap,
            }
        })
        .collect();
    TileGrid {
        levels,
        canvas_width: descriptor.width,
        canvas_height: descriptor.height,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::TileCoord;

    const DESCRIPTOR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Image TileSize="254" Overlap="1" Format="JPG" xmlns="http://schemas.microsoft.com/deepzoom/2008">
  <Size Width="4000" Height="3000"/>
</Image>"#;

    #[test]
    fn test_parse_descriptor() {
        let descriptor = parse_descriptor(DESCRIPTOR).unwrap();
        assert_eq!(
            descriptor,
            DziDescriptor {
                tile_size: 254,
                overlap: 1,
                format: "jpg".to_string(),
                width: 4000,
                height: 3000,
            }
        );
    }

    #[test]
    fn test_missing_size_is_parse_error() {
        let err = parse_descriptor(r#"<Image TileSize="256" Format="jpg"/>"#).unwrap_err();
        assert!(err.contains("Width"));
    }

    #[test]
    fn test_levels_and_tile_urls() {
        let descriptor = parse_descriptor(DESCRIPTOR).unwrap();
        let grid = build_grid(&descriptor, "https://dz.example/in/dz/ms_0001");
        assert_eq!(max_level(4000), 12);
        assert_eq!(max_level(4096), 12);
        assert_eq!(max_level(4097), 13);
        assert_eq!(grid.levels.len(), 13);

        let top = grid.levels.last().unwrap();
        assert_eq!(top.scale, 1);
        assert_eq!((top.cols, top.rows), (16, 12));
        assert_eq!(
            grid.tile_url(top, TileCoord::new(3, 2)),
            "https://dz.example/in/dz/ms_0001_files/12/3_2.jpg"
        );
        assert!(grid.levels.iter().all(|level| grid.check_level(level).is_ok()));
        assert_eq!((grid.levels[0].cols, grid.levels[0].rows), (1, 1));
    }
}
