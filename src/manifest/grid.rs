//! Tile grid geometry.
//!
//! A [`TileGrid`] describes one image served as tiles across zoom levels.
//! Coordinates are always given as `(col, row)` with `(0, 0)` at the top
//! left. Level `scale` is the downsampling factor relative to the full
//! resolution canvas, so a level covers `ceil(canvas / scale)` pixels.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a tile within a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    /// Zero-based row; ordered first so sorting is row-major.
    pub row: u32,
    /// Zero-based column.
    pub col: u32,
}

impl TileCoord {
    /// Creates a coordinate from column and row.
    #[must_use]
    pub fn new(col: u32, row: u32) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.col, self.row)
    }
}

/// One zoom level of a tiled image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileLevel {
    /// Value substituted for `{level}` in the template.
    pub level: u32,
    /// Downsampling factor relative to the full canvas (1 = full resolution).
    pub scale: u32,
    /// Nominal tile width in level pixels.
    pub tile_width: u32,
    /// Nominal tile height in level pixels.
    pub tile_height: u32,
    /// Columns of tiles.
    pub cols: u32,
    /// Rows of tiles.
    pub rows: u32,
    /// URL template; see [`TileLevel::tile_url`] for placeholders.
    pub tile_url_template: String,
    /// Pixels each tile repeats from its neighbours (Deep Zoom overlap).
    #[serde(default)]
    pub overlap: u32,
}

/// Pixel rectangle a tile covers within its level, before overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    /// Left edge in level pixels.
    pub x: u32,
    /// Top edge in level pixels.
    pub y: u32,
    /// Width in level pixels.
    pub width: u32,
    /// Height in level pixels.
    pub height: u32,
}

/// A tiled image: levels plus full-resolution canvas size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGrid {
    /// Available zoom levels, in any order.
    pub levels: Vec<TileLevel>,
    /// Full-resolution width.
    pub canvas_width: u32,
    /// Full-resolution height.
    pub canvas_height: u32,
}

impl TileGrid {
    /// Pixel dimensions of `level` (canvas divided by scale, rounded up).
    #[must_use]
    pub fn level_dimensions(&self, level: &TileLevel) -> (u32, u32) {
        let scale = level.scale.max(1);
        (
            self.canvas_width.div_ceil(scale),
            self.canvas_height.div_ceil(scale),
        )
    }

    /// Whether a level's declared cols/rows cover its scaled canvas exactly.
    ///
    /// # Errors
    ///
    /// Returns a description of the mismatch.
    pub fn check_level(&self, level: &TileLevel) -> Result<(), String> {
        if level.tile_width == 0 || level.tile_height == 0 || level.scale == 0 {
            return Err(format!(
                "level {} declares a zero tile size or scale",
                level.level
            ));
        }
        let (width, height) = self.level_dimensions(level);
        let expected_cols = width.div_ceil(level.tile_width);
        let expected_rows = height.div_ceil(level.tile_height);
        if expected_cols != level.cols || expected_rows != level.rows {
            return Err(format!(
                "level {} declares {}x{} tiles but a {width}x{height} canvas at {}x{} tiles needs {expected_cols}x{expected_rows}",
                level.level, level.cols, level.rows, level.tile_width, level.tile_height
            ));
        }
        Ok(())
    }

    /// The area a tile covers in level pixels, excluding overlap.
    ///
    /// Edge tiles are `dim - (count - 1) * tile` wide/high.
    #[must_use]
    pub fn tile_rect(&self, level: &TileLevel, coord: TileCoord) -> TileRect {
        let (width, height) = self.level_dimensions(level);
        let x = coord.col * level.tile_width;
        let y = coord.row * level.tile_height;
        TileRect {
            x,
            y,
            width: level.tile_width.min(width.saturating_sub(x)),
            height: level.tile_height.min(height.saturating_sub(y)),
        }
    }

    /// Decoded pixel size a tile must have, including overlap on interior sides.
    #[must_use]
    pub fn expected_tile_size(&self, level: &TileLevel, coord: TileCoord) -> (u32, u32) {
        let rect = self.tile_rect(level, coord);
        let overlap = level.overlap;
        let mut width = rect.width;
        let mut height = rect.height;
        if coord.col > 0 {
            width += overlap;
        }
        if coord.col + 1 < level.cols {
            width += overlap;
        }
        if coord.row > 0 {
            height += overlap;
        }
        if coord.row + 1 < level.rows {
            height += overlap;
        }
        (width, height)
    }

    /// Offset inside a decoded tile where its own (non-overlap) pixels start.
    #[must_use]
    pub fn overlap_offset(level: &TileLevel, coord: TileCoord) -> (u32, u32) {
        (
            if coord.col > 0 { level.overlap } else { 0 },
            if coord.row > 0 { level.overlap } else { 0 },
        )
    }

    /// All coordinates of a level in row-major order.
    #[must_use]
    pub fn coords(level: &TileLevel) -> Vec<TileCoord> {
        (0..level.rows)
            .flat_map(|row| (0..level.cols).map(move |col| TileCoord::new(col, row)))
            .collect()
    }

    /// Expands the template for one tile.
    ///
    /// Placeholders: `{level}`, `{col}`, `{row}`; `{x}`, `{y}`, `{w}`, `{h}`
    /// for the region in full-resolution pixels; `{sw}`, `{sh}` for the
    /// region's size at this level.
    #[must_use]
    pub fn tile_url(&self, level: &TileLevel, coord: TileCoord) -> String {
        let rect = self.tile_rect(level, coord);
        let scale = level.scale.max(1);
        let full_x = rect.x * scale;
        let full_y = rect.y * scale;
        let full_w = (rect.width * scale).min(self.canvas_width.saturating_sub(full_x));
        let full_h = (rect.height * scale).min(self.canvas_height.saturating_sub(full_y));
        level
            .tile_url_template
            .replace("{level}", &level.level.to_string())
            .replace("{col}", &coord.col.to_string())
            .replace("{row}", &coord.row.to_string())
            .replace("{x}", &full_x.to_string())
            .replace("{y}", &full_y.to_string())
            .replace("{w}", &full_w.to_string())
            .replace("{h}", &full_h.to_string())
            .replace("{sw}", &rect.width.to_string())
            .replace("{sh}", &rect.height.to_string())
    }

    /// Stable identity used for duplicate detection in manifests.
    #[must_use]
    pub fn identity(&self) -> String {
        let template = self
            .levels
            .iter()
            .min_by_key(|level| level.scale)
            .map_or("", |level| level.tile_url_template.as_str());
        format!("{template}#{}x{}", self.canvas_width, self.canvas_height)
    }
}
