//! Tile stitching: reconstruct a page image from a [`TileGrid`].
//!
//! The stitcher picks the highest-resolution level that fits its memory
//! budget, fetches every tile of that level through the shared
//! [`ResilientClient`], checks each decoded tile against the geometry the
//! grid promises, and composites it into one RGB canvas as soon as it
//! arrives. Tile requests draw permits from the caller's semaphore, the same
//! one that bounds the job's page fetches. The canvas is encoded as JPEG at a
//! fixed quality; the output is a pure function of the tile bytes, so
//! stitching the same tiles twice gives byte-identical JPEGs.
//!
//! A page is either complete or not produced: any tile still missing after
//! the client's retries, and after refetching bodies that do not decode,
//! yields [`StitchError::PartialTileFailure`] listing exactly the missing
//! coordinates.

mod error;

pub use error::StitchError;

use futures_util::stream::{self, StreamExt};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, GenericImageView, RgbImage, imageops};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::http::{FailureType, ResilientClient, RetryDecision, RetryPolicy};
use crate::manifest::{TileCoord, TileGrid, TileLevel};
use crate::profile::SourceProfile;

/// Default decoded-pixel budget (512 MiB): the RGB canvas plus tiles in flight.
pub const DEFAULT_MEMORY_BUDGET_BYTES: u64 = 512 * 1024 * 1024;

/// JPEG quality for stitched pages.
pub const STITCH_JPEG_QUALITY: u8 = 90;

/// Reconstructs pages from tiles.
#[derive(Debug, Clone)]
pub struct TileStitcher {
    client: ResilientClient,
    memory_budget_bytes: u64,
}

impl TileStitcher {
    /// Creates a stitcher with a decoded-pixel memory budget in bytes.
    #[must_use]
    pub fn new(client: ResilientClient, memory_budget_bytes: u64) -> Self {
        Self {
            client,
            memory_budget_bytes,
        }
    }

    /// The highest-resolution level whose pixels fit the budget.
    ///
    /// A level needs its RGB canvas plus `concurrent_tiles` decoded tiles,
    /// counted as RGBA with overlap.
    ///
    /// # Errors
    ///
    /// [`StitchError::GridInconsistency`] if no level fits or the chosen
    /// level's tile counts do not cover its canvas.
    pub fn select_level<'a>(
        &self,
        grid: &'a TileGrid,
        concurrent_tiles: usize,
    ) -> Result<&'a TileLevel, StitchError> {
        let mut levels: Vec<&TileLevel> = grid.levels.iter().collect();
        levels.sort_by_key(|level| level.scale);

        let level = levels
            .into_iter()
            .find(|level| decoded_bytes(grid, level, concurrent_tiles) <= self.memory_budget_bytes)
            .ok_or_else(|| {
                StitchError::grid(format!(
                    "no level of the {}x{} image fits the {} MiB stitch budget",
                    grid.canvas_width,
                    grid.canvas_height,
                    self.memory_budget_bytes / (1024 * 1024)
                ))
            })?;
        grid.check_level(level).map_err(StitchError::grid)?;
        Ok(level)
    }

    /// Fetches, verifies and composites all tiles of the best level.
    ///
    /// Every tile request holds a permit from `permits` while it is on the
    /// wire.
    ///
    /// # Errors
    ///
    /// See [`StitchError`].
    #[instrument(skip(self, grid, profile, permits), fields(canvas = %format!("{}x{}", grid.canvas_width, grid.canvas_height), profile = %profile.name))]
    pub async fn stitch(
        &self,
        grid: &TileGrid,
        profile: &SourceProfile,
        permits: &Semaphore,
    ) -> Result<Vec<u8>, StitchError> {
        let concurrency = profile.effective_concurrency(None);
        let level = self.select_level(grid, concurrency)?;
        let coords = TileGrid::coords(level);
        let total = coords.len();
        debug!(
            level = level.level,
            scale = level.scale,
            tiles = total,
            concurrency,
            "fetching tile level"
        );

        let (width, height) = grid.level_dimensions(level);
        let mut canvas = RgbImage::new(width, height);
        let mut missing = Vec::new();
        let mut arrivals = std::pin::pin!(
            stream::iter(coords)
                .map(|coord| {
                    let url = grid.tile_url(level, coord);
                    async move { (coord, self.fetch_tile(&url, profile, permits).await) }
                })
                .buffer_unordered(concurrency)
        );

        while let Some((coord, tile)) = arrivals.next().await {
            let Some(tile) = tile else {
                missing.push(coord);
                continue;
            };
            let expected = grid.expected_tile_size(level, coord);
            if tile.dimensions() != expected {
                return Err(StitchError::grid(format!(
                    "tile {coord} decoded as {}x{} but the grid expects {}x{}",
                    tile.width(),
                    tile.height(),
                    expected.0,
                    expected.1
                )));
            }
            // A page with a gap is never emitted, so stop spending time on it.
            if missing.is_empty() {
                place_tile(&mut canvas, grid, level, coord, &tile);
            }
        }
        if !missing.is_empty() {
            warn!(missing = missing.len(), total, "tiles missing after retries");
            return Err(StitchError::partial(missing, total));
        }

        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&canvas))
            .await
            .map_err(|e| StitchError::Encode {
                reason: format!("stitch worker failed: {e}"),
            })??;
        info!(tiles = total, bytes = jpeg.len(), "page stitched");
        Ok(jpeg)
    }

    /// One decoded tile, refetching while the body does not decode.
    async fn fetch_tile(
        &self,
        url: &str,
        profile: &SourceProfile,
        permits: &Semaphore,
    ) -> Option<DynamicImage> {
        let policy = RetryPolicy::for_profile(profile);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let fetched = {
                // The job semaphore is never closed.
                let _permit = permits.acquire().await.ok();
                self.client.fetch(url, profile).await
            };
            let body = match fetched {
                Ok(body) => body,
                Err(error) => {
                    debug!(url, %error, "tile fetch failed");
                    return None;
                }
            };
            let error = match image::load_from_memory(&body.bytes) {
                Ok(tile) => return Some(tile),
                Err(error) => error,
            };
            match policy.should_retry(FailureType::Transient, attempt) {
                RetryDecision::Retry { delay, .. } => {
                    debug!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis(),
                        %error,
                        "tile is not a decodable image, refetching"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { .. } => {
                    debug!(url, attempts = attempt, %error, "tile never decoded");
                    return None;
                }
            }
        }
    }
}

/// Canvas bytes plus `concurrent_tiles` RGBA tiles with their overlap.
fn decoded_bytes(grid: &TileGrid, level: &TileLevel, concurrent_tiles: usize) -> u64 {
    let (width, height) = grid.level_dimensions(level);
    let canvas = u64::from(width) * u64::from(height) * 3;
    let tile_width = u64::from(level.tile_width) + 2 * u64::from(level.overlap);
    let tile_height = u64::from(level.tile_height) + 2 * u64::from(level.overlap);
    canvas + concurrent_tiles as u64 * tile_width * tile_height * 4
}

/// Copies a tile's own pixels (overlap trimmed) to its declared position.
fn place_tile(
    canvas: &mut RgbImage,
    grid: &TileGrid,
    level: &TileLevel,
    coord: TileCoord,
    tile: &DynamicImage,
) {
    let rect = grid.tile_rect(level, coord);
    let (offset_x, offset_y) = TileGrid::overlap_offset(level, coord);
    let own = tile
        .crop_imm(offset_x, offset_y, rect.width, rect.height)
        .to_rgb8();
    imageops::replace(canvas, &own, i64::from(rect.x), i64::from(rect.y));
}

/// Encodes an RGB canvas at [`STITCH_JPEG_QUALITY`].
///
/// # Errors
///
/// [`StitchError::Encode`] if the encoder rejects the image.
pub fn encode_jpeg(canvas: &RgbImage) -> Result<Vec<u8>, StitchError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, STITCH_JPEG_QUALITY)
        .encode(
            canvas,
            canvas.width(),
            canvas.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| StitchError::Encode {
            reason: e.to_string(),
        })?;
    Ok(out)
}
