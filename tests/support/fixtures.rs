//! Image bodies, profiles and clients for tests against a local mock origin.

use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use manuscript_core::http::{ClientOptions, ResilientClient};
use manuscript_core::profile::{ProfileRegistry, SourceProfile};

/// Profile pattern matching any wiremock origin.
pub const LOCAL_ORIGIN: &str = r"^http://127\.0\.0\.1";

/// A JPEG with busy content so its size stays well above placeholder floors.
#[must_use]
pub fn jpeg_image(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        let v = (x.wrapping_mul(31) ^ y.wrapping_mul(17)).wrapping_add(u32::from(seed) * 41);
        image::Rgb([(v % 251) as u8, ((v >> 3) % 241) as u8, ((v >> 5) % 239) as u8])
    });
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90)
        .encode(&image, width, height, ExtendedColorType::Rgb8)
        .unwrap();
    out
}

/// A solid-colour tile, useful for checking stitched pixel placement.
#[must_use]
pub fn solid_tile(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 95)
        .encode(&image, width, height, ExtendedColorType::Rgb8)
        .unwrap();
    out
}

/// A page-sized JPEG.
#[must_use]
pub fn jpeg_page(seed: u8) -> Vec<u8> {
    jpeg_image(320, 240, seed)
}

/// Fast-retrying profile for the local origin.
#[must_use]
pub fn local_profile() -> SourceProfile {
    SourceProfile {
        name: "local".to_string(),
        origin_pattern: LOCAL_ORIGIN.to_string(),
        max_attempts: 3,
        retry_backoff_ms: vec![10, 20, 40],
        ..SourceProfile::default()
    }
}

/// Registry with `profile` in front of the built-in table.
#[must_use]
pub fn registry_with(profile: SourceProfile) -> Arc<ProfileRegistry> {
    Arc::new(ProfileRegistry::with_overrides(vec![profile]).unwrap())
}

/// Registry with [`local_profile`] in front of the built-in table.
#[must_use]
pub fn local_profiles() -> Arc<ProfileRegistry> {
    registry_with(local_profile())
}

/// Client with default options.
#[must_use]
pub fn client() -> ResilientClient {
    ResilientClient::new(ClientOptions::default()).unwrap()
}
