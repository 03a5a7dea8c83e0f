//! Page validation.
//!
//! Origins commonly answer HTTP 200 with a fixed-size "image unavailable"
//! placeholder or an HTML error page. A page is accepted only if its length
//! clears the profile floor, it is not a known placeholder size, its content
//! type (when sent) is an image, and its leading bytes are an image
//! signature.

use thiserror::Error;

use crate::profile::SourceProfile;

/// Image container recognized from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFormat {
    /// JPEG (`FF D8 FF`).
    Jpeg,
    /// PNG.
    Png,
    /// GIF87a/89a.
    Gif,
    /// RIFF WebP.
    Webp,
    /// TIFF, either byte order.
    Tiff,
    /// JPEG 2000 (codestream or JP2 box).
    Jp2,
}

impl PageFormat {
    /// File extension for stored pages.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Tiff => "tif",
            Self::Jp2 => "jp2",
        }
    }

    /// All formats, for locating stored pages.
    pub const ALL: [Self; 6] = [
        Self::Jpeg,
        Self::Png,
        Self::Gif,
        Self::Webp,
        Self::Tiff,
        Self::Jp2,
    ];
}

/// Why a body was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Body shorter than the profile floor.
    #[error("body is {len} bytes, below the {min}-byte floor for real pages")]
    TooSmall {
        /// Body length.
        len: u64,
        /// Profile floor.
        min: u64,
    },

    /// Body length matches a known placeholder response.
    #[error("body is {len} bytes, the size of this library's placeholder image")]
    Placeholder {
        /// Body length.
        len: u64,
    },

    /// Content type is present and not an image.
    #[error("content type '{content_type}' is not an image")]
    NotAnImage {
        /// Reported content type.
        content_type: String,
    },

    /// Leading bytes are not an image signature.
    #[error("body does not start with a known image signature")]
    BadSignature,
}

/// Recognizes an image container from its leading bytes.
#[must_use]
pub fn sniff_format(bytes: &[u8]) -> Option<PageFormat> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some(PageFormat::Jpeg),
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(PageFormat::Png),
        [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some(PageFormat::Gif),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(PageFormat::Webp),
        [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => Some(PageFormat::Tiff),
        [0xFF, 0x4F, 0xFF, 0x51, ..]
        | [0x00, 0x00, 0x00, 0x0C, b'j', b'P', b' ', b' ', ..] => Some(PageFormat::Jp2),
        _ => None,
    }
}

/// Accepts or rejects a fetched page body.
///
/// `application/octet-stream` and a missing content type are tolerated;
/// the signature check still applies.
///
/// # Errors
///
/// Returns the first [`ValidationError`] that applies.
pub fn validate_page(
    bytes: &[u8],
    content_type: Option<&str>,
    profile: &SourceProfile,
) -> Result<PageFormat, ValidationError> {
    let len = bytes.len() as u64;
    if len < profile.min_page_bytes {
        return Err(ValidationError::TooSmall {
            len,
            min: profile.min_page_bytes,
        });
    }
    if profile.placeholder_sizes.contains(&len) {
        return Err(ValidationError::Placeholder { len });
    }
    if let Some(content_type) = content_type {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !mime.is_empty() && !mime.starts_with("image/") && mime != "application/octet-stream" {
            return Err(ValidationError::NotAnImage {
                content_type: content_type.to_string(),
            });
        }
    }
    sniff_format(bytes).ok_or(ValidationError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        bytes[..4].copy_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
        bytes
    }

    #[test]
    fn test_sniff_signatures() {
        assert_eq!(sniff_format(&jpeg(16)), Some(PageFormat::Jpeg));
        assert_eq!(
            sniff_format(b"\x89PNG\r\n\x1a\n0000"),
            Some(PageFormat::Png)
        );
        assert_eq!(sniff_format(b"GIF89a..."), Some(PageFormat::Gif));
        assert_eq!(sniff_format(b"RIFF\0\0\0\0WEBPVP8 "), Some(PageFormat::Webp));
        assert_eq!(sniff_format(b"II*\0rest"), Some(PageFormat::Tiff));
        assert_eq!(sniff_format(b"\0\0\0\x0cjP  \r\n"), Some(PageFormat::Jp2));
        assert_eq!(sniff_format(b"<html>"), None);
        assert_eq!(sniff_format(b""), None);
    }

    #[test]
    fn test_small_body_rejected() {
        let profile = SourceProfile::default();
        assert_eq!(
            validate_page(&jpeg(800), Some("image/jpeg"), &profile),
            Err(ValidationError::TooSmall { len: 800, min: 1024 })
        );
    }

    #[test]
    fn test_known_placeholder_size_rejected() {
        let mut profile = SourceProfile::default();
        profile.placeholder_sizes = vec![27_287];
        assert_eq!(
            validate_page(&jpeg(27_287), Some("image/jpeg"), &profile),
            Err(ValidationError::Placeholder { len: 27_287 })
        );
        assert!(validate_page(&jpeg(27_288), Some("image/jpeg"), &profile).is_ok());
    }

    #[test]
    fn test_content_type_checks() {
        let profile = SourceProfile::default();
        assert!(matches!(
            validate_page(&jpeg(4096), Some("text/html; charset=utf-8"), &profile),
            Err(ValidationError::NotAnImage { .. })
        ));
        assert_eq!(
            validate_page(&jpeg(4096), Some("application/octet-stream"), &profile),
            Ok(PageFormat::Jpeg)
        );
        assert_eq!(validate_page(&jpeg(4096), None, &profile), Ok(PageFormat::Jpeg));
    }

    #[test]
    fn test_html_with_image_content_type_rejected() {
        let profile = SourceProfile::default();
        let mut body = b"<html><body>Not found</body></html>".to_vec();
        body.resize(2048, b' ');
        assert_eq!(
            validate_page(&body, Some("image/jpeg"), &profile),
            Err(ValidationError::BadSignature)
        );
    }
}
