//! PDF rendering of assembled artifacts.
//!
//! One PDF page per image, sized to the image in points. Page bytes are read
//! from the work directory as each page is embedded. JPEG and JPEG 2000
//! pages are embedded untouched (`DCTDecode` / `JPXDecode`); other formats
//! are decoded and re-encoded as JPEG.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::ImageDecoder;
use image::codecs::jpeg::JpegDecoder;
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};
use tracing::{debug, info, instrument};

use super::error::AssembleError;
use super::filename::{artifact_file_name, resolve_unique_path};
use super::DocumentArtifact;
use crate::download::{PageData, PageFormat};
use crate::stitch::encode_jpeg;

struct EmbeddedImage {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
    filter: &'static str,
    color_space: Option<&'static str>,
}

/// Writes `artifact` to `out_dir` as `{display_name}_pages_{first}-{last}.pdf`.
///
/// The file is written under a `.part` name and renamed when complete. An
/// existing file with the same name is never overwritten.
///
/// # Errors
///
/// Returns [`AssembleError`] if an image cannot be embedded or the file
/// cannot be written.
#[instrument(skip(artifact), fields(label = %artifact.label, pages = artifact.pages.len()))]
pub fn write_pdf(
    artifact: &DocumentArtifact,
    display_name: &str,
    out_dir: &Path,
) -> Result<PathBuf, AssembleError> {
    std::fs::create_dir_all(out_dir).map_err(|source| AssembleError::Io {
        path: out_dir.to_path_buf(),
        source,
    })?;
    let file_name = artifact_file_name(display_name, artifact.first_page, artifact.last_page);
    let path = resolve_unique_path(out_dir, &file_name);
    let partial = path.with_extension("pdf.part");

    let mut doc = build_document(artifact, display_name)?;
    doc.save(&partial).map_err(|e| AssembleError::Pdf {
        path: partial.clone(),
        reason: e.to_string(),
    })?;
    std::fs::rename(&partial, &path).map_err(|source| AssembleError::Io {
        path: path.clone(),
        source,
    })?;

    info!(path = %path.display(), bytes = artifact.total_bytes, "wrote PDF");
    Ok(path)
}

/// Writes every artifact; returns the paths in artifact order.
///
/// # Errors
///
/// Stops at the first artifact that fails.
pub fn write_artifacts(
    artifacts: &[DocumentArtifact],
    display_name: &str,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, AssembleError> {
    artifacts
        .iter()
        .map(|artifact| write_pdf(artifact, display_name, out_dir))
        .collect()
}

fn build_document(
    artifact: &DocumentArtifact,
    display_name: &str,
) -> Result<Document, AssembleError> {
    let pdf_error = |reason: String| AssembleError::Pdf {
        path: PathBuf::from(artifact_file_name(
            display_name,
            artifact.first_page,
            artifact.last_page,
        )),
        reason,
    };

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::with_capacity(artifact.pages.len());

    for page in &artifact.pages {
        let image = embed(page)?;
        let width = i64::from(image.width);
        let height = i64::from(image.height);

        let mut image_dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width,
            "Height" => height,
            "BitsPerComponent" => 8,
            "Filter" => image.filter,
        };
        if let Some(color_space) = image.color_space {
            image_dict.set("ColorSpace", color_space);
        }
        let image_id = doc.add_object(Stream::new(image_dict, image.bytes));

        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![width.into(), 0.into(), 0.into(), height.into(), 0.into(), 0.into()],
                ),
                Operation::new("Do", vec!["Im0".into()]),
                Operation::new("Q", vec![]),
            ],
        };
        let encoded = content.encode().map_err(|e| pdf_error(e.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), width.into(), height.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        kids.push(page_id.into());
        debug!(index = page.index, width, height, filter = image.filter, "embedded page");
    }

    let count = i64::try_from(kids.len()).unwrap_or(i64::MAX);
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    let info_id = doc.add_object(dictionary! {
        "Title" => Object::string_literal(format!("{display_name} ({})", artifact.label)),
        "Producer" => Object::string_literal(concat!("manuscript-dl ", env!("CARGO_PKG_VERSION"))),
    });
    doc.trailer.set("Root", catalog_id);
    doc.trailer.set("Info", info_id);
    Ok(doc)
}

fn embed(page: &PageData) -> Result<EmbeddedImage, AssembleError> {
    let image_error = |reason: String| AssembleError::Image {
        page: page.index + 1,
        reason,
    };
    let bytes = page.read().map_err(|source| AssembleError::Io {
        path: page.path.clone(),
        source,
    })?;

    match page.format {
        PageFormat::Jpeg => {
            let decoder = JpegDecoder::new(Cursor::new(bytes.as_slice()))
                .map_err(|e| image_error(e.to_string()))?;
            let (width, height) = decoder.dimensions();
            let color_space = match decoder.color_type() {
                image::ColorType::L8 | image::ColorType::L16 => "DeviceGray",
                _ => "DeviceRGB",
            };
            Ok(EmbeddedImage {
                bytes,
                width,
                height,
                filter: "DCTDecode",
                color_space: Some(color_space),
            })
        }
        PageFormat::Jp2 => {
            let (width, height) = jp2_dimensions(&bytes)
                .ok_or_else(|| image_error("JPEG 2000 header not found".to_string()))?;
            Ok(EmbeddedImage {
                bytes,
                width,
                height,
                filter: "JPXDecode",
                color_space: None,
            })
        }
        PageFormat::Png | PageFormat::Gif | PageFormat::Webp | PageFormat::Tiff => {
            let decoded =
                image::load_from_memory(&bytes).map_err(|e| image_error(e.to_string()))?;
            let rgb = decoded.to_rgb8();
            let (width, height) = rgb.dimensions();
            let bytes = encode_jpeg(&rgb).map_err(|e| image_error(e.to_string()))?;
            Ok(EmbeddedImage {
                bytes,
                width,
                height,
                filter: "DCTDecode",
                color_space: Some("DeviceRGB"),
            })
        }
    }
}

/// Width and height from a JP2 `ihdr` box or a raw codestream `SIZ` marker.
fn jp2_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let be_u32 = |at: usize| -> Option<u32> {
        let slice = bytes.get(at..at + 4)?;
        Some(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
    };

    if let Some(pos) = find(bytes, b"ihdr") {
        let height = be_u32(pos + 4)?;
        let width = be_u32(pos + 8)?;
        return Some((width, height));
    }
    let pos = find(bytes, &[0xFF, 0x51])?;
    let x = be_u32(pos + 6)?;
    let y = be_u32(pos + 10)?;
    let x_offset = be_u32(pos + 14)?;
    let y_offset = be_u32(pos + 18)?;
    Some((x.checked_sub(x_offset)?, y.checked_sub(y_offset)?))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::assemble::{AssembleOptions, assemble};

    fn stored(work: &Path, index: usize, format: PageFormat, bytes: &[u8]) -> PageData {
        let path = work.join(format!("page_{index}.{}", format.extension()));
        std::fs::write(&path, bytes).unwrap();
        PageData::new(index, format!("{}r", index + 1), format, path, bytes)
    }

    fn jpeg_page(work: &Path, index: usize, shade: u8) -> PageData {
        let image = RgbImage::from_pixel(40, 30, Rgb([shade, 10, 200]));
        stored(work, index, PageFormat::Jpeg, &encode_jpeg(&image).unwrap())
    }

    fn png_page(work: &Path, index: usize) -> PageData {
        let image = RgbImage::from_pixel(20, 10, Rgb([0, 255, 0]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        stored(work, index, PageFormat::Png, &bytes)
    }

    #[test]
    fn test_write_pdf_one_page_per_image() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let pages = vec![
            jpeg_page(work.path(), 0, 0),
            jpeg_page(work.path(), 1, 90),
            png_page(work.path(), 2),
        ];
        let artifacts = assemble(pages, &[0, 1, 2], &AssembleOptions::default()).unwrap();
        let path = write_pdf(&artifacts[0], "Codex: test", dir.path()).unwrap();

        assert_eq!(path, dir.path().join("Codex_test_pages_1-3.pdf"));
        let doc = Document::load(&path).unwrap();
        assert_eq!(doc.get_pages().len(), 3);
        assert!(!dir.path().join("Codex_test_pages_1-3.pdf.part").exists());
    }

    #[test]
    fn test_existing_output_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let page = jpeg_page(dir.path(), 0, 5);
        let artifacts = assemble(vec![page], &[0], &AssembleOptions::default()).unwrap();
        let first = write_pdf(&artifacts[0], "x", dir.path()).unwrap();
        let second = write_pdf(&artifacts[0], "x", dir.path()).unwrap();
        assert_ne!(first, second);
        assert_eq!(second, dir.path().join("x_pages_1-1_2.pdf"));
    }

    #[test]
    fn test_page_removed_from_work_dir_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let page = jpeg_page(work.path(), 0, 5);
        std::fs::remove_file(&page.path).unwrap();

        let artifacts = assemble(vec![page], &[0], &AssembleOptions::default()).unwrap();
        let err = write_pdf(&artifacts[0], "x", dir.path()).unwrap_err();
        assert!(matches!(err, AssembleError::Io { .. }), "{err:?}");
    }

    #[test]
    fn test_jp2_dimensions_from_header_box() {
        let mut bytes = b"\0\0\0\x0cjP  \r\n\x87\n\0\0\0\x2djp2h\0\0\0\x16ihdr".to_vec();
        bytes.extend_from_slice(&600u32.to_be_bytes());
        bytes.extend_from_slice(&400u32.to_be_bytes());
        assert_eq!(jp2_dimensions(&bytes), Some((400, 600)));
    }

    #[test]
    fn test_jp2_dimensions_from_codestream() {
        let mut bytes = vec![0xFF, 0x4F, 0xFF, 0x51, 0x00, 0x29, 0x00, 0x00];
        for value in [1000u32, 800, 0, 0] {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        assert_eq!(jp2_dimensions(&bytes), Some((1000, 800)));
    }
}
