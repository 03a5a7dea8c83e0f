//! Integration tests for ordering, splitting and PDF output.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageFormat, RgbImage};
use tempfile::TempDir;

use manuscript_core::ErrorKind;
use manuscript_core::assemble::{AssembleError, AssembleOptions, assemble, write_artifacts};
use manuscript_core::download::{FailurePolicy, PageData, PageFormat, page_file_name};
mod support;
use support::fixtures::jpeg_page;

const KIB: usize = 1024;

fn sized_bytes(index: usize, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    bytes[..8].copy_from_slice(&(index as u64).to_le_bytes());
    bytes
}

/// Page metadata only; nothing is written, so these pages cannot be embedded.
fn sized_page(index: usize, len: usize) -> PageData {
    PageData::new(
        index,
        format!("f. {}", index + 1),
        PageFormat::Jpeg,
        format!("page_{:05}.jpg", index + 1),
        &sized_bytes(index, len),
    )
}

/// Writes `bytes` into `work` the way the downloader stores pages.
fn stored(work: &Path, index: usize, format: PageFormat, bytes: &[u8]) -> PageData {
    let path = work.join(page_file_name(index, format));
    std::fs::write(&path, bytes).unwrap();
    PageData::new(index, format!("p. {}", index + 1), format, path, bytes)
}

fn jpeg(work: &Path, index: usize) -> PageData {
    stored(work, index, PageFormat::Jpeg, &jpeg_page(index as u8))
}

fn png(work: &Path, index: usize) -> PageData {
    let image = RgbImage::from_fn(200, 300, |x, y| image::Rgb([(x % 256) as u8, (y % 256) as u8, 7]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    stored(work, index, PageFormat::Png, &bytes)
}

fn pdf_page_count(path: &std::path::Path) -> usize {
    lopdf::Document::load(path).unwrap().get_pages().len()
}

#[test]
fn test_split_threshold_gives_three_contiguous_artifacts() {
    // 500 pages against a threshold of 200 pages' worth of bytes.
    let pages: Vec<PageData> = (0..500).map(|i| sized_page(i, KIB)).collect();
    let expected: Vec<usize> = (0..500).collect();
    let options = AssembleOptions {
        split_threshold_bytes: Some(200 * KIB as u64),
        ..AssembleOptions::default()
    };

    let artifacts = assemble(pages, &expected, &options).unwrap();

    let ranges: Vec<(usize, usize)> = artifacts.iter().map(|a| (a.first_page, a.last_page)).collect();
    assert_eq!(ranges, vec![(1, 200), (201, 400), (401, 500)]);
    assert!(artifacts.iter().all(|a| a.total_bytes <= 200 * KIB as u64));
    assert_eq!(artifacts[2].label, "pages 401-500");
}

#[test]
fn test_pages_arrive_out_of_order_but_artifact_is_ordered() {
    let pages = vec![sized_page(2, KIB), sized_page(0, KIB), sized_page(1, KIB)];
    let artifacts = assemble(pages, &[0, 1, 2], &AssembleOptions::default()).unwrap();
    let order: Vec<usize> = artifacts[0].pages.iter().map(|p| p.index).collect();
    assert_eq!(order, vec![0, 1, 2]);
}

#[test]
fn test_missing_page_aborts_with_one_based_numbers() {
    let pages = vec![sized_page(0, KIB), sized_page(2, KIB)];
    let err = assemble(pages, &[0, 1, 2], &AssembleOptions::default()).unwrap_err();
    assert!(matches!(&err, AssembleError::IncompletePageSet { missing } if missing == &vec![2]));
    assert_eq!(err.kind(), ErrorKind::IncompletePageSet);
}

#[test]
fn test_consecutive_identical_pages_are_rejected() {
    let second = PageData::new(1, "f. 2", PageFormat::Jpeg, "page_00002.jpg", &sized_bytes(0, KIB));
    let err = assemble(vec![sized_page(0, KIB), second], &[0, 1], &AssembleOptions::default())
        .unwrap_err();
    assert!(matches!(err, AssembleError::DuplicatePage { first: 1, second: 2 }));
}

#[test]
fn test_pdfs_written_per_artifact_with_mixed_formats() {
    let out = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let w = work.path();
    let pages = vec![jpeg(w, 0), png(w, 1), jpeg(w, 2), png(w, 3)];
    let threshold = pages[0].size + pages[1].size;
    let options = AssembleOptions {
        split_threshold_bytes: Some(threshold),
        ..AssembleOptions::default()
    };

    let artifacts = assemble(pages, &[0, 1, 2, 3], &options).unwrap();
    let paths = write_artifacts(&artifacts, "Codex: Test/Draft", out.path()).unwrap();

    assert!(paths.len() >= 2);
    let total: usize = paths.iter().map(|p| pdf_page_count(p)).sum();
    assert_eq!(total, 4);
    let first = paths[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(first.starts_with("Codex_"), "{first}");
    assert!(first.ends_with(&format!("_pages_1-{}.pdf", artifacts[0].last_page)), "{first}");
    assert!(!first.contains('/') && !first.contains(':'));
    // No temporary files are left behind.
    let leftovers = std::fs::read_dir(out.path())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().path().to_string_lossy().ends_with(".part"))
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn test_best_effort_pdf_skips_missing_pages() {
    let out = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let options = AssembleOptions {
        failure_policy: FailurePolicy::BestEffort,
        ..AssembleOptions::default()
    };

    let pages = vec![jpeg(work.path(), 0), jpeg(work.path(), 2)];
    let artifacts = assemble(pages, &[0, 1, 2], &options).unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].skipped, vec![2]);

    let paths = write_artifacts(&artifacts, "Gappy", out.path()).unwrap();
    assert_eq!(pdf_page_count(&paths[0]), 2);
    assert!(paths[0].ends_with("Gappy_pages_1-3.pdf"));
}

#[test]
fn test_existing_output_is_not_overwritten() {
    let out = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    std::fs::write(out.path().join("Same_pages_1-1.pdf"), b"keep me").unwrap();

    let artifacts =
        assemble(vec![jpeg(work.path(), 0)], &[0], &AssembleOptions::default()).unwrap();
    let paths = write_artifacts(&artifacts, "Same", out.path()).unwrap();

    assert_eq!(paths[0], out.path().join("Same_pages_1-1_2.pdf"));
    assert_eq!(std::fs::read(out.path().join("Same_pages_1-1.pdf")).unwrap(), b"keep me");
}
