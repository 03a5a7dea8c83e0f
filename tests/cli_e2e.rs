//! End-to-end CLI tests for the manuscript-dl binary.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::fixtures::jpeg_page;
use support::socket_guard::start_mock_server_or_skip;

fn bin() -> Command {
    Command::cargo_bin("manuscript-dl").unwrap()
}

/// Config that keeps every path inside `root`.
fn write_config(root: &Path) -> std::path::PathBuf {
    let config = root.join("config.toml");
    let body = format!(
        "work_dir = {:?}\ndatabase_path = {:?}\noutput_dir = {:?}\n",
        root.join("work"),
        root.join("jobs.db"),
        root.join("out"),
    );
    std::fs::write(&config, body).unwrap();
    config
}

#[test]
fn test_binary_help_displays_usage() {
    bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("manuscript"))
        .stdout(predicate::str::contains("--pages"))
        .stdout(predicate::str::contains("--resume"));
}

#[test]
fn test_binary_version_displays_version() {
    bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("manuscript-dl"));
}

#[test]
fn test_binary_without_url_fails() {
    bin()
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    bin()
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_binary_rejects_bad_page_range() {
    bin()
        .args(["https://example.org/iiif/manifest.json", "--pages", "0-3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--pages"));
}

#[test]
fn test_binary_rejects_missing_config_file() {
    let dir = TempDir::new().unwrap();
    bin()
        .args(["--list", "--config"])
        .arg(dir.path().join("absent.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("absent.toml"));
}

#[test]
fn test_binary_list_on_empty_store_succeeds() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    bin()
        .args(["--list", "-q", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_binary_unsupported_url_fails_with_kind() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    bin()
        .args(["https://unknown-library.example/item/1", "-q", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported_source"))
        .stderr(predicate::str::contains("--resume 1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_binary_downloads_manifest_to_pdf() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let base = server.uri();
    let canvases: Vec<_> = (1..=2)
        .map(|n| {
            json!({
                "label": format!("f. {n}"),
                "images": [{"resource": {"@id": format!("{base}/img/{n}.jpg")}}]
            })
        })
        .collect();
    Mock::given(method("GET"))
        .and(path("/iiif/ms1/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "@context": "http://iiif.io/api/presentation/2/context.json",
            "@type": "sc:Manifest",
            "label": "Psalter",
            "sequences": [{"canvases": canvases}]
        })))
        .mount(&server)
        .await;
    for n in 1..=2u8 {
        Mock::given(method("GET"))
            .and(path(format!("/img/{n}.jpg")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_page(n)))
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    let url = format!("{base}/iiif/ms1/manifest.json");
    let expected = dir.path().join("out").join("Psalter_pages_1-2.pdf");

    let assert = tokio::task::spawn_blocking(move || {
        bin()
            .args([url.as_str(), "-q", "--config"])
            .arg(&config)
            .assert()
    })
    .await
    .unwrap();

    assert
        .success()
        .stdout(predicate::str::contains("Psalter_pages_1-2.pdf"));
    let pdf = lopdf::Document::load(&expected).unwrap();
    assert_eq!(pdf.get_pages().len(), 2);
}
