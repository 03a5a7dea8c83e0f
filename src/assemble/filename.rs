//! Output file naming.

use std::path::{Path, PathBuf};

const MAX_NAME_CHARS: usize = 100;
const FALLBACK_NAME: &str = "manuscript";

/// Filesystem-safe form of a manuscript display name.
///
/// Unsafe characters and whitespace runs become a single `_`; the result is
/// capped at 100 characters and never empty.
#[must_use]
pub fn sanitize_display_name(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    let trimmed: String = out
        .trim_matches(|c| c == '_' || c == '.')
        .chars()
        .take(MAX_NAME_CHARS)
        .collect();
    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed
    }
}

/// `{name}_pages_{first}-{last}.pdf`.
#[must_use]
pub fn artifact_file_name(display_name: &str, first_page: usize, last_page: usize) -> String {
    format!(
        "{}_pages_{first_page}-{last_page}.pdf",
        sanitize_display_name(display_name)
    )
}

/// `dir/filename`, or `dir/stem_N.ext` with the first free `N` from 2.
#[must_use]
pub fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    let base_path = dir.join(filename);
    if !base_path.exists() {
        return base_path;
    }

    let (stem, ext) = match filename.rfind('.') {
        Some(pos) => (&filename[..pos], &filename[pos..]),
        None => (filename, ""),
    };
    for i in 2..1000 {
        let candidate = dir.join(format!("{stem}_{i}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    dir.join(format!("{stem}_{timestamp}{ext}"))
}
