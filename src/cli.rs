//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use manuscript_core::download::FailurePolicy;
use manuscript_core::manifest::PageRange;
use manuscript_core::profile::MAX_CONCURRENCY;
use manuscript_core::SubmitOptions;

/// Download digitized manuscripts as PDF documents.
///
/// Resolves a digital-library viewer URL (IIIF, ContentDM, Deep Zoom and
/// others) into its page list, downloads every page and writes one or more
/// PDF files.
#[derive(Parser, Debug)]
#[command(name = "manuscript-dl")]
#[command(author, version, about)]
pub struct Args {
    /// Viewer or manifest URL
    #[arg(required_unless_present_any = ["resume", "list"])]
    pub url: Option<String>,

    /// Resume an interrupted, paused, failed or cancelled job by id
    #[arg(long, value_name = "ID", conflicts_with_all = ["url", "list"])]
    pub resume: Option<i64>,

    /// List recent jobs and exit
    #[arg(long, conflicts_with = "url")]
    pub list: bool,

    /// Pages to download, 1-based and inclusive ("5-20" or "7")
    #[arg(short, long, value_name = "RANGE", value_parser = parse_page_range)]
    pub pages: Option<PageRange>,

    /// Split output into documents of at most this many MiB
    #[arg(long, value_name = "MIB", value_parser = clap::value_parser!(u64).range(1..))]
    pub split_mb: Option<u64>,

    /// Lower the per-library page concurrency
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=MAX_CONCURRENCY as i64))]
    pub concurrency: Option<u8>,

    /// Skip failed pages instead of aborting the job
    #[arg(long)]
    pub best_effort: bool,

    /// Keep downloaded pages when the job is cancelled (a pause always keeps them)
    #[arg(long)]
    pub retain_partial: bool,

    /// Ignore the cached manifest and resolve again
    #[arg(long)]
    pub refresh: bool,

    /// Abort the job after this many minutes
    #[arg(long, value_name = "MINUTES", value_parser = clap::value_parser!(u64).range(1..=1440))]
    pub deadline_mins: Option<u64>,

    /// Output directory (overrides the config file)
    #[arg(short, long, value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Config file (default: $XDG_CONFIG_HOME/manuscript-dl/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Job options from the flags.
    pub fn submit_options(&self) -> SubmitOptions {
        SubmitOptions {
            page_range: self.pages,
            output_size_threshold_bytes: self.split_mb.map(|mb| mb * 1024 * 1024),
            max_concurrency_override: self.concurrency.map(usize::from),
            failure_policy: if self.best_effort {
                FailurePolicy::BestEffort
            } else {
                FailurePolicy::AbortOnFirstFailure
            },
            deadline: self.deadline_mins.map(|mins| Duration::from_secs(mins * 60)),
            refresh_manifest: self.refresh,
            retain_partial: self.retain_partial,
        }
    }
}

fn parse_page_range(value: &str) -> Result<PageRange, String> {
    if value.trim().starts_with('0') {
        return Err("pages are numbered from 1".to_string());
    }
    PageRange::parse(value).ok_or_else(|| format!("expected \"START-END\" or \"PAGE\", got \"{value}\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://digi.vatlib.it/view/MSS_Vat.lat.3225";

    #[test]
    fn test_cli_url_only_parses_with_defaults() {
        let args = Args::try_parse_from(["manuscript-dl", URL]).unwrap();
        assert_eq!(args.url.as_deref(), Some(URL));
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert_eq!(args.submit_options(), SubmitOptions::default());
    }

    #[test]
    fn test_cli_url_required_without_resume() {
        let err = Args::try_parse_from(["manuscript-dl"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_resume_without_url() {
        let args = Args::try_parse_from(["manuscript-dl", "--resume", "12"]).unwrap();
        assert_eq!(args.resume, Some(12));
        assert!(args.url.is_none());
    }

    #[test]
    fn test_cli_resume_conflicts_with_url() {
        let err = Args::try_parse_from(["manuscript-dl", URL, "--resume", "1"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_cli_page_range_parsed() {
        let args = Args::try_parse_from(["manuscript-dl", URL, "--pages", "5-20"]).unwrap();
        assert_eq!(args.pages, Some(PageRange::new(5, 20)));
        let args = Args::try_parse_from(["manuscript-dl", URL, "-p", "7"]).unwrap();
        assert_eq!(args.pages, Some(PageRange::new(7, 7)));
    }

    #[test]
    fn test_cli_page_range_rejects_garbage_and_zero() {
        for bad in ["abc", "0-3", "1-x"] {
            let err = Args::try_parse_from(["manuscript-dl", URL, "--pages", bad]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation, "{bad}");
        }
    }

    #[test]
    fn test_cli_flags_map_to_submit_options() {
        let args = Args::try_parse_from([
            "manuscript-dl",
            URL,
            "--split-mb",
            "200",
            "-c",
            "2",
            "--best-effort",
            "--retain-partial",
            "--refresh",
            "--deadline-mins",
            "30",
        ])
        .unwrap();
        let options = args.submit_options();
        assert_eq!(options.output_size_threshold_bytes, Some(200 * 1024 * 1024));
        assert_eq!(options.max_concurrency_override, Some(2));
        assert_eq!(options.failure_policy, FailurePolicy::BestEffort);
        assert!(options.retain_partial);
        assert!(options.refresh_manifest);
        assert_eq!(options.deadline, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_cli_concurrency_bounds() {
        let err = Args::try_parse_from(["manuscript-dl", URL, "-c", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        let err = Args::try_parse_from(["manuscript-dl", URL, "-c", "17"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["manuscript-dl", URL, "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["manuscript-dl", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let err = Args::try_parse_from(["manuscript-dl", URL, "--invalid-flag"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }
}
