//! CLI entry point for the manuscript downloader.

use std::io::{self, IsTerminal};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use manuscript_core::{EngineConfig, JobId, JobManager, JobStatus};
use tracing::{debug, info, warn};

mod cli;
mod progress_ui;

use cli::Args;
use progress_ui::spawn_progress_ui;

/// Exit code for a job stopped by Ctrl-C, as shells report SIGINT.
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_default()?.0,
    };
    if let Some(out) = &args.out {
        config.output_dir.clone_from(out);
    }

    let manager = config
        .open_manager()
        .await
        .context("failed to start the download engine")?;

    if args.list {
        list_jobs(&manager).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let events = manager.subscribe();
    let id = match (args.resume, &args.url) {
        (Some(id), _) => manager.resume(JobId(id)).await?,
        (None, Some(url)) => manager.submit(url, args.submit_options()).await?,
        (None, None) => anyhow::bail!("a URL or --resume <ID> is required"),
    };
    info!(%id, "job started");

    let show_bar = !args.quiet && io::stderr().is_terminal();
    let progress = spawn_progress_ui(show_bar, events, id);

    let status = tokio::select! {
        status = manager.wait(id) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!(%id, "interrupted, pausing job (press Ctrl-C again to cancel)");
            manager.pause(id);
            tokio::select! {
                status = manager.wait(id) => status?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(%id, "interrupted again, cancelling job");
                    manager.cancel(id);
                    manager.wait(id).await?
                }
            }
        }
    };

    if let Some(handle) = progress {
        let _ = handle.await;
    }

    Ok(report(id, &status))
}

fn report(id: JobId, status: &JobStatus) -> ExitCode {
    match status {
        JobStatus::Completed { artifacts, missing } => {
            for path in artifacts {
                println!("{}", path.display());
            }
            if !missing.is_empty() {
                warn!(%id, pages = ?missing, "some pages could not be downloaded");
            }
            info!(%id, documents = artifacts.len(), "job completed");
            ExitCode::SUCCESS
        }
        JobStatus::Failed { kind, message } => {
            eprintln!("error [{kind}]: {message}");
            eprintln!("  Resume with: manuscript-dl --resume {id}");
            ExitCode::FAILURE
        }
        JobStatus::Cancelled => {
            eprintln!("job {id} cancelled; resume with: manuscript-dl --resume {id}");
            ExitCode::from(EXIT_CANCELLED)
        }
        JobStatus::Paused => {
            eprintln!("job {id} paused; resume with: manuscript-dl --resume {id}");
            ExitCode::from(EXIT_CANCELLED)
        }
    }
}

async fn list_jobs(manager: &JobManager) -> Result<()> {
    for record in manager.store().list(20).await? {
        println!(
            "{}\t{}\t{}\t{}",
            record.id,
            record.status,
            record.display_name.as_deref().unwrap_or("-"),
            record.source_url
        );
    }
    Ok(())
}
