//! Progress bar for a running job.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use manuscript_core::{JobEvent, JobId};
use tokio::sync::broadcast::{self, error::RecvError};

/// Spawns a bar fed by `events` for job `id`.
///
/// Returns `None` when the bar is disabled. The task ends on the job's
/// terminal event or when the channel closes.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    mut events: broadcast::Receiver<JobEvent>,
    id: JobId,
) -> Option<tokio::task::JoinHandle<()>> {
    if !enabled {
        return None;
    }
    Some(tokio::spawn(async move {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(format!("Resolving job {id}..."));
        bar.enable_steady_tick(Duration::from_millis(100));
        let mut sized = false;

        loop {
            match events.recv().await {
                Ok(JobEvent::Progress {
                    job_id,
                    completed,
                    total,
                    eta_seconds,
                    current_page_label,
                }) if job_id == id => {
                    if !sized {
                        bar.set_style(
                            ProgressStyle::with_template(
                                "{spinner} [{bar:30}] {pos}/{len} pages {msg}",
                            )
                            .unwrap_or_else(|_| ProgressStyle::default_bar())
                            .progress_chars("=> "),
                        );
                        sized = true;
                    }
                    bar.set_length(total as u64);
                    bar.set_position(completed as u64);
                    bar.set_message(progress_message(eta_seconds, current_page_label.as_deref()));
                }
                Ok(JobEvent::Terminal { job_id, .. }) if job_id == id => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }

        bar.finish_and_clear();
    }))
}

fn progress_message(eta_seconds: Option<u64>, label: Option<&str>) -> String {
    let eta = eta_seconds.map_or_else(
        || "eta --".to_string(),
        |secs| format!("eta {}m{:02}s", secs / 60, secs % 60),
    );
    match label {
        Some(label) => format!("{label} ({eta})"),
        None => eta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_message_formats_eta() {
        assert_eq!(progress_message(Some(125), Some("f. 3r")), "f. 3r (eta 2m05s)");
        assert_eq!(progress_message(None, None), "eta --");
    }

    #[tokio::test]
    async fn test_disabled_ui_spawns_nothing() {
        let (_tx, rx) = broadcast::channel(4);
        assert!(spawn_progress_ui(false, rx, JobId(1)).is_none());
    }

    #[tokio::test]
    async fn test_ui_stops_on_terminal_event() {
        let (tx, rx) = broadcast::channel(4);
        let handle = spawn_progress_ui(true, rx, JobId(3)).unwrap();
        tx.send(JobEvent::Terminal {
            job_id: JobId(3),
            status: manuscript_core::JobStatus::Cancelled,
        })
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
