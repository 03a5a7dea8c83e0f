//! Per-page task state machine.
//!
//! ```text
//! Pending -> Fetching -> Validating -> Done
//!               |            |  \-> Fetching (validation retry)
//!               |            \-> Failed
//!               \-> Stitching -> Done | Failed
//!               \-> Failed
//! ```

use std::fmt;

use thiserror::Error;

use crate::error::ErrorKind;

/// Lifecycle state of one page download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Scheduled, not started.
    Pending,
    /// Request in flight.
    Fetching,
    /// Body being checked.
    Validating,
    /// Tiles being fetched and composited.
    Stitching,
    /// Bytes accepted.
    Done,
    /// Given up.
    Failed {
        /// Why.
        kind: ErrorKind,
        /// Validation retries spent.
        retries_used: u32,
    },
}

impl TaskState {
    /// Returns true for `Done` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Validating => "validating",
            Self::Stitching => "stitching",
            Self::Done => "done",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Attempted transition that the state machine does not allow.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("page {index}: illegal task transition {from} -> {to}")]
pub struct TransitionError {
    /// Page index.
    pub index: usize,
    /// Current state.
    pub from: TaskState,
    /// Rejected target.
    pub to: TaskState,
}

/// One page's download, owned by the worker that runs it.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    index: usize,
    state: TaskState,
    retries_used: u32,
}

impl DownloadTask {
    /// New task in `Pending`.
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: TaskState::Pending,
            retries_used: 0,
        }
    }

    /// Page index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Validation retries spent so far.
    #[must_use]
    pub fn retries_used(&self) -> u32 {
        self.retries_used
    }

    /// Moves to `to` if the transition is legal.
    ///
    /// `Validating -> Fetching` counts as a retry.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] and leaves the state unchanged otherwise.
    pub fn transition(&mut self, to: TaskState) -> Result<(), TransitionError> {
        use TaskState::{Done, Failed, Fetching, Pending, Stitching, Validating};

        let legal = matches!(
            (self.state, to),
            (Pending, Fetching)
                | (Fetching, Validating | Stitching | Failed { .. })
                | (Validating, Done | Fetching | Failed { .. })
                | (Stitching, Done | Failed { .. })
        );
        if !legal {
            return Err(TransitionError {
                index: self.index,
                from: self.state,
                to,
            });
        }
        if (self.state, to) == (Validating, Fetching) {
            self.retries_used += 1;
        }
        self.state = to;
        Ok(())
    }

    /// Moves to `Failed` with the current retry count.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] from a state that cannot fail.
    pub fn fail(&mut self, kind: ErrorKind) -> Result<(), TransitionError> {
        self.transition(TaskState::Failed {
            kind,
            retries_used: self.retries_used,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_page_happy_path_with_retry() {
        let mut task = DownloadTask::new(3);
        task.transition(TaskState::Fetching).unwrap();
        task.transition(TaskState::Validating).unwrap();
        task.transition(TaskState::Fetching).unwrap();
        task.transition(TaskState::Validating).unwrap();
        task.transition(TaskState::Done).unwrap();
        assert_eq!(task.retries_used(), 1);
        assert!(task.state().is_terminal());
    }

    #[test]
    fn test_tiled_page_path() {
        let mut task = DownloadTask::new(0);
        task.transition(TaskState::Fetching).unwrap();
        task.transition(TaskState::Stitching).unwrap();
        task.fail(ErrorKind::PartialTileFailure).unwrap();
        assert_eq!(
            task.state(),
            TaskState::Failed {
                kind: ErrorKind::PartialTileFailure,
                retries_used: 0
            }
        );
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut task = DownloadTask::new(7);
        let err = task.transition(TaskState::Done).unwrap_err();
        assert_eq!(err.from, TaskState::Pending);
        assert_eq!(task.state(), TaskState::Pending);
        assert!(err.to_string().contains("pending -> done"));

        task.transition(TaskState::Fetching).unwrap();
        task.transition(TaskState::Validating).unwrap();
        task.transition(TaskState::Done).unwrap();
        assert!(task.transition(TaskState::Fetching).is_err());
        assert!(task.fail(ErrorKind::NetworkError).is_err());
    }
}
