//! Error taxonomy for the iteration controller and its collaborators.
//!
//! One enum, one variant per error kind named by the design: not-a-repo,
//! no-commits, no-changes, commit-failed, branch-exists, task-not-found,
//! validation-error, graph-cycle, missing-dependency, subprocess-spawn,
//! subprocess-nonzero, context-cancelled, context-deadline, io-error,
//! parse-error.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type RalphResult<T> = Result<T, RalphError>;

#[derive(Error, Debug)]
pub enum RalphError {
    #[error("not a git repository at {path}")]
    NotARepo { path: PathBuf },

    #[error("repository has no commits yet")]
    NoCommits,

    #[error("no changes to commit")]
    NoChanges,

    #[error("commit failed: {message}")]
    CommitFailed { message: String },

    #[error("branch already exists: {name}")]
    BranchExists { name: String },

    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    #[error("validation error: {message}")]
    ValidationError { message: String },

    #[error("dependency graph has a cycle: {}", .path.join(" -> "))]
    GraphCycle { path: Vec<String> },

    #[error("task {task} depends on unknown task {missing}")]
    MissingDependency { task: String, missing: String },

    #[error("failed to spawn subprocess {command}: {message}")]
    SubprocessSpawn { command: String, message: String },

    #[error("subprocess {command} exited non-zero ({code:?}); stderr tail: {stderr_tail}")]
    SubprocessNonzero {
        command: String,
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("operation cancelled")]
    ContextCancelled,

    #[error("operation exceeded its deadline")]
    ContextDeadline,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {message}")]
    ParseError { message: String },
}

impl From<serde_json::Error> for RalphError {
    fn from(e: serde_json::Error) -> Self {
        RalphError::ParseError {
            message: e.to_string(),
        }
    }
}

impl RalphError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
        }
    }

    /// Whether the controller is expected to recover locally from this error
    /// rather than surface it as a fatal loop error (see design §7).
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoChanges | Self::ContextDeadline | Self::SubprocessNonzero { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_cycle_message_joins_path() {
        let err = RalphError::GraphCycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency graph has a cycle: a -> b -> a");
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: RalphError = io_err.into();
        assert!(matches!(err, RalphError::Io(_)));
    }

    #[test]
    fn locally_recoverable_classification() {
        assert!(RalphError::NoChanges.is_locally_recoverable());
        assert!(RalphError::ContextDeadline.is_locally_recoverable());
        assert!(!RalphError::NoCommits.is_locally_recoverable());
    }
}
