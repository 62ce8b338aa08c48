//! Error taxonomy for a pipeline run.
//!
//! - [`PipelineError`] is fatal: the run stops where it is.
//! - [`StageError::Skipped`] means a non-critical stage could not run at all
//!   (usually a missing tool); the run continues.
//! - [`StageError::Interrupted`] is fatal after some work was already done;
//!   it carries the counts reached so far.
//! - File-level failures are not errors at this level: stages count them in
//!   their outcome and carry on.

use crate::backup::BackupFailure;
use crate::report::StageCounts;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("root directory {path} is unreadable: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("backup failed: {0}")]
    Backup(#[from] BackupFailure),
    #[error("stage `{stage}` requires `{tool}`, which is not installed")]
    MissingDependency { stage: &'static str, tool: String },
    #[error("stage `{stage}` aborted: {reason}")]
    Aborted { stage: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage skipped: {0}")]
    Skipped(String),
    #[error(transparent)]
    Fatal(#[from] PipelineError),
    #[error("{source}")]
    Interrupted {
        counts: StageCounts,
        #[source]
        source: PipelineError,
    },
}

impl StageError {
    pub fn root_unreadable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StageError::Fatal(PipelineError::RootUnreadable {
            path: path.into(),
            source,
        })
    }
}
