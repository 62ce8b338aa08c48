//! Backup-before-destroy: a single zip archive of the whole tree, written
//! before any stage is allowed to change it.

use crate::scan::{disambiguate, TreeScope};
use crate::tools::{Invocation, ToolError, ToolRunner};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, instrument};

pub const ARCHIVER: &str = "zip";

/// A finished, write-once snapshot of the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupArchive {
    pub path: PathBuf,
    pub created_at: DateTime<Local>,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum BackupFailure {
    #[error("archiver `{0}` is not installed")]
    ArchiverUnavailable(String),
    #[error("cannot create backup directory {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archiver failed: {0}")]
    Archiver(#[from] ToolError),
    #[error("archive {0} is missing or empty after the archiver reported success")]
    EmptyArchive(PathBuf),
}

/// `<root name>_<YYYYmmdd_HHMMSS>.zip`
pub fn archive_name(root: &Path, at: DateTime<Local>) -> String {
    let base = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "root".to_string());
    format!("{}_{}.zip", base, at.format("%Y%m%d_%H%M%S"))
}

/// Archives every file under the scope root into `destination`.
///
/// The archiver runs with the root as working directory so stored paths are
/// relative to it. Paths excluded from the scope are kept out of the archive.
#[instrument(name = "backup", skip_all, fields(root = %scope.root().display()))]
pub async fn snapshot(
    scope: &TreeScope,
    destination: &Path,
    tools: &dyn ToolRunner,
) -> Result<BackupArchive, BackupFailure> {
    if !tools.is_available(ARCHIVER) {
        error!(tool = ARCHIVER, "Archiver not found on PATH");
        return Err(BackupFailure::ArchiverUnavailable(ARCHIVER.to_string()));
    }

    std::fs::create_dir_all(destination).map_err(|source| {
        error!(path = %destination.display(), error = %source, "Cannot create backup directory");
        BackupFailure::Destination {
            path: destination.to_path_buf(),
            source,
        }
    })?;

    let created_at = Local::now();
    let archive = disambiguate(&destination.join(archive_name(scope.root(), created_at)));
    info!(archive = %archive.display(), "Creating backup archive");

    let mut invocation = Invocation::new(ARCHIVER)
        .args(["-r", "-q", "-y"])
        .arg(&archive)
        .arg(".")
        .current_dir(scope.root());
    let excluded = scope.excluded_relative();
    if !excluded.is_empty() {
        invocation = invocation.arg("-x");
        for rel in excluded {
            invocation = invocation.arg(rel.join("*")).arg(rel);
        }
    }

    if let Err(e) = tools.invoke(invocation).await {
        error!(error = %e, "Archiver failed");
        // A failed run leaves no archive behind.
        let _ = std::fs::remove_file(&archive);
        return Err(BackupFailure::Archiver(e));
    }

    let size = std::fs::metadata(&archive).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        error!(archive = %archive.display(), "Backup archive missing or empty");
        return Err(BackupFailure::EmptyArchive(archive));
    }

    info!(archive = %archive.display(), size, "Backup archive written");
    Ok(BackupArchive {
        path: archive,
        created_at,
        size,
    })
}
