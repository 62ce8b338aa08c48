//! Archive expansion in place.
//!
//! Every recognised archive is expanded into the directory that contains it,
//! overwriting existing files of the same name, and is deleted only when its
//! expander exits successfully. Archives in different directories never
//! share a target; archives in the same directory race with last-writer-wins
//! semantics on colliding entries.

use crate::error::{PipelineError, StageError};
use crate::pool::{run_bounded, AbortSignal, TaskResult};
use crate::report::{StageCounts, StageKind};
use crate::scan::{FileEntry, TreeScope, WalkOptions};
use crate::tools::{Invocation, ToolRunner};
use std::path::Path;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    Zip,
    Tar,
    SevenZip,
    Rar,
}

const SUFFIXES: [(&str, ArchiveKind); 10] = [
    (".zip", ArchiveKind::Zip),
    (".tar", ArchiveKind::Tar),
    (".tar.gz", ArchiveKind::Tar),
    (".tgz", ArchiveKind::Tar),
    (".tar.bz2", ArchiveKind::Tar),
    (".tbz2", ArchiveKind::Tar),
    (".tar.xz", ArchiveKind::Tar),
    (".txz", ArchiveKind::Tar),
    (".7z", ArchiveKind::SevenZip),
    (".rar", ArchiveKind::Rar),
];

impl ArchiveKind {
    /// Recognises archives by (case-insensitive) file name suffix.
    pub fn detect(path: &Path) -> Option<Self> {
        Self::suffix_of(path).map(|(kind, _)| kind)
    }

    /// The kind and the lowercase suffix that identified it, e.g.
    /// `(Tar, ".tar.gz")` for `Pics.TAR.GZ`.
    pub fn suffix_of(path: &Path) -> Option<(Self, &'static str)> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        SUFFIXES
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix))
            .map(|&(suffix, kind)| (kind, suffix))
    }

    pub fn tool(self) -> &'static str {
        match self {
            ArchiveKind::Zip => "unzip",
            ArchiveKind::Tar => "tar",
            ArchiveKind::SevenZip => "7z",
            ArchiveKind::Rar => "unrar",
        }
    }

    /// Command that expands `archive` into `dir`, overwriting without asking.
    pub fn invocation(self, archive: &Path, dir: &Path) -> Invocation {
        match self {
            ArchiveKind::Zip => Invocation::new("unzip")
                .args(["-o", "-q"])
                .arg(archive)
                .arg("-d")
                .arg(dir),
            ArchiveKind::Tar => Invocation::new("tar")
                .arg("-xf")
                .arg(archive)
                .arg("-C")
                .arg(dir),
            ArchiveKind::SevenZip => {
                let mut out = std::ffi::OsString::from("-o");
                out.push(dir);
                Invocation::new("7z").args(["x", "-y"]).arg(out).arg(archive)
            }
            ArchiveKind::Rar => {
                let mut out = dir.as_os_str().to_os_string();
                out.push(std::path::MAIN_SEPARATOR_STR);
                Invocation::new("unrar")
                    .args(["x", "-o+", "-y"])
                    .arg(archive)
                    .arg(out)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpandOutcome {
    pub expanded: u64,
    pub failed: u64,
    /// Archives whose expander is not installed.
    pub skipped: u64,
}

impl From<ExpandOutcome> for StageCounts {
    fn from(o: ExpandOutcome) -> Self {
        StageCounts {
            attempted: o.expanded + o.failed,
            succeeded: o.expanded,
            failed: o.failed,
            ..Default::default()
        }
        .detail("skipped_no_tool", o.skipped)
    }
}

/// Lists the archives under the root, to `max_depth` levels.
pub fn find_archives(scope: &TreeScope, max_depth: usize) -> Result<Vec<(FileEntry, ArchiveKind)>, StageError> {
    let options = WalkOptions {
        max_depth: Some(max_depth),
        skip: Vec::new(),
    };
    Ok(scope
        .walk(StageKind::Expand, &options)?
        .into_iter()
        .filter_map(|f| ArchiveKind::detect(&f.path).map(|k| (f, k)))
        .collect())
}

#[instrument(name = "expand", skip_all)]
pub async fn expand_all(
    scope: &TreeScope,
    max_depth: usize,
    parallelism: usize,
    tools: &dyn ToolRunner,
) -> Result<ExpandOutcome, StageError> {
    let archives = find_archives(scope, max_depth)?;
    if archives.is_empty() {
        info!("No archives found");
        return Ok(ExpandOutcome::default());
    }

    let kinds = [ArchiveKind::Zip, ArchiveKind::Tar, ArchiveKind::SevenZip, ArchiveKind::Rar];
    let available: Vec<ArchiveKind> = kinds
        .into_iter()
        .filter(|k| tools.is_available(k.tool()))
        .collect();
    if available.is_empty() {
        warn!(archives = archives.len(), "No archive expander installed");
        return Err(StageError::Skipped("no archive expander installed".into()));
    }
    info!(archives = archives.len(), parallelism, "Expanding archives");

    let root = scope.root();
    let abort = AbortSignal::new();
    let tally = run_bounded(archives, parallelism, &abort, |(entry, kind)| {
        let available = &available;
        async move {
            if !available.contains(&kind) {
                warn!(archive = %entry.path.display(), tool = kind.tool(), "Expander not installed, leaving archive");
                return TaskResult::Skipped;
            }
            let archive = entry.absolute(root);
            let dir = archive.parent().unwrap_or(root).to_path_buf();
            match tools.invoke(kind.invocation(&archive, &dir)).await {
                Ok(_) => match std::fs::remove_file(&archive) {
                    Ok(()) => {
                        debug!(archive = %entry.path.display(), "Expanded and removed archive");
                        TaskResult::Succeeded
                    }
                    Err(e) => {
                        error!(archive = %entry.path.display(), error = %e, "Expanded but could not remove archive");
                        TaskResult::Failed
                    }
                },
                Err(e) => {
                    error!(archive = %entry.path.display(), error = %e, "Expansion failed, archive kept");
                    match scope.check_root() {
                        Ok(()) => TaskResult::Failed,
                        Err(fatal) => TaskResult::Fatal(fatal.to_string()),
                    }
                }
            }
        }
    })
    .await;

    let outcome = ExpandOutcome {
        expanded: tally.succeeded,
        failed: tally.failed,
        skipped: tally.skipped,
    };
    if let Some(reason) = tally.fatal {
        return Err(StageError::Interrupted {
            counts: outcome.into(),
            source: PipelineError::Aborted {
                stage: "expand",
                reason,
            },
        });
    }
    info!(
        expanded = outcome.expanded,
        failed = outcome.failed,
        skipped = outcome.skipped,
        "Archive expansion finished"
    );
    Ok(outcome)
}
