//! Optional deletion of files below a size threshold.

use crate::error::StageError;
use crate::expand::ArchiveKind;
use crate::report::{StageCounts, StageKind};
use crate::scan::{remove_empty_dirs, TreeScope, WalkOptions};
use crate::size::ByteSize;
use std::path::Path;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub deleted: u64,
    pub failed: u64,
}

impl From<PruneOutcome> for StageCounts {
    fn from(o: PruneOutcome) -> Self {
        StageCounts {
            attempted: o.deleted + o.failed,
            succeeded: o.deleted,
            failed: o.failed,
            ..Default::default()
        }
    }
}

/// Deletes every file strictly smaller than `threshold` bytes. Archives and
/// the review subtree are left alone.
#[instrument(name = "prune", skip_all, fields(threshold = %ByteSize(threshold)))]
pub fn delete_below(
    scope: &TreeScope,
    threshold: u64,
    review_root: &Path,
) -> Result<PruneOutcome, StageError> {
    let options = WalkOptions {
        max_depth: None,
        skip: vec![review_root.to_path_buf()],
    };
    let files = scope.walk(StageKind::Prune, &options)?;
    let mut outcome = PruneOutcome::default();

    for file in files
        .iter()
        .filter(|f| f.size < threshold && ArchiveKind::detect(&f.path).is_none())
    {
        match std::fs::remove_file(file.absolute(scope.root())) {
            Ok(()) => {
                debug!(path = %file.path.display(), size = file.size, "Deleted small file");
                outcome.deleted += 1;
            }
            Err(e) => {
                error!(path = %file.path.display(), error = %e, "Failed to delete small file");
                outcome.failed += 1;
            }
        }
    }

    let mut keep = vec![review_root.to_path_buf()];
    keep.extend(scope.excluded_relative().into_iter().map(|p| scope.root().join(p)));
    remove_empty_dirs(scope.root(), &keep);

    info!(deleted = outcome.deleted, failed = outcome.failed, "Small-file deletion finished");
    Ok(outcome)
}
