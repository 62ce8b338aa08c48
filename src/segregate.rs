//! Size-based segregation into a review subtree.
//!
//! Thresholds `[t0 < t1 < ...]` define buckets `[0, t0)`, `[t0, t1)`, ...
//! Each bucket is a directory `<review root>/below_<tN>`. A file is moved to
//! the bucket containing its size, keeping its path relative to the root.
//! Files at or above the largest threshold stay where they are. Nothing is
//! ever deleted: name clashes at the destination get a numbered suffix.

use crate::error::StageError;
use crate::expand::ArchiveKind;
use crate::report::{StageCounts, StageKind};
use crate::scan::{disambiguate, remove_empty_dirs, TreeScope, WalkOptions};
use crate::size::ByteSize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeBucket {
    pub lower: u64,
    /// Exclusive.
    pub upper: u64,
    pub destination: PathBuf,
}

impl SizeBucket {
    pub fn name(&self) -> String {
        format!("below_{}", ByteSize(self.upper).exact())
    }

    pub fn contains(&self, size: u64) -> bool {
        size >= self.lower && size < self.upper
    }
}

/// Buckets for ascending `thresholds`. Duplicate and zero thresholds are
/// dropped so buckets never overlap and are never empty ranges.
pub fn buckets(review_root: &Path, thresholds: &[u64]) -> Vec<SizeBucket> {
    let mut cuts: Vec<u64> = thresholds.iter().copied().filter(|t| *t > 0).collect();
    cuts.sort_unstable();
    cuts.dedup();
    let mut lower = 0;
    cuts.into_iter()
        .map(|upper| {
            let bucket = SizeBucket {
                lower,
                upper,
                destination: review_root.join(format!("below_{}", ByteSize(upper).exact())),
            };
            lower = upper;
            bucket
        })
        .collect()
}

pub fn bucket_for(buckets: &[SizeBucket], size: u64) -> Option<&SizeBucket> {
    buckets.iter().find(|b| b.contains(size))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegregateOutcome {
    /// Files moved, keyed by bucket directory name.
    pub moved_per_bucket: BTreeMap<String, u64>,
    pub failed: u64,
}

impl SegregateOutcome {
    pub fn moved(&self) -> u64 {
        self.moved_per_bucket.values().sum()
    }
}

impl From<SegregateOutcome> for StageCounts {
    fn from(o: SegregateOutcome) -> Self {
        let moved = o.moved();
        let mut counts = StageCounts {
            attempted: moved + o.failed,
            succeeded: moved,
            failed: o.failed,
            ..Default::default()
        };
        counts.details.extend(o.moved_per_bucket);
        counts
    }
}

#[instrument(name = "segregate", skip_all, fields(buckets = thresholds.len()))]
pub fn segregate(
    scope: &TreeScope,
    review_root: &Path,
    thresholds: &[u64],
) -> Result<SegregateOutcome, StageError> {
    let buckets = buckets(review_root, thresholds);
    let mut outcome = SegregateOutcome::default();
    if buckets.is_empty() {
        info!("No segregation thresholds configured");
        return Ok(outcome);
    }

    let options = WalkOptions {
        max_depth: None,
        skip: vec![review_root.to_path_buf()],
    };
    let files = scope.walk(StageKind::Segregate, &options)?;
    let root = scope.root();

    for file in files.iter().filter(|f| ArchiveKind::detect(&f.path).is_none()) {
        let Some(bucket) = bucket_for(&buckets, file.size) else {
            continue;
        };
        let source = file.absolute(root);
        let destination = disambiguate(&bucket.destination.join(&file.path));
        let moved = destination
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| std::fs::rename(&source, &destination));
        match moved {
            Ok(()) => {
                debug!(from = %file.path.display(), to = %destination.display(), size = file.size, "Segregated");
                *outcome.moved_per_bucket.entry(bucket.name()).or_default() += 1;
            }
            Err(e) => {
                error!(path = %file.path.display(), error = %e, "Failed to move file into review tree");
                outcome.failed += 1;
            }
        }
    }

    let mut keep = vec![review_root.to_path_buf()];
    keep.extend(scope.excluded_relative().into_iter().map(|p| root.join(p)));
    remove_empty_dirs(root, &keep);

    info!(moved = outcome.moved(), failed = outcome.failed, "Segregation finished");
    Ok(outcome)
}
