//! Exact-duplicate elimination.
//!
//! Candidates are narrowed by size, hashed with SHA-256 on the blocking pool,
//! and every removal is confirmed byte-for-byte against the retained copy.
//! The retained copy of a group is always the member with the smallest
//! relative path, so repeated runs over the same tree agree on the survivor
//! and a second run removes nothing.

use crate::error::StageError;
use crate::pool::{run_bounded, AbortSignal, TaskResult};
use crate::report::{StageCounts, StageKind};
use crate::scan::{FileEntry, TreeScope, WalkOptions};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupeOutcome {
    pub groups_found: u64,
    pub files_removed: u64,
    pub failed: u64,
}

impl From<DedupeOutcome> for StageCounts {
    fn from(o: DedupeOutcome) -> Self {
        StageCounts {
            attempted: o.files_removed + o.failed,
            succeeded: o.files_removed,
            failed: o.failed,
            ..Default::default()
        }
        .detail("groups_found", o.groups_found)
    }
}

/// A set of byte-identical files; `keep` is the canonical copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub keep: PathBuf,
    pub remove: Vec<PathBuf>,
}

fn sha256_file(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

fn same_content(a: &Path, b: &Path) -> std::io::Result<bool> {
    let mut ra = BufReader::new(File::open(a)?);
    let mut rb = BufReader::new(File::open(b)?);
    let mut ba = [0u8; 64 * 1024];
    let mut bb = [0u8; 64 * 1024];
    loop {
        let na = read_full(&mut ra, &mut ba)?;
        let nb = read_full(&mut rb, &mut bb)?;
        if na != nb || ba[..na] != bb[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Groups byte-identical files. Zero-byte files are never considered.
pub async fn find_duplicates(
    root: &Path,
    files: Vec<FileEntry>,
    parallelism: usize,
) -> Vec<DuplicateGroup> {
    let mut by_size: BTreeMap<u64, Vec<PathBuf>> = BTreeMap::new();
    for file in files.into_iter().filter(|f| f.size > 0) {
        by_size.entry(file.size).or_default().push(file.path);
    }
    let candidates: Vec<(u64, PathBuf)> = by_size
        .into_iter()
        .filter(|(_, paths)| paths.len() > 1)
        .flat_map(|(size, paths)| paths.into_iter().map(move |p| (size, p)))
        .collect();
    debug!(candidates = candidates.len(), "Hashing same-size candidates");

    let hashed: Mutex<BTreeMap<(u64, [u8; 32]), Vec<PathBuf>>> = Mutex::new(BTreeMap::new());
    let abort = AbortSignal::new();
    run_bounded(candidates, parallelism, &abort, |(size, rel)| {
        let hashed = &hashed;
        let abs = root.join(&rel);
        async move {
            let digest = tokio::task::spawn_blocking(move || sha256_file(&abs)).await;
            match digest {
                Ok(Ok(digest)) => {
                    if let Ok(mut map) = hashed.lock() {
                        map.entry((size, digest)).or_default().push(rel);
                    }
                    TaskResult::Succeeded
                }
                Ok(Err(e)) => {
                    warn!(path = %rel.display(), error = %e, "Cannot hash file, leaving it alone");
                    TaskResult::Failed
                }
                Err(e) => {
                    warn!(path = %rel.display(), error = %e, "Hashing task panicked");
                    TaskResult::Failed
                }
            }
        }
    })
    .await;

    let hashed = hashed.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
    hashed
        .into_values()
        .filter(|paths| paths.len() > 1)
        .map(|mut paths| {
            paths.sort();
            let keep = paths.remove(0);
            DuplicateGroup { keep, remove: paths }
        })
        .collect()
}

/// Removes all but the canonical copy of every duplicate group under the
/// scope root.
#[instrument(name = "dedupe", skip_all)]
pub async fn dedupe(scope: &TreeScope, parallelism: usize) -> Result<DedupeOutcome, StageError> {
    let root = scope.root();
    let files = scope.walk(StageKind::Dedupe, &WalkOptions::default())?;
    info!(files = files.len(), "Scanning for exact duplicates");

    let groups = find_duplicates(root, files, parallelism).await;
    let mut outcome = DedupeOutcome {
        groups_found: groups.len() as u64,
        ..Default::default()
    };

    for group in groups {
        let keep = root.join(&group.keep);
        for rel in group.remove {
            let victim = root.join(&rel);
            match same_content(&keep, &victim) {
                Ok(true) => match std::fs::remove_file(&victim) {
                    Ok(()) => {
                        debug!(removed = %rel.display(), kept = %group.keep.display(), "Removed duplicate");
                        outcome.files_removed += 1;
                    }
                    Err(e) => {
                        error!(path = %rel.display(), error = %e, "Failed to remove duplicate");
                        outcome.failed += 1;
                    }
                },
                Ok(false) => {
                    warn!(path = %rel.display(), kept = %group.keep.display(), "Hash match but content differs, keeping both");
                }
                Err(e) => {
                    error!(path = %rel.display(), error = %e, "Failed to verify duplicate");
                    outcome.failed += 1;
                }
            }
        }
    }

    if outcome.failed > 0 {
        scope.check_root()?;
    }
    info!(
        groups = outcome.groups_found,
        removed = outcome.files_removed,
        failed = outcome.failed,
        "Duplicate elimination finished"
    );
    Ok(outcome)
}
