//! Directory traversal shared by all stages.
//!
//! A [`TreeScope`] is the pipeline root plus the paths no stage may touch
//! (the backup directory and the run log when they live under the root).
//! Each stage takes a fresh listing of [`FileEntry`] values from it.

use crate::error::StageError;
use crate::report::StageKind;
use crate::sniff::ContentType;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A regular file found under the root at the start of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the pipeline root.
    pub path: PathBuf,
    pub size: u64,
    pub content_type: Option<ContentType>,
    /// Stage that produced this listing.
    pub stage: StageKind,
}

impl FileEntry {
    pub fn absolute(&self, root: &Path) -> PathBuf {
        root.join(&self.path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Maximum depth below the root (1 = direct children only).
    pub max_depth: Option<usize>,
    /// Additional absolute subtrees to leave out of this listing.
    pub skip: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TreeScope {
    root: PathBuf,
    excluded: Vec<PathBuf>,
}

impl TreeScope {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excluded: Vec::new(),
        }
    }

    /// Keep `path` out of every listing if it lies under the root.
    pub fn exclude(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if path.starts_with(&self.root) && path != self.root {
            debug!(path = %path.display(), "Excluding path from pipeline scope");
            self.excluded.push(path);
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Excluded paths under the root, relative to it.
    pub fn excluded_relative(&self) -> Vec<PathBuf> {
        self.excluded
            .iter()
            .filter_map(|p| p.strip_prefix(&self.root).ok().map(Path::to_path_buf))
            .collect()
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.excluded.iter().any(|x| path.starts_with(x))
    }

    /// Fails if the root can no longer be listed.
    pub fn check_root(&self) -> Result<(), StageError> {
        std::fs::read_dir(&self.root)
            .map(|_| ())
            .map_err(|e| StageError::root_unreadable(&self.root, e))
    }

    /// Every regular file under the root, sorted by path. Symlinks are not
    /// followed. An unreadable root is fatal; unreadable entries below it are
    /// logged and skipped.
    pub fn walk(&self, stage: StageKind, options: &WalkOptions) -> Result<Vec<FileEntry>, StageError> {
        let mut walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name();
        if let Some(depth) = options.max_depth {
            walker = walker.max_depth(depth);
        }

        let mut files = Vec::new();
        let iter = walker.into_iter().filter_entry(|e| {
            let path = e.path();
            !self.is_excluded(path) && !options.skip.iter().any(|s| path.starts_with(s))
        });
        for entry in iter {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop at root"));
                    return Err(StageError::root_unreadable(&self.root, source));
                }
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping file without metadata");
                    continue;
                }
            };
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            files.push(FileEntry {
                path: relative.to_path_buf(),
                size,
                content_type: None,
                stage,
            });
        }
        debug!(stage = ?stage, count = files.len(), "Listed files");
        Ok(files)
    }
}

/// First free variant of `path`: the path itself, then `stem_1.ext`,
/// `stem_2.ext`, ...
pub fn disambiguate(path: &Path) -> PathBuf {
    disambiguate_by(path, |candidate| candidate.exists())
}

/// Like [`disambiguate`], with `taken` deciding which names are in use.
pub fn disambiguate_by(path: &Path, mut taken: impl FnMut(&Path) -> bool) -> PathBuf {
    if !taken(path) {
        return path.to_path_buf();
    }
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let mut counter = 1u64;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem}_{counter}.{ext}"),
            None => format!("{stem}_{counter}"),
        };
        let candidate = parent.join(name);
        if !taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Removes empty directories below `dir` (never `dir` itself nor anything
/// under `keep`). Returns how many were removed.
pub fn remove_empty_dirs(dir: &Path, keep: &[PathBuf]) -> usize {
    let mut removed = 0;
    let dirs = WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .contents_first(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir());
    for entry in dirs {
        let path = entry.path();
        if keep.iter().any(|k| path.starts_with(k) || k.starts_with(path)) {
            continue;
        }
        // Fails harmlessly when the directory is not empty.
        if std::fs::remove_dir(path).is_ok() {
            debug!(path = %path.display(), "Removed empty directory");
            removed += 1;
        }
    }
    removed
}
