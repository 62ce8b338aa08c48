//! Random renaming with content-derived extensions.
//!
//! Every file gets a fixed-length decimal identifier that matches no stem in
//! its directory at the moment it is assigned, followed by the extension of
//! its sniffed content type. Archives keep their archive suffix instead.
//! Files whose type is not recognised keep no extension.

use crate::error::StageError;
use crate::expand::ArchiveKind;
use crate::report::StageCounts;
use crate::scan::FileEntry;
use crate::sniff::ContentSniffer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_ID_LENGTH: usize = 10;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameOutcome {
    pub renamed: u64,
    /// Renamed but left without extension.
    pub unrecognized: u64,
    pub failed: u64,
}

impl From<RenameOutcome> for StageCounts {
    fn from(o: RenameOutcome) -> Self {
        StageCounts {
            attempted: o.renamed + o.failed,
            succeeded: o.renamed,
            failed: o.failed,
            ..Default::default()
        }
        .detail("unrecognized", o.unrecognized)
    }
}

#[derive(Debug, Error)]
pub enum RenameError {
    #[error("no free identifier in {dir} after {attempts} attempts")]
    Exhausted { dir: PathBuf, attempts: u32 },
    #[error("cannot read directory {dir}: {source}")]
    ReadDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct Renamer {
    sniffer: Arc<dyn ContentSniffer>,
    id_length: usize,
    max_attempts: u32,
    rng: StdRng,
    /// Stems taken per directory: existing names plus identifiers handed out.
    taken: HashMap<PathBuf, HashSet<String>>,
}

impl Renamer {
    pub fn new(sniffer: Arc<dyn ContentSniffer>, id_length: usize, max_attempts: u32) -> Self {
        Self {
            sniffer,
            id_length: id_length.max(1),
            max_attempts: max_attempts.max(1),
            rng: StdRng::from_entropy(),
            taken: HashMap::new(),
        }
    }

    /// Replaces the random source, for reproducible tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn random_id(&mut self) -> String {
        (0..self.id_length)
            .map(|_| char::from(b'0' + self.rng.gen_range(0..10u8)))
            .collect()
    }

    fn stems_in(dir: &Path) -> Result<HashSet<String>, RenameError> {
        let entries = std::fs::read_dir(dir).map_err(|source| RenameError::ReadDir {
            dir: dir.to_path_buf(),
            source,
        })?;
        Ok(entries
            .filter_map(Result::ok)
            .map(|e| {
                let path = e.path();
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
            .collect())
    }

    /// Draws identifiers until one is free in `dir`, giving up after the
    /// configured number of attempts.
    pub fn assign_id(&mut self, dir: &Path) -> Result<String, RenameError> {
        if !self.taken.contains_key(dir) {
            let stems = Self::stems_in(dir)?;
            self.taken.insert(dir.to_path_buf(), stems);
        }
        for _ in 0..self.max_attempts {
            let candidate = self.random_id();
            let taken = self.taken.entry(dir.to_path_buf()).or_default();
            if taken.insert(candidate.clone()) {
                return Ok(candidate);
            }
        }
        Err(RenameError::Exhausted {
            dir: dir.to_path_buf(),
            attempts: self.max_attempts,
        })
    }

    /// Renames every listed file in place.
    #[instrument(name = "rename", skip_all, fields(files = files.len()))]
    pub async fn rename_flat(
        &mut self,
        root: &Path,
        files: Vec<FileEntry>,
    ) -> Result<RenameOutcome, StageError> {
        let mut outcome = RenameOutcome::default();
        info!("Renaming files to random identifiers");

        for file in files {
            let source = file.absolute(root);
            let dir = source.parent().unwrap_or(root).to_path_buf();

            // Archives keep their suffix so a later run can still expand them.
            let extension = match ArchiveKind::suffix_of(&file.path) {
                Some((_, suffix)) => Some(suffix.to_string()),
                None => match self.sniffer.sniff(&source).await {
                    Ok(kind) => kind.map(|k| format!(".{}", k.extension())),
                    Err(e) => {
                        error!(path = %file.path.display(), error = %e, "Cannot detect content type");
                        outcome.failed += 1;
                        continue;
                    }
                },
            };

            let id = match self.assign_id(&dir) {
                Ok(id) => id,
                Err(e) => {
                    error!(path = %file.path.display(), error = %e, "Identifier space exhausted");
                    outcome.failed += 1;
                    continue;
                }
            };

            let name = match extension {
                Some(extension) => format!("{id}{extension}"),
                None => {
                    warn!(path = %file.path.display(), "Unrecognised content type, leaving without extension");
                    outcome.unrecognized += 1;
                    id
                }
            };
            let target = dir.join(&name);
            if target.exists() {
                error!(path = %file.path.display(), target = %name, "Target name appeared concurrently");
                outcome.failed += 1;
                continue;
            }
            match std::fs::rename(&source, &target) {
                Ok(()) => {
                    debug!(from = %file.path.display(), to = %name, "Renamed");
                    outcome.renamed += 1;
                }
                Err(e) => {
                    error!(path = %file.path.display(), error = %e, "Rename failed");
                    outcome.failed += 1;
                }
            }
        }

        info!(
            renamed = outcome.renamed,
            unrecognized = outcome.unrecognized,
            failed = outcome.failed,
            "Renaming finished"
        );
        Ok(outcome)
    }
}
