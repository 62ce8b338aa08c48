//! Raster format conversion with convert → verify → delete ordering.
//!
//! The converted file is written next to the original under a free name.
//! The original is removed only after the converter exits successfully and
//! the new file is present and non-empty; on any failure the new file is
//! removed instead, so exactly one representation survives.

use crate::config::ConversionRule;
use crate::error::{PipelineError, StageError};
use crate::pool::{run_bounded, AbortSignal, TaskResult};
use crate::report::StageCounts;
use crate::scan::{disambiguate_by, FileEntry, TreeScope};
use crate::tools::{Invocation, ToolRunner};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// ImageMagick 7 entry point, then the ImageMagick 6 one.
pub const CONVERTERS: [&str; 2] = ["magick", "convert"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertOutcome {
    pub converted: u64,
    pub failed: u64,
}

impl ConvertOutcome {
    pub fn absorb(&mut self, other: ConvertOutcome) {
        self.converted += other.converted;
        self.failed += other.failed;
    }
}

impl From<ConvertOutcome> for StageCounts {
    fn from(o: ConvertOutcome) -> Self {
        StageCounts {
            attempted: o.converted + o.failed,
            succeeded: o.converted,
            failed: o.failed,
            ..Default::default()
        }
    }
}

pub struct FormatConverter<'a> {
    scope: &'a TreeScope,
    tools: &'a dyn ToolRunner,
    program: &'static str,
    parallelism: usize,
    /// Paths consumed or produced during this run; never converted again.
    touched: Mutex<HashSet<PathBuf>>,
}

impl<'a> FormatConverter<'a> {
    /// Picks the first installed converter; `Skipped` when none is.
    pub fn new(
        scope: &'a TreeScope,
        tools: &'a dyn ToolRunner,
        parallelism: usize,
    ) -> Result<Self, StageError> {
        let program = CONVERTERS
            .into_iter()
            .find(|tool| tools.is_available(tool))
            .ok_or_else(|| {
                warn!("No image converter installed (magick/convert)");
                StageError::Skipped("no image converter installed".into())
            })?;
        Ok(Self {
            scope,
            tools,
            program,
            parallelism,
            touched: Mutex::new(HashSet::new()),
        })
    }

    fn qualifies(&self, file: &FileEntry, rule: &ConversionRule) -> bool {
        file.content_type == Some(rule.from) && rule.size.contains(file.size)
    }

    fn claim(&self, path: &Path) -> bool {
        match self.touched.lock() {
            Ok(mut touched) => touched.insert(path.to_path_buf()),
            Err(_) => false,
        }
    }

    /// Picks the output name for `source` and records it, so concurrent
    /// conversions in the same directory never share a target.
    fn reserve_target(&self, source: &Path, rule: &ConversionRule) -> PathBuf {
        let root = self.scope.root();
        let mut touched = self
            .touched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let target = disambiguate_by(&source.with_extension(rule.to.extension()), |candidate| {
            candidate.exists()
                || candidate
                    .strip_prefix(root)
                    .is_ok_and(|rel| touched.contains(rel))
        });
        if let Ok(rel) = target.strip_prefix(root) {
            touched.insert(rel.to_path_buf());
        }
        target
    }

    /// Converts every file in `files` that matches `rule`. Files need their
    /// `content_type` filled in.
    #[instrument(name = "convert", skip_all, fields(rule = %rule))]
    pub async fn convert(&self, files: &[FileEntry], rule: &ConversionRule) -> Result<ConvertOutcome, StageError> {
        let selected: Vec<&FileEntry> = files
            .iter()
            .filter(|f| self.qualifies(f, rule))
            .filter(|f| self.claim(&f.path))
            .collect();
        info!(candidates = selected.len(), tool = self.program, "Converting files");

        let root = self.scope.root();
        let abort = AbortSignal::new();
        let tally = run_bounded(selected, self.parallelism, &abort, |file| async move {
            let source = file.absolute(root);
            let target = self.reserve_target(&source, rule);
            let invocation = Invocation::new(self.program).arg(&source).arg(&target);

            if let Err(e) = self.tools.invoke(invocation).await {
                error!(path = %file.path.display(), error = %e, "Conversion failed, original kept");
                discard(&target);
                return match self.scope.check_root() {
                    Ok(()) => TaskResult::Failed,
                    Err(fatal) => TaskResult::Fatal(fatal.to_string()),
                };
            }

            let written = std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
            if written == 0 {
                error!(path = %file.path.display(), target = %target.display(), "Converter reported success but wrote nothing");
                discard(&target);
                return TaskResult::Failed;
            }

            match std::fs::remove_file(&source) {
                Ok(()) => {
                    debug!(from = %file.path.display(), to = %target.display(), bytes = written, "Converted");
                    TaskResult::Succeeded
                }
                Err(e) => {
                    error!(path = %file.path.display(), error = %e, "Cannot remove original, dropping converted copy");
                    discard(&target);
                    TaskResult::Failed
                }
            }
        })
        .await;

        let outcome = ConvertOutcome {
            converted: tally.succeeded,
            failed: tally.failed,
        };
        if let Some(reason) = tally.fatal {
            return Err(StageError::Interrupted {
                counts: outcome.into(),
                source: PipelineError::Aborted {
                    stage: "convert",
                    reason,
                },
            });
        }
        info!(converted = outcome.converted, failed = outcome.failed, "Rule finished");
        Ok(outcome)
    }
}

fn discard(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Could not remove partial conversion output");
        }
    }
}
