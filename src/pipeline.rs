//! Stage orchestration.
//!
//! Stages run strictly one after another over the same root:
//!
//! ```text
//! backup -> dedupe -> expand -> dedupe -> [prune -> dedupe] -> rename
//!        -> convert -> segregate -> scrub -> dedupe
//! ```
//!
//! The filesystem is the only state passed between stages. A fatal error
//! stops the run where it is; the report is still filled in and says why.

use crate::backup::{snapshot, BackupArchive, BackupFailure, ARCHIVER};
use crate::config::PipelineConfig;
use crate::convert::{ConvertOutcome, FormatConverter};
use crate::dedupe::dedupe;
use crate::error::{PipelineError, StageError};
use crate::expand::expand_all;
use crate::prune::delete_below;
use crate::rename::{RenameOutcome, Renamer};
use crate::report::{PipelineReport, StageCounts, StageKind};
use crate::scan::{FileEntry, TreeScope, WalkOptions};
use crate::scrub::scrub;
use crate::segregate::segregate;
use crate::size::{size_of, ByteSize};
use crate::sniff::{ContentSniffer, FileCommandSniffer, MagicSniffer, SnifferKind};
use crate::tools::ToolRunner;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

pub struct Pipeline {
    config: PipelineConfig,
    tools: Arc<dyn ToolRunner>,
    sniffer: Arc<dyn ContentSniffer>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, tools: Arc<dyn ToolRunner>) -> Self {
        let sniffer: Arc<dyn ContentSniffer> = match config.sniffer {
            SnifferKind::Builtin => Arc::new(MagicSniffer),
            SnifferKind::File => Arc::new(FileCommandSniffer::new(tools.clone())),
        };
        Self {
            config,
            tools,
            sniffer,
        }
    }

    /// Replaces the content sniffer chosen from the config.
    pub fn with_sniffer(mut self, sniffer: Arc<dyn ContentSniffer>) -> Self {
        self.sniffer = sniffer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[instrument(name = "pipeline", skip_all, fields(root = %root.display()))]
    pub async fn run(&self, root: &Path) -> PipelineReport {
        let started = Instant::now();
        let mut report = PipelineReport::new(root);
        info!(run_id = %report.run_id, "Pipeline run started");

        if let Err(e) = self.run_stages(root, &mut report).await {
            error!(error = %e, "Pipeline run aborted");
            report.aborted = Some(e.to_string());
        }

        report.bytes_after = size_of(&report.root).ok();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            outcome = ?report.outcome(),
            failed = report.total_failed(),
            bytes_before = ?report.bytes_before.map(ByteSize),
            bytes_after = ?report.bytes_after.map(ByteSize),
            elapsed_ms = report.elapsed_ms,
            "Pipeline run finished"
        );
        report
    }

    async fn run_stages(&self, root: &Path, report: &mut PipelineReport) -> Result<(), PipelineError> {
        let root = std::fs::canonicalize(root).map_err(|source| PipelineError::RootUnreadable {
            path: root.to_path_buf(),
            source,
        })?;
        std::fs::read_dir(&root).map_err(|source| PipelineError::RootUnreadable {
            path: root.clone(),
            source,
        })?;
        report.root = root.clone();
        report.bytes_before = size_of(&root).ok();

        let backup_dir = self.config.backup_dir_for(&root);
        std::fs::create_dir_all(&backup_dir).map_err(|source| BackupFailure::Destination {
            path: backup_dir.clone(),
            source,
        })?;
        let backup_dir = std::fs::canonicalize(&backup_dir).unwrap_or(backup_dir);

        let mut scope = TreeScope::new(&root);
        scope.exclude(backup_dir.clone());
        if let Some(log_file) = &self.config.log_file {
            scope.exclude(std::fs::canonicalize(log_file).unwrap_or_else(|_| log_file.clone()));
        }
        let review_root = root.join(&self.config.review_dir);

        let started = Instant::now();
        let backup = self.backup(&scope, &backup_dir).await;
        let backup = backup.map(|archive| {
            let counts = StageCounts {
                attempted: 1,
                succeeded: 1,
                ..Default::default()
            }
            .detail("bytes", archive.size);
            report.backup = Some(archive);
            counts
        });
        record(report, StageKind::Backup, "backup", backup, started)?;

        self.dedupe_pass(&scope, "dedupe:initial", report).await?;

        let started = Instant::now();
        let expanded = expand_all(
            &scope,
            self.config.archive_search_depth,
            self.config.parallelism,
            self.tools.as_ref(),
        )
        .await;
        record(report, StageKind::Expand, "expand", expanded, started)?;

        self.dedupe_pass(&scope, "dedupe:post-expand", report).await?;

        if let Some(threshold) = self.config.delete_threshold() {
            let started = Instant::now();
            let pruned = delete_below(&scope, threshold, &review_root);
            record(report, StageKind::Prune, "prune", pruned, started)?;
            self.dedupe_pass(&scope, "dedupe:post-prune", report).await?;
        }

        let started = Instant::now();
        let renamed = self.rename(&scope).await;
        record(report, StageKind::Rename, "rename", renamed, started)?;

        let started = Instant::now();
        let converted = self.convert(&scope).await;
        record(report, StageKind::Convert, "convert", converted, started)?;

        let started = Instant::now();
        let segregated = segregate(&scope, &review_root, &self.config.segregate_below);
        record(report, StageKind::Segregate, "segregate", segregated, started)?;

        let started = Instant::now();
        let scrubbed = scrub(&scope, self.tools.as_ref()).await;
        record(report, StageKind::Scrub, "scrub", scrubbed, started)?;

        self.dedupe_pass(&scope, "dedupe:final", report).await
    }

    async fn backup(&self, scope: &TreeScope, backup_dir: &Path) -> Result<BackupArchive, StageError> {
        if !self.tools.is_available(ARCHIVER) {
            error!(tool = ARCHIVER, "Archiver not found on PATH");
            return Err(PipelineError::Backup(BackupFailure::ArchiverUnavailable(ARCHIVER.to_string())).into());
        }
        let files = scope.walk(StageKind::Backup, &WalkOptions::default())?;
        if files.is_empty() {
            info!("Root holds no files, nothing to back up");
            return Err(StageError::Skipped("no files to back up".into()));
        }
        snapshot(scope, backup_dir, self.tools.as_ref())
            .await
            .map_err(|e| StageError::Fatal(PipelineError::Backup(e)))
    }

    async fn dedupe_pass(
        &self,
        scope: &TreeScope,
        label: &'static str,
        report: &mut PipelineReport,
    ) -> Result<(), PipelineError> {
        if !self.config.dedup_between_stages && label != "dedupe:final" {
            debug!(pass = label, "Intermediate duplicate elimination disabled");
            return Ok(());
        }
        let started = Instant::now();
        let outcome = dedupe(scope, self.config.parallelism).await;
        record(report, StageKind::Dedupe, label, outcome, started)
    }

    async fn rename(&self, scope: &TreeScope) -> Result<RenameOutcome, StageError> {
        if self.config.sniffer == SnifferKind::File && !self.tools.is_available(FileCommandSniffer::TOOL) {
            return Err(StageError::Fatal(PipelineError::MissingDependency {
                stage: "rename",
                tool: FileCommandSniffer::TOOL.to_string(),
            }));
        }
        let files = scope.walk(StageKind::Rename, &WalkOptions::default())?;
        let mut renamer = Renamer::new(
            self.sniffer.clone(),
            self.config.rename_id_length,
            self.config.rename_max_attempts,
        );
        renamer.rename_flat(scope.root(), files).await
    }

    async fn convert(&self, scope: &TreeScope) -> Result<ConvertOutcome, StageError> {
        if self.config.conversion_rules.is_empty() {
            info!("No conversion rules configured");
            return Ok(ConvertOutcome::default());
        }
        let converter = FormatConverter::new(scope, self.tools.as_ref(), self.config.parallelism)?;
        let files = self.sniffed(scope).await?;

        let mut outcome = ConvertOutcome::default();
        for rule in &self.config.conversion_rules {
            match converter.convert(&files, rule).await {
                Ok(rule_outcome) => outcome.absorb(rule_outcome),
                Err(StageError::Interrupted { counts, source }) => {
                    let mut total = StageCounts::from(outcome);
                    total.absorb(counts);
                    return Err(StageError::Interrupted { counts: total, source });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Fresh listing with content types filled in. Files that cannot be
    /// sniffed keep `None` and match no rule.
    async fn sniffed(&self, scope: &TreeScope) -> Result<Vec<FileEntry>, StageError> {
        let files = scope.walk(StageKind::Convert, &WalkOptions::default())?;
        let root: PathBuf = scope.root().to_path_buf();
        let sniffer = &self.sniffer;
        let files: Vec<FileEntry> = stream::iter(files)
            .map(|mut file| {
                let path = file.absolute(&root);
                async move {
                    match sniffer.sniff(&path).await {
                        Ok(kind) => file.content_type = kind,
                        Err(e) => warn!(path = %file.path.display(), error = %e, "Cannot detect content type"),
                    }
                    file
                }
            })
            .buffered(self.config.parallelism.max(1))
            .collect()
            .await;
        Ok(files)
    }
}

fn record<T: Into<StageCounts>>(
    report: &mut PipelineReport,
    kind: StageKind,
    label: &str,
    result: Result<T, StageError>,
    started: Instant,
) -> Result<(), PipelineError> {
    let elapsed = started.elapsed();
    match result {
        Ok(outcome) => {
            report.push(kind, label, outcome.into(), None, elapsed);
            Ok(())
        }
        Err(StageError::Skipped(reason)) => {
            warn!(stage = label, reason = %reason, "Stage skipped");
            report.push(kind, label, StageCounts::default(), Some(reason), elapsed);
            Ok(())
        }
        Err(StageError::Fatal(e)) => {
            report.push(kind, label, StageCounts::default(), None, elapsed);
            Err(e)
        }
        Err(StageError::Interrupted { counts, source }) => {
            report.push(kind, label, counts, None, elapsed);
            Err(source)
        }
    }
}
