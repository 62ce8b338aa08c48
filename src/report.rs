//! Run report: what every stage attempted, what succeeded and failed, and
//! whether the run was aborted. It is the only value a run returns and is
//! filled in even when a fatal error cuts the run short.

use crate::backup::BackupArchive;
use crate::size::ByteSize;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Backup,
    Dedupe,
    Expand,
    Prune,
    Rename,
    Convert,
    Segregate,
    Scrub,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Backup => "backup",
            StageKind::Dedupe => "dedupe",
            StageKind::Expand => "expand",
            StageKind::Prune => "prune",
            StageKind::Rename => "rename",
            StageKind::Convert => "convert",
            StageKind::Segregate => "segregate",
            StageKind::Scrub => "scrub",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts a stage hands back to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Stage-specific counters, e.g. `groups_found` or `below_100KiB`.
    pub details: BTreeMap<String, u64>,
}

impl StageCounts {
    pub fn detail(mut self, key: impl Into<String>, value: u64) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn absorb(&mut self, other: StageCounts) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        for (key, value) in other.details {
            *self.details.entry(key).or_default() += value;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub kind: StageKind,
    /// Distinguishes repeated passes, e.g. `dedupe:post-expand`.
    pub label: String,
    #[serde(flatten)]
    pub counts: StageCounts,
    /// Set when the stage could not run (missing tool, nothing to do).
    pub skipped: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    CompletedWithFailures,
    Aborted,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::CompletedWithFailures => 1,
            RunOutcome::Aborted => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub root: PathBuf,
    pub started_at: DateTime<Local>,
    pub backup: Option<BackupArchive>,
    pub stages: Vec<StageReport>,
    pub bytes_before: Option<u64>,
    pub bytes_after: Option<u64>,
    /// Reason of the fatal failure that stopped the run, if any.
    pub aborted: Option<String>,
    pub elapsed_ms: u64,
}

impl PipelineReport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            root: root.into(),
            started_at: Local::now(),
            backup: None,
            stages: Vec::new(),
            bytes_before: None,
            bytes_after: None,
            aborted: None,
            elapsed_ms: 0,
        }
    }

    pub fn push(
        &mut self,
        kind: StageKind,
        label: impl Into<String>,
        counts: StageCounts,
        skipped: Option<String>,
        elapsed: Duration,
    ) {
        self.stages.push(StageReport {
            kind,
            label: label.into(),
            counts,
            skipped,
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    pub fn stage(&self, label: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.label == label)
    }

    pub fn total_failed(&self) -> u64 {
        self.stages.iter().map(|s| s.counts.failed).sum()
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.aborted.is_some() {
            RunOutcome::Aborted
        } else if self.total_failed() > 0 {
            RunOutcome::CompletedWithFailures
        } else {
            RunOutcome::Success
        }
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} on {}", self.run_id, self.root.display())?;
        if let Some(backup) = &self.backup {
            writeln!(
                f,
                "Backup: {} ({})",
                backup.path.display(),
                ByteSize(backup.size)
            )?;
        }
        writeln!(
            f,
            "{:<24} {:>9} {:>9} {:>9} {:>9}",
            "stage", "attempted", "succeeded", "failed", "ms"
        )?;
        for stage in &self.stages {
            write!(
                f,
                "{:<24} {:>9} {:>9} {:>9} {:>9}",
                stage.label,
                stage.counts.attempted,
                stage.counts.succeeded,
                stage.counts.failed,
                stage.elapsed_ms
            )?;
            if let Some(reason) = &stage.skipped {
                write!(f, "  skipped: {reason}")?;
            }
            for (key, value) in &stage.counts.details {
                write!(f, "  {key}={value}")?;
            }
            writeln!(f)?;
        }
        if let (Some(before), Some(after)) = (self.bytes_before, self.bytes_after) {
            writeln!(f, "Size: {} -> {}", ByteSize(before), ByteSize(after))?;
        }
        match &self.aborted {
            Some(reason) => writeln!(f, "ABORTED: {reason}")?,
            None => writeln!(f, "Outcome: {:?}", self.outcome())?,
        }
        write!(f, "Elapsed: {} ms", self.elapsed_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_reflects_failures_and_abort() {
        let mut report = PipelineReport::new("/data");
        assert_eq!(report.outcome(), RunOutcome::Success);

        report.push(
            StageKind::Convert,
            "convert",
            StageCounts {
                attempted: 3,
                succeeded: 2,
                failed: 1,
                ..Default::default()
            },
            None,
            Duration::from_millis(5),
        );
        assert_eq!(report.outcome(), RunOutcome::CompletedWithFailures);
        assert_eq!(report.outcome().exit_code(), 1);

        report.aborted = Some("backup failed".into());
        assert_eq!(report.outcome(), RunOutcome::Aborted);
        assert_eq!(report.outcome().exit_code(), 2);
    }

    #[test]
    fn summary_lists_every_stage() {
        let mut report = PipelineReport::new("/data");
        report.push(
            StageKind::Dedupe,
            "dedupe:initial",
            StageCounts::default().detail("groups_found", 2),
            None,
            Duration::ZERO,
        );
        report.push(
            StageKind::Scrub,
            "scrub",
            StageCounts::default(),
            Some("exiftool not installed".into()),
            Duration::ZERO,
        );
        let text = report.to_string();
        assert!(text.contains("dedupe:initial"));
        assert!(text.contains("groups_found=2"));
        assert!(text.contains("skipped: exiftool not installed"));
        assert!(report.stage("scrub").is_some());
    }

    #[test]
    fn serializes_to_json_with_flattened_counts() {
        let mut report = PipelineReport::new("/data");
        report.push(
            StageKind::Rename,
            "rename",
            StageCounts {
                attempted: 1,
                succeeded: 1,
                ..Default::default()
            },
            None,
            Duration::ZERO,
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stages"][0]["kind"], "rename");
        assert_eq!(json["stages"][0]["succeeded"], 1);
    }
}
