//! Recursive metadata stripping with exiftool.

use crate::error::StageError;
use crate::report::StageCounts;
use crate::scan::TreeScope;
use crate::tools::{Invocation, ToolError, ToolRunner};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{error, info, instrument, warn};

pub const SCRUBBER: &str = "exiftool";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrubOutcome {
    pub scrubbed: u64,
    pub failed: u64,
}

impl From<ScrubOutcome> for StageCounts {
    fn from(o: ScrubOutcome) -> Self {
        StageCounts {
            attempted: o.scrubbed + o.failed,
            succeeded: o.scrubbed,
            failed: o.failed,
            ..Default::default()
        }
    }
}

fn summary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\s*(\d+) (?:image )?files? (updated|unchanged|weren't updated due to errors)")
            .expect("summary pattern is a valid regex")
    })
}

/// Reads exiftool's closing summary, e.g. `3 image files updated`.
/// Returns `None` when no summary line is present.
pub fn parse_summary(stdout: &str) -> Option<ScrubOutcome> {
    let mut outcome = ScrubOutcome::default();
    let mut seen = false;
    for caps in summary_pattern().captures_iter(stdout) {
        let n: u64 = caps[1].parse().unwrap_or(0);
        seen = true;
        match &caps[2] {
            "updated" | "unchanged" => outcome.scrubbed += n,
            _ => outcome.failed += n,
        }
    }
    seen.then_some(outcome)
}

#[instrument(name = "scrub", skip_all, fields(root = %scope.root().display()))]
pub async fn scrub(scope: &TreeScope, tools: &dyn ToolRunner) -> Result<ScrubOutcome, StageError> {
    if !tools.is_available(SCRUBBER) {
        warn!(tool = SCRUBBER, "Metadata stripper not installed");
        return Err(StageError::Skipped(format!("{SCRUBBER} not installed")));
    }

    let mut invocation = Invocation::new(SCRUBBER).args(["-all=", "-overwrite_original", "-r"]);
    for rel in scope.excluded_relative() {
        invocation = invocation.arg("-i").arg(scope.root().join(rel));
    }
    invocation = invocation.arg(scope.root());
    info!("Stripping metadata");

    let outcome = match tools.invoke(invocation).await {
        Ok(output) => parse_summary(&output.stdout).unwrap_or_default(),
        Err(ToolError::Failed { stdout, stderr, .. }) => match parse_summary(&stdout) {
            Some(outcome) => {
                warn!(errors = outcome.failed, stderr = %stderr, "Metadata stripper reported errors");
                outcome
            }
            None => {
                error!(stderr = %stderr, "Metadata stripper failed");
                ScrubOutcome { scrubbed: 0, failed: 1 }
            }
        },
        Err(e) => {
            error!(error = %e, "Metadata stripper failed");
            ScrubOutcome { scrubbed: 0, failed: 1 }
        }
    };

    info!(scrubbed = outcome.scrubbed, failed = outcome.failed, "Metadata stripping finished");
    Ok(outcome)
}
