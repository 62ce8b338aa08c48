use crate::config::{ConversionRule, PipelineConfig};
use crate::load_config::load_config;
use crate::pipeline::Pipeline;
use crate::report::PipelineReport;
use crate::size::ByteSize;
use crate::sniff::SnifferKind;
use crate::tools::SystemToolRunner;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// CLI for media-sweep: back up, deduplicate, expand, rename, convert,
/// segregate and scrub a media directory tree.
#[derive(Parser, Debug)]
#[clap(
    name = "media-sweep",
    version,
    about = "Idempotent clean-up pipeline for a directory of media files"
)]
pub struct Cli {
    /// Root of the tree to process
    #[clap(default_value = ".")]
    pub root: PathBuf,

    /// Path to a YAML config file; flags override its values
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Directory receiving the pre-run backup archive
    #[clap(long, env = "MEDIA_SWEEP_BACKUP_DIR")]
    pub backup_dir: Option<PathBuf>,

    /// Concurrent tasks per stage (default: number of cores)
    #[clap(long)]
    pub parallelism: Option<usize>,

    /// Segregation thresholds, e.g. `100KiB,1MiB`
    #[clap(long, value_delimiter = ',')]
    pub segregate_below: Vec<ByteSize>,

    /// Conversion rule `SRC:DST[:MIN..MAX]`, e.g. `jpeg:png:100KiB..1MiB`
    #[clap(long = "convert", value_name = "RULE")]
    pub convert: Vec<ConversionRule>,

    /// Delete files smaller than this size (0 disables)
    #[clap(long)]
    pub delete_below: Option<ByteSize>,

    /// Only run duplicate elimination once, at the end
    #[clap(long)]
    pub no_dedup_between_stages: bool,

    /// Kill external tools that run longer than this many seconds
    #[clap(long, value_name = "SECS")]
    pub tool_timeout: Option<u64>,

    /// Name of the review subtree under the root
    #[clap(long)]
    pub review_dir: Option<String>,

    /// Content type detection strategy
    #[clap(long, value_enum)]
    pub sniffer: Option<SnifferKind>,

    /// Append log lines to this file as well as stderr
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Write the run report as JSON to this file
    #[clap(long)]
    pub report_json: Option<PathBuf>,

    /// Debug-level logging
    #[clap(long, short)]
    pub verbose: bool,
}

impl Cli {
    /// Applies command-line overrides on top of `config`.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(dir) = &self.backup_dir {
            config.backup_dir = Some(dir.clone());
        }
        if let Some(n) = self.parallelism {
            config.parallelism = n;
        }
        if !self.segregate_below.is_empty() {
            config.segregate_below = self.segregate_below.iter().map(|s| s.bytes()).collect();
        }
        if !self.convert.is_empty() {
            config.conversion_rules = self.convert.clone();
        }
        if let Some(size) = self.delete_below {
            config.delete_below = Some(size.bytes());
        }
        if self.no_dedup_between_stages {
            config.dedup_between_stages = false;
        }
        if let Some(secs) = self.tool_timeout {
            config.tool_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(dir) = &self.review_dir {
            config.review_dir = dir.clone();
        }
        if let Some(kind) = self.sniffer {
            config.sniffer = kind;
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.clone());
        }
    }

    pub fn to_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => PipelineConfig::default(),
        };
        self.apply(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<PipelineReport> {
    tracing::info!(root = %cli.root.display(), "CLI arguments parsed, building configuration");
    let config = cli.to_config()?;
    config.trace_loaded();

    let tools = Arc::new(SystemToolRunner::new(config.tool_timeout));
    let report = Pipeline::new(config, tools).run(&cli.root).await;

    if let Some(path) = &cli.report_json {
        let json = serde_json::to_string_pretty(&report).context("cannot serialise run report")?;
        std::fs::write(path, json)
            .with_context(|| format!("cannot write run report to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Run report written");
    }
    Ok(report)
}
