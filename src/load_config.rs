use crate::config::{ConversionRule, PipelineConfig};
use crate::size::ByteSize;
use crate::sniff::SnifferKind;
use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

/// On-disk shape of the YAML file. Every key is optional; missing keys keep
/// their defaults.
#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StaticConfig {
    backup_dir: Option<PathBuf>,
    parallelism: Option<usize>,
    #[serde(default)]
    segregate_below: Vec<ByteSize>,
    #[serde(default)]
    convert: Vec<ConversionRule>,
    delete_below: Option<ByteSize>,
    dedup_between_stages: Option<bool>,
    tool_timeout_secs: Option<u64>,
    review_dir: Option<String>,
    archive_search_depth: Option<usize>,
    sniffer: Option<SnifferKind>,
    rename_id_length: Option<usize>,
    rename_max_attempts: Option<u32>,
}

impl StaticConfig {
    fn merge_into(self, config: &mut PipelineConfig) {
        if let Some(dir) = self.backup_dir {
            config.backup_dir = Some(dir);
        }
        if let Some(n) = self.parallelism {
            config.parallelism = n;
        }
        if !self.segregate_below.is_empty() {
            config.segregate_below = self.segregate_below.into_iter().map(ByteSize::bytes).collect();
        }
        if !self.convert.is_empty() {
            config.conversion_rules = self.convert;
        }
        if let Some(size) = self.delete_below {
            config.delete_below = Some(size.bytes());
        }
        if let Some(flag) = self.dedup_between_stages {
            config.dedup_between_stages = flag;
        }
        if let Some(secs) = self.tool_timeout_secs {
            config.tool_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(dir) = self.review_dir {
            config.review_dir = dir;
        }
        if let Some(depth) = self.archive_search_depth {
            config.archive_search_depth = depth;
        }
        if let Some(kind) = self.sniffer {
            config.sniffer = kind;
        }
        if let Some(len) = self.rename_id_length {
            config.rename_id_length = len;
        }
        if let Some(attempts) = self.rename_max_attempts {
            config.rename_max_attempts = attempts;
        }
    }
}

/// Loads a YAML config file on top of the defaults. Command-line flags are
/// applied afterwards by the caller.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    // An empty file is a valid "all defaults" config.
    let static_conf: StaticConfig = if config_content.trim().is_empty() {
        StaticConfig::default()
    } else {
        match serde_yaml::from_str(&config_content) {
            Ok(conf) => {
                info!(config_path = ?path_ref, "Parsed config YAML successfully");
                conf
            }
            Err(e) => {
                error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
                return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
            }
        }
    };

    let mut config = PipelineConfig::default();
    static_conf.merge_into(&mut config);

    if let Err(e) = config.validate() {
        error!(error = %e, config_path = ?path_ref, "Invalid configuration");
        anyhow::bail!("Invalid configuration in {:?}: {}", path_ref, e);
    }

    info!(
        parallelism = config.parallelism,
        rules = config.conversion_rules.len(),
        "Config loaded and merged successfully"
    );
    Ok(config)
}
