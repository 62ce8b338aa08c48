use crate::rename::{DEFAULT_ID_LENGTH, DEFAULT_MAX_ATTEMPTS};
use crate::size::ByteSize;
use crate::sniff::{ContentType, SnifferKind};
use serde::Deserialize;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_REVIEW_DIR: &str = "_review";
pub const DEFAULT_ARCHIVE_SEARCH_DEPTH: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("parallelism must be at least 1")]
    ZeroParallelism,
    #[error("size thresholds must be greater than zero")]
    ZeroThreshold,
    #[error("conversion rule `{0}` has an empty size range")]
    EmptyRange(String),
    #[error("conversion rule `{0}` targets a format that is not a raster image")]
    NonRasterTarget(String),
    #[error("conversion rule `{0}` converts a format into itself")]
    SameFormat(String),
    #[error("invalid conversion rule `{input}`: {reason}")]
    InvalidRule { input: String, reason: String },
    #[error("review directory `{0}` must be a single plain directory name")]
    InvalidReviewDir(String),
    #[error("rename identifiers must be at least one digit long")]
    ZeroIdLength,
}

/// Half-open byte range `[min, max)`; no `max` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeRange {
    pub min: u64,
    pub max: Option<u64>,
}

impl SizeRange {
    pub fn contains(&self, size: u64) -> bool {
        size >= self.min && self.max.map_or(true, |max| size < max)
    }

    pub fn is_empty(&self) -> bool {
        self.max.is_some_and(|max| max <= self.min)
    }

    pub fn is_unbounded(&self) -> bool {
        self.min == 0 && self.max.is_none()
    }
}

impl fmt::Display for SizeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min > 0 {
            write!(f, "{}", ByteSize(self.min))?;
        }
        f.write_str("..")?;
        if let Some(max) = self.max {
            write!(f, "{}", ByteSize(max))?;
        }
        Ok(())
    }
}

impl FromStr for SizeRange {
    type Err = String;

    /// `MIN..MAX`, `MIN..` or `..MAX`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (min, max) = s
            .split_once("..")
            .ok_or_else(|| format!("size range `{s}` must look like MIN..MAX"))?;
        let bound = |text: &str| -> Result<Option<u64>, String> {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse::<ByteSize>()
                .map(|b| Some(b.bytes()))
                .map_err(|e| e.to_string())
        };
        Ok(SizeRange {
            min: bound(min)?.unwrap_or(0),
            max: bound(max)?,
        })
    }
}

/// Converts files of one raster type, within a size range, into another.
///
/// Textual form: `SRC:DST[:MIN..MAX]`, for example `jpeg:png:100KiB..1MiB`.
/// In YAML: `{ from: jpeg, to: png, min: 100KiB, max: 1MiB }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RuleFields")]
pub struct ConversionRule {
    pub from: ContentType,
    pub to: ContentType,
    pub size: SizeRange,
}

impl ConversionRule {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.to.is_raster_image() {
            return Err(ConfigError::NonRasterTarget(self.to_string()));
        }
        if self.from == self.to {
            return Err(ConfigError::SameFormat(self.to_string()));
        }
        if self.size.is_empty() {
            return Err(ConfigError::EmptyRange(self.to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for ConversionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.from, self.to)?;
        if !self.size.is_unbounded() {
            write!(f, ":{}", self.size)?;
        }
        Ok(())
    }
}

impl FromStr for ConversionRule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidRule {
            input: s.to_string(),
            reason,
        };
        let mut parts = s.splitn(3, ':');
        let (Some(from), Some(to)) = (parts.next(), parts.next()) else {
            return Err(invalid("expected SRC:DST[:MIN..MAX]".into()));
        };
        let size = match parts.next() {
            Some(range) => range.parse::<SizeRange>().map_err(invalid)?,
            None => SizeRange::default(),
        };
        let rule = ConversionRule {
            from: from.parse().map_err(|e: crate::sniff::UnknownContentType| invalid(e.to_string()))?,
            to: to.parse().map_err(|e: crate::sniff::UnknownContentType| invalid(e.to_string()))?,
            size,
        };
        rule.validate()?;
        Ok(rule)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFields {
    from: String,
    to: String,
    #[serde(default)]
    min: Option<ByteSize>,
    #[serde(default)]
    max: Option<ByteSize>,
}

impl TryFrom<RuleFields> for ConversionRule {
    type Error = ConfigError;

    fn try_from(fields: RuleFields) -> Result<Self, Self::Error> {
        let input = format!("{}:{}", fields.from, fields.to);
        let parse = |name: &str| {
            name.parse::<ContentType>().map_err(|e| ConfigError::InvalidRule {
                input: input.clone(),
                reason: e.to_string(),
            })
        };
        let rule = ConversionRule {
            from: parse(&fields.from)?,
            to: parse(&fields.to)?,
            size: SizeRange {
                min: fields.min.map_or(0, ByteSize::bytes),
                max: fields.max.map(ByteSize::bytes),
            },
        };
        rule.validate()?;
        Ok(rule)
    }
}

/// Everything a run needs, assembled once from file, environment and flags,
/// then handed to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Where backup archives go. Defaults to `<root>.backups` next to the root.
    pub backup_dir: Option<PathBuf>,
    pub parallelism: usize,
    pub segregate_below: Vec<u64>,
    pub conversion_rules: Vec<ConversionRule>,
    pub delete_below: Option<u64>,
    pub dedup_between_stages: bool,
    pub tool_timeout: Option<Duration>,
    pub review_dir: String,
    pub archive_search_depth: usize,
    pub sniffer: SnifferKind,
    pub rename_id_length: usize,
    pub rename_max_attempts: u32,
    /// Run log; excluded from every stage when it sits under the root.
    pub log_file: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backup_dir: None,
            parallelism: std::thread::available_parallelism().map_or(1, |n| n.get()),
            segregate_below: Vec::new(),
            conversion_rules: Vec::new(),
            delete_below: None,
            dedup_between_stages: true,
            tool_timeout: None,
            review_dir: DEFAULT_REVIEW_DIR.to_string(),
            archive_search_depth: DEFAULT_ARCHIVE_SEARCH_DEPTH,
            sniffer: SnifferKind::default(),
            rename_id_length: DEFAULT_ID_LENGTH,
            rename_max_attempts: DEFAULT_MAX_ATTEMPTS,
            log_file: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        if self.segregate_below.contains(&0) {
            return Err(ConfigError::ZeroThreshold);
        }
        if self.rename_id_length == 0 {
            return Err(ConfigError::ZeroIdLength);
        }
        let mut components = Path::new(&self.review_dir).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(ConfigError::InvalidReviewDir(self.review_dir.clone()));
        }
        self.conversion_rules.iter().try_for_each(ConversionRule::validate)
    }

    /// Small-file deletion threshold, if enabled.
    pub fn delete_threshold(&self) -> Option<u64> {
        self.delete_below.filter(|t| *t > 0)
    }

    pub fn backup_dir_for(&self, root: &Path) -> PathBuf {
        if let Some(dir) = &self.backup_dir {
            return dir.clone();
        }
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        match root.parent() {
            Some(parent) => parent.join(format!("{name}.backups")),
            None => root.join(".backups"),
        }
    }

    pub fn trace_loaded(&self) {
        info!(
            parallelism = self.parallelism,
            thresholds = self.segregate_below.len(),
            rules = self.conversion_rules.len(),
            delete_below = ?self.delete_threshold(),
            dedup_between_stages = self.dedup_between_stages,
            sniffer = ?self.sniffer,
            "Loaded PipelineConfig"
        );
        for rule in &self.conversion_rules {
            info!(rule = %rule, "Loaded conversion rule");
        }
        debug!(?self, "PipelineConfig loaded (full debug)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::{KIB, MIB};

    #[test]
    fn parses_rule_with_range() {
        let rule: ConversionRule = "jpeg:png:100KiB..1MiB".parse().unwrap();
        assert_eq!(rule.from, ContentType::Jpeg);
        assert_eq!(rule.to, ContentType::Png);
        assert_eq!(rule.size, SizeRange { min: 100 * KIB, max: Some(MIB) });
        assert_eq!(rule.to_string(), "jpeg:png:100KiB..1MiB");
        assert!(rule.size.contains(100 * KIB));
        assert!(!rule.size.contains(MIB));
    }

    #[test]
    fn parses_open_ranges() {
        let rule: ConversionRule = "bmp:png".parse().unwrap();
        assert!(rule.size.is_unbounded());
        assert_eq!(rule.to_string(), "bmp:png");

        let rule: ConversionRule = "tif:jpg:2M..".parse().unwrap();
        assert_eq!(rule.size, SizeRange { min: 2 * MIB, max: None });
        assert!(rule.size.contains(u64::MAX));

        let rule: ConversionRule = "png:webp:..10KB".parse().unwrap();
        assert_eq!(rule.size.max, Some(10 * KIB));
    }

    #[test]
    fn rejects_bad_rules() {
        assert!(matches!(
            "jpeg:pdf".parse::<ConversionRule>(),
            Err(ConfigError::NonRasterTarget(_))
        ));
        assert!(matches!(
            "jpeg:png:1MiB..1KiB".parse::<ConversionRule>(),
            Err(ConfigError::EmptyRange(_))
        ));
        assert!(matches!(
            "png:png".parse::<ConversionRule>(),
            Err(ConfigError::SameFormat(_))
        ));
        assert!(matches!(
            "jpeg".parse::<ConversionRule>(),
            Err(ConfigError::InvalidRule { .. })
        ));
        assert!(matches!(
            "jpeg:png:lots".parse::<ConversionRule>(),
            Err(ConfigError::InvalidRule { .. })
        ));
        assert!(matches!(
            "jpeg:vhs".parse::<ConversionRule>(),
            Err(ConfigError::InvalidRule { .. })
        ));
    }

    #[test]
    fn deserializes_rule_fields() {
        let rule: ConversionRule =
            serde_yaml::from_str("{ from: jpeg, to: png, min: 100KiB, max: 1048576 }").unwrap();
        assert_eq!(rule.size, SizeRange { min: 100 * KIB, max: Some(MIB) });
        assert!(serde_yaml::from_str::<ConversionRule>("{ from: jpeg, to: mp3 }").is_err());
    }

    #[test]
    fn validate_catches_bad_settings() {
        let ok = PipelineConfig::default();
        assert!(ok.parallelism >= 1);
        assert_eq!(ok.validate(), Ok(()));

        let cases = [
            (PipelineConfig { parallelism: 0, ..ok.clone() }, ConfigError::ZeroParallelism),
            (
                PipelineConfig { segregate_below: vec![KIB, 0], ..ok.clone() },
                ConfigError::ZeroThreshold,
            ),
            (PipelineConfig { rename_id_length: 0, ..ok.clone() }, ConfigError::ZeroIdLength),
            (
                PipelineConfig { review_dir: "../elsewhere".into(), ..ok.clone() },
                ConfigError::InvalidReviewDir("../elsewhere".into()),
            ),
        ];
        for (config, expected) in cases {
            assert_eq!(config.validate(), Err(expected));
        }
    }

    #[test]
    fn default_backup_dir_is_a_sibling_of_the_root() {
        let config = PipelineConfig::default();
        assert_eq!(
            config.backup_dir_for(Path::new("/data/photos")),
            PathBuf::from("/data/photos.backups")
        );
        let explicit = PipelineConfig {
            backup_dir: Some("/mnt/backups".into()),
            ..config
        };
        assert_eq!(explicit.backup_dir_for(Path::new("/data/photos")), PathBuf::from("/mnt/backups"));
    }

    #[test]
    fn zero_delete_threshold_disables_pruning() {
        let config = PipelineConfig { delete_below: Some(0), ..Default::default() };
        assert_eq!(config.delete_threshold(), None);
    }
}
