//! Byte sizes: parsing human-written sizes, rendering them back, and measuring
//! files and directory trees on disk.
//!
//! All suffixes are binary multiples: `100K`, `100KB` and `100KiB` all mean
//! 102 400 bytes, matching how `find -size` and `du` count.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// A byte count as written by a user (`"100KiB"`, `"1.5M"`, `"2048"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ByteSize(pub u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeParseError {
    #[error("`{0}` is not a size (expected e.g. 512, 100K, 100KiB, 1.5MiB)")]
    Malformed(String),
    #[error("`{0}` does not fit in 64 bits")]
    Overflow(String),
}

fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*(?:([kmgt])(?:i?b)?|b)?\s*$")
            .expect("size pattern is a valid regex")
    })
}

impl ByteSize {
    pub fn bytes(self) -> u64 {
        self.0
    }

    /// The `Display` form when it parses back to the same count, plain
    /// bytes otherwise (`1KiB`, `1.5MiB`, but `1025B`).
    pub fn exact(self) -> String {
        let rendered = self.to_string();
        match rendered.parse::<ByteSize>() {
            Ok(back) if back == self => rendered,
            _ => format!("{}B", self.0),
        }
    }
}

impl FromStr for ByteSize {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = size_pattern()
            .captures(s)
            .ok_or_else(|| SizeParseError::Malformed(s.to_string()))?;
        let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
            None => 1,
            Some(unit) => match unit.as_str() {
                "k" => KIB,
                "m" => MIB,
                "g" => GIB,
                "t" => TIB,
                _ => return Err(SizeParseError::Malformed(s.to_string())),
            },
        };
        let number = &caps[1];
        if let Ok(whole) = number.parse::<u64>() {
            return whole
                .checked_mul(multiplier)
                .map(ByteSize)
                .ok_or_else(|| SizeParseError::Overflow(s.to_string()));
        }
        let fractional: f64 = number
            .parse()
            .map_err(|_| SizeParseError::Malformed(s.to_string()))?;
        let bytes = (fractional * multiplier as f64).round();
        if bytes > u64::MAX as f64 {
            return Err(SizeParseError::Overflow(s.to_string()));
        }
        Ok(ByteSize(bytes as u64))
    }
}

impl fmt::Display for ByteSize {
    /// Renders with the largest binary unit that keeps the value >= 1,
    /// dropping the fraction when it is exact (`100KiB`, `1.5MiB`, `10B`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")];
        for (scale, suffix) in units {
            if self.0 >= scale {
                return if self.0 % scale == 0 {
                    write!(f, "{}{}", self.0 / scale, suffix)
                } else {
                    let value = self.0 as f64 / scale as f64;
                    let rendered = format!("{value:.2}");
                    let rendered = rendered.trim_end_matches('0').trim_end_matches('.');
                    write!(f, "{rendered}{suffix}")
                };
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Bytes(n) => Ok(ByteSize(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Byte size of a file, or the summed size of every regular file below a
/// directory. Symlinks are not followed. Unreadable entries below a
/// directory are skipped.
pub fn size_of(path: &Path) -> std::io::Result<u64> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                if let Ok(meta) = entry.metadata() {
                    total = total.saturating_add(meta.len());
                }
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Skipping unreadable entry while measuring size"),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_sizes() {
        assert_eq!("512".parse::<ByteSize>().unwrap(), ByteSize(512));
        assert_eq!("100K".parse::<ByteSize>().unwrap(), ByteSize(100 * KIB));
        assert_eq!("100kb".parse::<ByteSize>().unwrap(), ByteSize(100 * KIB));
        assert_eq!("100KiB".parse::<ByteSize>().unwrap(), ByteSize(100 * KIB));
        assert_eq!("1.5M".parse::<ByteSize>().unwrap(), ByteSize(MIB + MIB / 2));
        assert_eq!(" 2 GiB ".parse::<ByteSize>().unwrap(), ByteSize(2 * GIB));
        assert_eq!("10b".parse::<ByteSize>().unwrap(), ByteSize(10));
    }

    #[test]
    fn rejects_garbage_and_overflow() {
        assert!(matches!(
            "ten".parse::<ByteSize>(),
            Err(SizeParseError::Malformed(_))
        ));
        assert!(matches!(
            "5X".parse::<ByteSize>(),
            Err(SizeParseError::Malformed(_))
        ));
        assert!(matches!(
            "99999999999999999999T".parse::<ByteSize>(),
            Err(SizeParseError::Overflow(_))
        ));
    }

    #[test]
    fn displays_with_binary_units() {
        assert_eq!(ByteSize(100 * KIB).to_string(), "100KiB");
        assert_eq!(ByteSize(MIB).to_string(), "1MiB");
        assert_eq!(ByteSize(MIB + MIB / 2).to_string(), "1.5MiB");
        assert_eq!(ByteSize(10).to_string(), "10B");
    }

    #[test]
    fn exact_form_never_rounds() {
        assert_eq!(ByteSize(KIB).exact(), "1KiB");
        assert_eq!(ByteSize(KIB + 1).exact(), "1025B");
        assert_eq!(ByteSize(3 * MIB / 2).exact(), "1.5MiB");
    }

    #[test]
    fn deserializes_from_numbers_and_strings() {
        let sizes: Vec<ByteSize> = serde_yaml::from_str("[100KiB, 2048, \"1M\"]").unwrap();
        assert_eq!(sizes, vec![ByteSize(100 * KIB), ByteSize(2048), ByteSize(MIB)]);
    }

    #[test]
    fn measures_files_and_trees() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), vec![0u8; 10]).unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b"), vec![0u8; 32]).unwrap();

        assert_eq!(size_of(&tmp.path().join("a")).unwrap(), 10);
        assert_eq!(size_of(tmp.path()).unwrap(), 42);
        assert!(size_of(&tmp.path().join("missing")).is_err());
    }
}
