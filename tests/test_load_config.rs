use media_sweep::config::{ConversionRule, SizeRange};
use media_sweep::size::{KIB, MIB};
use media_sweep::sniff::{ContentType, SnifferKind};
use serial_test::serial;
use std::fs::write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

/// This test ensures that every YAML key lands in the merged PipelineConfig.
#[tokio::test]
#[serial]
async fn test_load_config_success_reads_every_key() {
    let config_yaml = r#"
backup_dir: /var/backups/media
parallelism: 4
segregate_below: [100KiB, 1MiB]
convert:
  - from: jpeg
    to: png
    min: 100KiB
    max: 1MiB
  - from: bmp
    to: jpg
delete_below: 2K
dedup_between_stages: false
tool_timeout_secs: 30
review_dir: review
archive_search_depth: 3
sniffer: file
rename_id_length: 12
"#;
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), config_yaml).unwrap();

    let config = media_sweep::load_config::load_config(config_file.path()).expect("Config should load");

    assert_eq!(config.backup_dir, Some(PathBuf::from("/var/backups/media")));
    assert_eq!(config.parallelism, 4);
    assert_eq!(config.segregate_below, vec![100 * KIB, MIB]);
    assert_eq!(
        config.conversion_rules,
        vec![
            ConversionRule {
                from: ContentType::Jpeg,
                to: ContentType::Png,
                size: SizeRange { min: 100 * KIB, max: Some(MIB) },
            },
            ConversionRule {
                from: ContentType::Bmp,
                to: ContentType::Jpeg,
                size: SizeRange::default(),
            },
        ]
    );
    assert_eq!(config.delete_below, Some(2 * KIB));
    assert!(!config.dedup_between_stages);
    assert_eq!(config.tool_timeout, Some(Duration::from_secs(30)));
    assert_eq!(config.review_dir, "review");
    assert_eq!(config.archive_search_depth, 3);
    assert_eq!(config.sniffer, SnifferKind::File);
    assert_eq!(config.rename_id_length, 12);
}

/// This test ensures that an empty file yields the defaults.
#[tokio::test]
#[serial]
async fn test_load_config_empty_file_is_all_defaults() {
    let config_file = NamedTempFile::new().expect("temp file");
    let config = media_sweep::load_config::load_config(config_file.path()).expect("Config should load");
    assert_eq!(config, media_sweep::PipelineConfig::default());
}

/// This test ensures that if the config file is not valid YAML, load_config errors and reports as such.
#[tokio::test]
#[serial]
async fn test_load_config_errors_for_invalid_file() {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), "parallelism: [unclosed").unwrap();

    let err = media_sweep::load_config::load_config(config_file.path()).unwrap_err();
    assert!(
        err.to_string().contains("Failed to parse config YAML"),
        "unexpected error: {err}"
    );
}

/// This test ensures that unknown keys are rejected instead of silently ignored.
#[tokio::test]
#[serial]
async fn test_load_config_rejects_unknown_keys() {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), "segregate_bellow: [1MiB]\n").unwrap();
    assert!(media_sweep::load_config::load_config(config_file.path()).is_err());
}

/// This test ensures that semantically invalid values fail validation.
#[tokio::test]
#[serial]
async fn test_load_config_rejects_invalid_values() {
    for yaml in [
        "parallelism: 0\n",
        "segregate_below: [0]\n",
        "convert:\n  - from: jpeg\n    to: pdf\n",
        "convert:\n  - from: jpeg\n    to: png\n    min: 1MiB\n    max: 1KiB\n",
        "review_dir: ../outside\n",
    ] {
        let config_file = NamedTempFile::new().expect("temp file");
        write(config_file.path(), yaml).unwrap();
        assert!(
            media_sweep::load_config::load_config(config_file.path()).is_err(),
            "accepted: {yaml}"
        );
    }
}

/// This test ensures that a missing file is reported with its path.
#[tokio::test]
#[serial]
async fn test_load_config_errors_for_missing_file() {
    let err = media_sweep::load_config::load_config("/nonexistent/media-sweep.yaml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
