use chunk_sync::config::{LogSink, MIB};
use chunk_sync::load_config::{load_config, parse_config};
use std::fs::write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// A full config file maps onto every EngineConfig field.
#[test]
fn test_load_config_reads_every_field() {
    let config_yaml = r#"
chunk_size_mb: 100
max_parallel: 8
compression_level: 19
large_subtree: lib/python3.11
log_sink:
  file: /var/log/chunk-sync.log
"#;
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), config_yaml).unwrap();

    let config = load_config(config_file.path()).expect("Config should load");

    assert_eq!(config.chunk_size_bytes, 100 * MIB);
    assert_eq!(config.max_parallel, 8);
    assert_eq!(config.compression_level, 19);
    assert_eq!(config.large_subtree, PathBuf::from("lib/python3.11"));
    assert_eq!(
        config.log_sink,
        LogSink::File(PathBuf::from("/var/log/chunk-sync.log"))
    );
}

/// Missing keys fall back to defaults; an empty file is a default config.
#[test]
fn test_load_config_defaults_for_missing_keys() {
    let config = parse_config("max_parallel: 2\n").expect("partial config should parse");
    assert_eq!(config.max_parallel, 2);
    assert_eq!(config.chunk_size_bytes, 512 * MIB);
    assert_eq!(config.log_sink, LogSink::Stderr);

    let empty = parse_config("").expect("empty config should parse");
    assert_eq!(empty, chunk_sync::EngineConfig::default());
}

/// This test ensures that if the config file is not valid YAML, load_config errors and reports as such.
#[test]
fn test_load_config_errors_for_invalid_file() {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), "max_parallel: [not, a, number\n").unwrap();

    let err = load_config(config_file.path()).unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("YAML"), "expected a YAML error, got: {msg}");
}

#[test]
fn test_load_config_rejects_unknown_and_conflicting_keys() {
    assert!(parse_config("chunk_size: 10\n").is_err());
    assert!(parse_config("chunk_size_bytes: 10\nchunk_size_mb: 1\n").is_err());
}

#[test]
fn test_load_config_rejects_invalid_values() {
    let err = parse_config("compression_level: 40\n").unwrap_err();
    assert!(err.to_string().contains("compression_level"), "got: {err}");
    assert!(parse_config("chunk_size_bytes: 0\n").is_err());
    assert!(parse_config("large_subtree: ../outside\n").is_err());
}

#[test]
fn test_load_config_missing_file() {
    let err = load_config("/definitely/not/a/config.yaml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
