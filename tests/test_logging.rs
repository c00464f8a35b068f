use chunk_sync::config::LogSink;
use chunk_sync::error::SyncError;
use chunk_sync::logging::init_logging;
use serial_test::serial;
use tempfile::tempdir;

/// Installing the file sink routes events into the file; the global subscriber
/// can only be installed once per process.
#[test]
#[serial]
fn test_file_sink_receives_events_and_second_install_fails() {
    let dir = tempdir().unwrap();
    let log_file = dir.path().join("logs/chunk-sync.log");

    init_logging(&LogSink::File(log_file.clone())).expect("first install succeeds");
    tracing::info!(artifacts = 3, "[TEST] file sink line");

    let written = std::fs::read_to_string(&log_file).unwrap();
    assert!(written.contains("[TEST] file sink line"));
    assert!(written.contains("INFO"));
    assert!(!written.contains("\u{1b}["), "file output must not carry ANSI colours");

    let err = init_logging(&LogSink::Stderr).unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}

/// An unopenable log file is reported before anything is installed.
#[test]
#[serial]
fn test_unopenable_log_file_is_an_io_error() {
    let dir = tempdir().unwrap();
    let err = init_logging(&LogSink::File(dir.path().to_path_buf())).unwrap_err();
    assert!(matches!(err, SyncError::Io { .. }));
}
