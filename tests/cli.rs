mod common;

use assert_cmd::Command;
use common::*;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

fn chunk_sync() -> Command {
    let mut cmd = Command::cargo_bin("chunk-sync").expect("Binary exists");
    cmd.env("RUST_LOG", "info");
    cmd
}

#[test]
fn chunk_then_restore_via_cli() {
    let src = tempdir().unwrap();
    runtime_tree(src.path());
    let out = tempdir().unwrap();
    let dest = tempdir().unwrap();

    chunk_sync()
        .args(["--chunk-size-mb", "1", "chunk"])
        .arg(src.path())
        .arg(out.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("chunk:"))
        .stderr(predicate::str::contains("[CHUNK] Complete"));

    chunk_sync()
        .arg("verify")
        .arg(out.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("entries OK"));

    chunk_sync()
        .arg("restore")
        .arg(out.path())
        .arg(dest.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("restore:"));

    assert_eq!(snapshot(src.path()), snapshot(dest.path()));
}

#[test]
fn push_twice_then_pull_with_local_store() {
    let src = tempdir().unwrap();
    runtime_tree(src.path());
    let store = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let prefix = "s3://tenant-state/envs/cli";

    chunk_sync()
        .arg("push")
        .arg(src.path())
        .arg(prefix)
        .arg("--local-store")
        .arg(store.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("push:").and(predicate::str::contains("chunks")));

    chunk_sync()
        .arg("push")
        .arg(src.path())
        .arg(prefix)
        .arg("--local-store")
        .arg(store.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("already up to date"));

    chunk_sync()
        .arg("pull")
        .arg(prefix)
        .arg(dest.path())
        .arg("--local-store")
        .arg(store.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("pull:"));

    assert_eq!(snapshot(src.path()), snapshot(dest.path()));
}

#[test]
fn verify_reports_corruption_and_exits_non_zero() {
    let src = tempdir().unwrap();
    runtime_tree(src.path());
    let out = tempdir().unwrap();
    chunk_sync().arg("chunk").arg(src.path()).arg(out.path()).assert().success();

    let bundle = out.path().join(chunk_sync::layout::BUNDLE_NAME);
    let mut bytes = fs::read(&bundle).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    fs::write(&bundle, bytes).unwrap();

    chunk_sync()
        .arg("verify")
        .arg(out.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAILED").and(predicate::str::contains("other_folders.tar.gz")))
        .stderr(predicate::str::contains("[ERROR]"));
}

#[test]
fn missing_source_fails_with_diagnostic() {
    let out = tempdir().unwrap();
    chunk_sync()
        .arg("chunk")
        .arg("/no/such/source")
        .arg(out.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("planning failed"));
}

#[test]
fn invalid_remote_prefix_is_rejected() {
    let out = tempdir().unwrap();
    chunk_sync()
        .arg("download")
        .arg("http://not-s3/bucket")
        .arg(out.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid remote prefix"));
}

#[test]
fn log_file_option_redirects_logs() {
    let src = tempdir().unwrap();
    write_file(src.path(), "lib/a.py", b"A = 1\n");
    let out = tempdir().unwrap();
    let logs = tempdir().unwrap();
    let log_file = logs.path().join("sync.log");

    chunk_sync()
        .arg("chunk")
        .arg(src.path())
        .arg(out.path())
        .arg("--log-file")
        .arg(&log_file)
        .assert()
        .success()
        .stderr(predicate::str::contains("[CHUNK]").not());

    let written = fs::read_to_string(&log_file).unwrap();
    assert!(written.contains("[CHUNK] Complete"));
}

/// Any `.partial` archive inside a `.chunk-staging-*` directory of `out_dir`.
#[cfg(unix)]
fn build_in_progress(out_dir: &std::path::Path) -> bool {
    fs::read_dir(out_dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".chunk-staging-"))
        .filter_map(|staging| fs::read_dir(staging.path()).ok())
        .flatten()
        .flatten()
        .any(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
}

#[cfg(unix)]
#[test]
fn sigint_during_build_exits_non_zero_and_removes_staging() {
    use assert_cmd::assert::OutputAssertExt;
    use assert_cmd::cargo::CommandCargoExt;
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    let src = tempdir().unwrap();
    for i in 0..16 {
        write_file(src.path(), &format!("lib/blob{i:02}.bin"), &noise(4 * 1024 * 1024, i));
    }
    let out = tempdir().unwrap();

    let mut child = std::process::Command::cargo_bin("chunk-sync")
        .expect("Binary exists")
        .env("RUST_LOG", "info")
        .args(["--chunk-size-mb", "1", "--compression-level", "19", "--max-parallel", "1", "chunk"])
        .arg(src.path())
        .arg(out.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(60);
    while !build_in_progress(out.path()) {
        assert!(Instant::now() < deadline, "build phase never started");
        assert!(child.try_wait().unwrap().is_none(), "chunk finished before it could be interrupted");
        std::thread::sleep(Duration::from_millis(20));
    }

    let signalled = Instant::now();
    let status = std::process::Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let output = child.wait_with_output().unwrap();
    assert!(
        signalled.elapsed() < Duration::from_secs(25),
        "interrupted run took {:?} to exit",
        signalled.elapsed()
    );
    output
        .assert()
        .failure()
        .stderr(predicate::str::contains("interrupted").and(predicate::str::contains("[SIGNAL]")));

    let leftovers: Vec<String> = fs::read_dir(out.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
}
