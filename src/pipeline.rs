//! Coordinating module for the chunk / restore / transfer pipelines.
//!
//! Every public entry point here is blocking: it starts its own tokio runtime,
//! runs its phases strictly in order (each phase being one bounded batch on a
//! [`WorkerPool`]) and returns once everything it started has finished. A
//! termination signal aborts the run with [`SyncError::Interrupted`]. Temporary
//! directories are owned by the blocking wrapper and dropped after the runtime
//! has shut down, so they are removed on every exit path.
//!
//! Upload: plan → build chunks + bundle → checksum → transfer.
//! Download: transfer → verify → extract.

use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::archive::{build_chunk_archive, extract_archive, validate_archive, ArchiveInfo};
use crate::blob::BlobRef;
use crate::bundle::build_bundle;
use crate::change::{compare, fingerprint_tree, local_fingerprint, remote_fingerprint};
use crate::config::EngineConfig;
use crate::error::{IntegrityError, Result, SyncError};
use crate::layout::{is_chunk_name, BUNDLE_NAME, FINGERPRINT_NAME, MANIFEST_NAME};
use crate::manifest::{sha256_file, verify_entry, EntryStatus, Manifest, VerifyReport};
use crate::planner::{plan_chunks, Chunk};
use crate::scheduler::{CancelFlag, WorkerPool};
use crate::store::BlobStore;

/// How long shutdown waits for blocking workers after the pipeline future ends.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// One artifact in a chunk directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactSummary {
    pub name: String,
    pub size: u64,
    pub digest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkReport {
    /// True when the existing chunk directory already matched the source.
    pub skipped: bool,
    pub fingerprint: String,
    pub chunks: usize,
    pub oversized_chunks: usize,
    pub artifacts: Vec<ArtifactSummary>,
    pub archive_bytes: u64,
    pub peak_active: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub artifacts_extracted: usize,
    pub bundle_absent: bool,
    pub entries: usize,
    pub executables_marked: usize,
    pub peak_active: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub prefix: String,
    pub artifacts: usize,
    pub bytes: u64,
    pub peak_active: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushReport {
    pub skipped: bool,
    pub fingerprint: String,
    pub chunk: Option<ChunkReport>,
    pub transfer: Option<TransferReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullReport {
    pub transfer: TransferReport,
    pub restore: RestoreReport,
}

// ---------------------------------------------------------------------------
// Blocking entry points
// ---------------------------------------------------------------------------

/// Chunk `source` into `out_dir`: chunk archives for the large subtree, the
/// bundle for everything else, the manifest and the fingerprint.
pub fn chunk(config: &EngineConfig, source: &Path, out_dir: &Path) -> Result<ChunkReport> {
    config.validate()?;
    ensure_source(source)?;
    fs::create_dir_all(out_dir).map_err(|e| SyncError::io(out_dir, e))?;
    ensure_outside(source, out_dir)?;
    let staging = staging_dir(out_dir, ".chunk-staging-")?;
    let cancel = CancelFlag::new();
    run_blocking(
        "chunk",
        &cancel,
        chunk_tree(config, source, out_dir, staging.path(), None, &cancel),
    )
}

/// Verify every artifact in `chunk_dir` against its manifest, then extract them
/// all into `dest`. Nothing is written to `dest` unless verification passed.
pub fn restore(config: &EngineConfig, chunk_dir: &Path, dest: &Path) -> Result<RestoreReport> {
    config.validate()?;
    run_blocking("restore", &CancelFlag::new(), restore_tree(config, chunk_dir, dest))
}

/// Upload the artifacts in `chunk_dir` under `prefix`. The fingerprint goes last.
pub fn upload(
    config: &EngineConfig,
    store: Arc<dyn BlobStore>,
    chunk_dir: &Path,
    prefix: &BlobRef,
) -> Result<TransferReport> {
    config.validate()?;
    run_blocking("upload", &CancelFlag::new(), upload_dir(config, &store, chunk_dir, prefix))
}

/// Download the artifacts under `prefix` into `chunk_dir`, verifying them before
/// they replace anything already there.
pub fn download(
    config: &EngineConfig,
    store: Arc<dyn BlobStore>,
    prefix: &BlobRef,
    chunk_dir: &Path,
) -> Result<TransferReport> {
    config.validate()?;
    fs::create_dir_all(chunk_dir).map_err(|e| SyncError::io(chunk_dir, e))?;
    let staging = staging_dir(chunk_dir, ".download-staging-")?;
    run_blocking(
        "download",
        &CancelFlag::new(),
        download_dir(config, &store, prefix, chunk_dir, staging.path()),
    )
}

/// Fingerprint `source`, compare it with the fingerprint under `prefix`, and
/// only when they differ chunk into a scoped temp dir and upload.
pub fn push(
    config: &EngineConfig,
    store: Arc<dyn BlobStore>,
    source: &Path,
    prefix: &BlobRef,
) -> Result<PushReport> {
    config.validate()?;
    ensure_source(source)?;
    let work = tempfile::Builder::new()
        .prefix("chunk-sync-push-")
        .tempdir()
        .map_err(|e| SyncError::io(std::env::temp_dir(), e))?;
    let out_dir = work.path().join("artifacts");
    fs::create_dir_all(&out_dir).map_err(|e| SyncError::io(&out_dir, e))?;
    let staging = staging_dir(work.path(), "staging-")?;
    let scratch = staging_dir(work.path(), "remote-")?;
    let cancel = CancelFlag::new();
    run_blocking(
        "push",
        &cancel,
        push_tree(
            config,
            &store,
            source,
            prefix,
            &out_dir,
            staging.path(),
            scratch.path(),
            &cancel,
        ),
    )
}

/// Download `prefix` into a scoped temp dir, verify it, and extract into `dest`.
pub fn pull(
    config: &EngineConfig,
    store: Arc<dyn BlobStore>,
    prefix: &BlobRef,
    dest: &Path,
) -> Result<PullReport> {
    config.validate()?;
    let work = tempfile::Builder::new()
        .prefix("chunk-sync-pull-")
        .tempdir()
        .map_err(|e| SyncError::io(std::env::temp_dir(), e))?;
    let chunk_dir = work.path().join("artifacts");
    fs::create_dir_all(&chunk_dir).map_err(|e| SyncError::io(&chunk_dir, e))?;
    let staging = staging_dir(work.path(), "staging-")?;
    run_blocking("pull", &CancelFlag::new(), async {
        let transfer = download_dir(config, &store, prefix, &chunk_dir, staging.path()).await?;
        let restore = restore_tree(config, &chunk_dir, dest).await?;
        info!(
            artifacts = transfer.artifacts,
            bytes = transfer.bytes,
            entries = restore.entries,
            "[PULL] Complete"
        );
        Ok::<_, SyncError>(PullReport { transfer, restore })
    })
}

/// Re-check every manifest entry in `chunk_dir`. Failures are reported, not
/// returned as `Err`; only an unreadable manifest is an error.
pub fn verify(config: &EngineConfig, chunk_dir: &Path) -> Result<VerifyReport> {
    config.validate()?;
    run_blocking("verify", &CancelFlag::new(), async {
        let manifest = Manifest::read_from(chunk_dir)?;
        let (report, _) = verify_artifacts(&manifest, chunk_dir, config.max_parallel).await?;
        if report.is_ok() {
            info!(entries = report.results.len(), dir = %chunk_dir.display(), "[VERIFY] All entries verified");
        }
        Ok::<_, SyncError>(report)
    })
}

// ---------------------------------------------------------------------------
// Runtime, signals, scoped directories
// ---------------------------------------------------------------------------

/// Run `pipeline` to completion on a fresh runtime. On a termination signal the
/// pipeline is dropped and `cancel` is set so blocking workers stop at their next
/// checkpoint instead of running out the shutdown grace period.
fn run_blocking<T, F>(operation: &'static str, cancel: &CancelFlag, pipeline: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("chunk-sync-worker")
        .enable_all()
        .build()
        .map_err(|e| SyncError::Job {
            label: operation.to_string(),
            message: format!("failed to start runtime: {e}"),
        })?;

    let run_id = Uuid::new_v4();
    let span = info_span!("run", operation, %run_id);
    let signal_span = span.clone();
    let result = runtime.block_on(async move {
        tokio::select! {
            result = pipeline.instrument(span) => result,
            _ = shutdown_signal() => {
                cancel.cancel();
                signal_span.in_scope(|| warn!("[SIGNAL] Termination signal received; aborting run"));
                Err(SyncError::Interrupted)
            }
        }
    });
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    if let Err(e) = &result {
        error!(
            operation,
            %run_id,
            class = e.class(),
            error = %e,
            "[{}][ERROR] Pipeline failed",
            operation.to_uppercase()
        );
    }
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = ?e, "[SIGNAL] Could not install SIGTERM handler");
                ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = ?e, "[SIGNAL] Could not install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
}

fn staging_dir(parent: &Path, prefix: &str) -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(parent)
        .map_err(|e| SyncError::io(parent, e))
}

fn ensure_source(source: &Path) -> Result<()> {
    if source.is_dir() {
        Ok(())
    } else {
        error!(source = %source.display(), "[PLAN][ERROR] Source directory missing");
        Err(SyncError::planning(source, "source directory is missing or not a directory"))
    }
}

/// The output directory must not sit inside the tree it is built from.
fn ensure_outside(source: &Path, out_dir: &Path) -> Result<()> {
    let canonical = |p: &Path| fs::canonicalize(p).map_err(|e| SyncError::io(p, e));
    if canonical(out_dir)?.starts_with(canonical(source)?) {
        return Err(SyncError::config(format!(
            "output directory {} lies inside source {}",
            out_dir.display(),
            source.display()
        )));
    }
    Ok(())
}

fn large_subtree(config: &EngineConfig, source: &Path) -> PathBuf {
    config
        .large_subtree
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .fold(source.to_path_buf(), |path, c| path.join(c))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u64::MAX as u128) as u64
}

fn debug_json<T: Serialize>(what: &str, report: &T) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => debug!(json = %json, what, "[REPORT][DEBUG] Report as JSON"),
        Err(e) => error!(error = ?e, what, "[REPORT][DEBUG] Failed to serialize report as JSON"),
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

async fn chunk_tree(
    config: &EngineConfig,
    source: &Path,
    out_dir: &Path,
    staging: &Path,
    known_fingerprint: Option<String>,
    cancel: &CancelFlag,
) -> Result<ChunkReport> {
    let started = Instant::now();
    info!(source = %source.display(), out_dir = %out_dir.display(), "[CHUNK] Starting");

    let fingerprint = match known_fingerprint {
        Some(fingerprint) => fingerprint,
        None => fingerprint_tree(source, config.max_parallel).await?,
    };

    if let Some(report) = reuse_existing(config, out_dir, &fingerprint, started).await {
        return Ok(report);
    }

    // Plan
    let large = large_subtree(config, source);
    let chunks = plan_large_subtree(&large, config.chunk_size_bytes).await?;
    let oversized_chunks = chunks.iter().filter(|c| c.is_oversized()).count();

    // Build: every chunk plus the bundle, one batch.
    let base: Arc<Path> = Arc::from(source);
    let stage: Arc<Path> = Arc::from(staging);
    let level = config.compression_level;
    let mut pool = WorkerPool::new("build", config.max_parallel);
    for chunk in &chunks {
        let chunk = chunk.clone();
        let base = Arc::clone(&base);
        let stage = Arc::clone(&stage);
        let cancel = cancel.clone();
        pool.submit_blocking(format!("build-chunk-{}", chunk.index), move || {
            build_chunk_archive(&chunk, &base, &stage, level, &cancel)
        });
    }
    {
        let base = Arc::clone(&base);
        let stage = Arc::clone(&stage);
        let large = large.clone();
        let gzip_level = config.gzip_level();
        let cancel = cancel.clone();
        pool.submit_blocking("build-bundle", move || {
            build_bundle(&base, &large, &stage, gzip_level, &cancel)
        });
    }
    let batch = pool.wait_all().await;
    let build_peak = batch.peak_active;
    let archives: Vec<ArchiveInfo> = batch.into_result()?;
    info!(archives = archives.len(), peak_active = build_peak, "[CHUNK] Build phase complete");

    // Checksum
    let mut pool = WorkerPool::new("checksum", config.max_parallel);
    for archive in &archives {
        let archive = archive.clone();
        pool.submit_blocking(format!("digest-{}", archive.name), move || {
            let digest = sha256_file(&archive.path).map_err(|e| SyncError::io(&archive.path, e))?;
            Ok(ArtifactSummary {
                name: archive.name,
                size: archive.size,
                digest,
            })
        });
    }
    let batch = pool.wait_all().await;
    let checksum_peak = batch.peak_active;
    let artifacts = batch.into_result()?;

    let mut manifest = Manifest::new(fingerprint.clone());
    for artifact in &artifacts {
        manifest.push(&artifact.name, &artifact.digest);
    }
    manifest.write_to(staging)?;
    publish(staging, out_dir, &manifest)?;

    let report = ChunkReport {
        skipped: false,
        fingerprint,
        chunks: chunks.len(),
        oversized_chunks,
        archive_bytes: artifacts.iter().map(|a| a.size).sum(),
        artifacts,
        peak_active: build_peak.max(checksum_peak),
        elapsed_ms: elapsed_ms(started),
    };
    info!(
        chunks = report.chunks,
        oversized = report.oversized_chunks,
        artifacts = report.artifacts.len(),
        archive_bytes = report.archive_bytes,
        elapsed_ms = report.elapsed_ms,
        "[CHUNK] Complete"
    );
    debug_json("chunk", &report);
    Ok(report)
}

/// A chunk directory whose fingerprint matches and whose manifest verifies is
/// reused as is. Anything short of that means a rebuild.
async fn reuse_existing(
    config: &EngineConfig,
    out_dir: &Path,
    fingerprint: &str,
    started: Instant,
) -> Option<ChunkReport> {
    let last = match local_fingerprint(out_dir) {
        Ok(last) => last,
        Err(e) => {
            warn!(error = %e, "[CHUNK] Existing fingerprint unreadable; rebuilding");
            return None;
        }
    };
    if !compare(fingerprint, last.as_deref()).is_unchanged() {
        return None;
    }
    let manifest = match Manifest::read_from(out_dir) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(error = %e, "[CHUNK] Fingerprint matches but manifest is unusable; rebuilding");
            return None;
        }
    };
    match verify_artifacts(&manifest, out_dir, config.max_parallel).await {
        Ok((report, _)) if report.is_ok() => {}
        Ok(_) | Err(_) => {
            warn!("[CHUNK] Fingerprint matches but artifacts fail verification; rebuilding");
            return None;
        }
    }

    let artifacts: Vec<ArtifactSummary> = manifest
        .entries
        .iter()
        .map(|entry| ArtifactSummary {
            name: entry.name.clone(),
            size: fs::metadata(out_dir.join(&entry.name))
                .map(|m| m.len())
                .unwrap_or(0),
            digest: entry.digest.clone(),
        })
        .collect();
    let report = ChunkReport {
        skipped: true,
        fingerprint: fingerprint.to_string(),
        chunks: artifacts.iter().filter(|a| is_chunk_name(&a.name)).count(),
        oversized_chunks: 0,
        archive_bytes: artifacts.iter().map(|a| a.size).sum(),
        artifacts,
        peak_active: 0,
        elapsed_ms: elapsed_ms(started),
    };
    info!(
        chunks = report.chunks,
        archive_bytes = report.archive_bytes,
        "[CHUNK] Source unchanged; existing artifacts reused"
    );
    Some(report)
}

async fn plan_large_subtree(large: &Path, bound: u64) -> Result<Vec<Chunk>> {
    if !large.exists() {
        warn!(large = %large.display(), "[PLAN] Large subtree absent; no chunks to build");
        return Ok(Vec::new());
    }
    let root = large.to_path_buf();
    tokio::task::spawn_blocking(move || plan_chunks(&root, bound))
        .await
        .map_err(|e| SyncError::Job {
            label: "plan".to_string(),
            message: e.to_string(),
        })?
}

/// Move a verified generation from `staging` into `target`. The old fingerprint
/// is removed first and the new one written last, so a fingerprint in `target`
/// always belongs to a complete set of artifacts.
fn publish(staging: &Path, target: &Path, manifest: &Manifest) -> Result<()> {
    remove_if_present(&target.join(FINGERPRINT_NAME))?;

    let entries = fs::read_dir(target).map_err(|e| SyncError::io(target, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SyncError::io(target, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let stale_chunk = is_chunk_name(&name) && manifest.get(&name).is_none();
        let stale_bundle = name == BUNDLE_NAME && !staging.join(BUNDLE_NAME).exists();
        if stale_chunk || stale_bundle {
            debug!(artifact = %name, "[PUBLISH] Removing stale artifact");
            remove_if_present(&entry.path())?;
        }
    }

    for name in manifest
        .entries
        .iter()
        .map(|e| e.name.as_str())
        .chain([MANIFEST_NAME, FINGERPRINT_NAME])
    {
        let from = staging.join(name);
        if !from.exists() {
            continue;
        }
        let to = target.join(name);
        fs::rename(&from, &to).map_err(|e| SyncError::io(&to, e))?;
    }
    info!(target = %target.display(), artifacts = manifest.entries.len(), "[PUBLISH] Generation published");
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::io(path, e)),
    }
}

/// Check every manifest entry in parallel: presence, size, digest, then the
/// compressed-stream header.
async fn verify_artifacts(
    manifest: &Manifest,
    dir: &Path,
    max_parallel: usize,
) -> Result<(VerifyReport, usize)> {
    let dir: Arc<Path> = Arc::from(dir);
    let mut pool = WorkerPool::new("verify", max_parallel);
    for entry in manifest.entries.iter().cloned() {
        let dir = Arc::clone(&dir);
        pool.submit_blocking(format!("verify-{}", entry.name), move || {
            let status = match verify_entry(&dir, &entry) {
                EntryStatus::Verified => match validate_archive(&dir.join(&entry.name)) {
                    Ok(_) => EntryStatus::Verified,
                    Err(SyncError::Integrity(e)) => EntryStatus::Failed(e),
                    Err(e) => return Err(e),
                },
                other => other,
            };
            Ok((entry.name, status))
        });
    }
    let batch = pool.wait_all().await;
    let peak = batch.peak_active;
    let report = VerifyReport {
        results: batch.into_result()?,
    };
    for failure in report.failures() {
        error!(error = %failure, dir = %dir.display(), "[VERIFY][ERROR] Manifest entry failed");
    }
    Ok((report, peak))
}

async fn restore_tree(config: &EngineConfig, chunk_dir: &Path, dest: &Path) -> Result<RestoreReport> {
    let started = Instant::now();
    info!(chunk_dir = %chunk_dir.display(), dest = %dest.display(), "[RESTORE] Starting");

    // Verify: everything, before the destination is touched.
    let manifest = Manifest::read_from(chunk_dir)?;
    let (report, verify_peak) = verify_artifacts(&manifest, chunk_dir, config.max_parallel).await?;
    let bundle_absent = report
        .results
        .iter()
        .any(|(_, status)| *status == EntryStatus::AcceptedAbsent);
    let to_extract: Vec<String> = report
        .results
        .iter()
        .filter(|(_, status)| *status == EntryStatus::Verified)
        .map(|(name, _)| name.clone())
        .collect();
    report.into_result()?;
    info!(artifacts = to_extract.len(), bundle_absent, "[RESTORE] Verification passed");

    // Extract
    fs::create_dir_all(dest).map_err(|e| SyncError::io(dest, e))?;
    let source_dir: Arc<Path> = Arc::from(chunk_dir);
    let dest_dir: Arc<Path> = Arc::from(dest);
    let mut pool = WorkerPool::new("extract", config.max_parallel);
    for name in to_extract {
        let source_dir = Arc::clone(&source_dir);
        let dest_dir = Arc::clone(&dest_dir);
        pool.submit_blocking(format!("extract-{name}"), move || {
            extract_archive(&source_dir.join(&name), &dest_dir)
        });
    }
    let batch = pool.wait_all().await;
    let extract_peak = batch.peak_active;
    let extracted = batch.into_result()?;

    let report = RestoreReport {
        artifacts_extracted: extracted.len(),
        bundle_absent,
        entries: extracted.iter().map(|e| e.entries).sum(),
        executables_marked: extracted.iter().map(|e| e.executables_marked).sum(),
        peak_active: verify_peak.max(extract_peak),
        elapsed_ms: elapsed_ms(started),
    };
    info!(
        artifacts = report.artifacts_extracted,
        entries = report.entries,
        executables_marked = report.executables_marked,
        elapsed_ms = report.elapsed_ms,
        "[RESTORE] Complete"
    );
    debug_json("restore", &report);
    Ok(report)
}

async fn upload_dir(
    config: &EngineConfig,
    store: &Arc<dyn BlobStore>,
    chunk_dir: &Path,
    prefix: &BlobRef,
) -> Result<TransferReport> {
    let started = Instant::now();
    info!(chunk_dir = %chunk_dir.display(), prefix = %prefix, "[UPLOAD] Starting");

    let manifest = Manifest::read_from(chunk_dir)?;
    let (report, _) = verify_artifacts(&manifest, chunk_dir, config.max_parallel).await?;
    let to_send: Vec<String> = report
        .results
        .iter()
        .filter(|(_, status)| *status == EntryStatus::Verified)
        .map(|(name, _)| name.clone())
        .collect();
    report.into_result()?;

    // Transfer
    let mut pool = WorkerPool::new("upload", config.max_parallel);
    for name in to_send {
        let store = Arc::clone(store);
        let local = chunk_dir.join(&name);
        let remote = prefix.join(&name);
        pool.submit(format!("put-{name}"), async move {
            let size = fs::metadata(&local).map_err(|e| SyncError::io(&local, e))?.len();
            match store.put(&local, &remote).await {
                Ok(()) => {
                    debug!(remote = %remote, size, "[UPLOAD] Artifact uploaded");
                    Ok(size)
                }
                Err(e) => {
                    error!(remote = %remote, error = %e, "[UPLOAD][ERROR] put failed");
                    Err(SyncError::transfer(remote.to_string(), e.to_string()))
                }
            }
        });
    }
    let batch = pool.wait_all().await;
    let peak_active = batch.peak_active;
    let sizes = batch.into_result()?;

    // Manifest, then the fingerprint as the completion marker.
    for name in [MANIFEST_NAME, FINGERPRINT_NAME] {
        let remote = prefix.join(name);
        if let Err(e) = store.put(&chunk_dir.join(name), &remote).await {
            error!(remote = %remote, error = %e, "[UPLOAD][ERROR] put failed");
            return Err(SyncError::transfer(remote.to_string(), e.to_string()));
        }
    }

    let report = TransferReport {
        prefix: prefix.to_string(),
        artifacts: sizes.len(),
        bytes: sizes.iter().sum(),
        peak_active,
        elapsed_ms: elapsed_ms(started),
    };
    info!(
        prefix = %prefix,
        artifacts = report.artifacts,
        bytes = report.bytes,
        elapsed_ms = report.elapsed_ms,
        "[UPLOAD] Complete"
    );
    debug_json("upload", &report);
    Ok(report)
}

async fn download_dir(
    config: &EngineConfig,
    store: &Arc<dyn BlobStore>,
    prefix: &BlobRef,
    chunk_dir: &Path,
    staging: &Path,
) -> Result<TransferReport> {
    let started = Instant::now();
    info!(prefix = %prefix, chunk_dir = %chunk_dir.display(), "[DOWNLOAD] Starting");

    let listed: HashSet<String> = store
        .list(prefix)
        .await
        .map_err(|e| SyncError::transfer(prefix.to_string(), e.to_string()))?
        .iter()
        .filter_map(|key| key.relative_to(prefix))
        .map(str::to_string)
        .collect();

    for name in [MANIFEST_NAME, FINGERPRINT_NAME] {
        if !listed.contains(name) {
            error!(prefix = %prefix, artifact = name, "[DOWNLOAD][ERROR] Required object missing under prefix");
            return Err(IntegrityError::MissingArtifact {
                name: name.to_string(),
            }
            .into());
        }
        let remote = prefix.join(name);
        store
            .get(&remote, &staging.join(name))
            .await
            .map_err(|e| SyncError::transfer(remote.to_string(), e.to_string()))?;
    }
    let manifest = Manifest::read_from(staging)?;

    // Transfer. Entries not listed remotely are left for verification to judge.
    let mut pool = WorkerPool::new("download", config.max_parallel);
    for entry in &manifest.entries {
        if !listed.contains(&entry.name) {
            if entry.name != BUNDLE_NAME {
                warn!(artifact = %entry.name, "[DOWNLOAD] Manifest entry not found under prefix");
            }
            continue;
        }
        let store = Arc::clone(store);
        let remote = prefix.join(&entry.name);
        let local = staging.join(&entry.name);
        pool.submit(format!("get-{}", entry.name), async move {
            if let Err(e) = store.get(&remote, &local).await {
                error!(remote = %remote, error = %e, "[DOWNLOAD][ERROR] get failed");
                return Err(SyncError::transfer(remote.to_string(), e.to_string()));
            }
            let size = fs::metadata(&local).map_err(|e| SyncError::io(&local, e))?.len();
            debug!(remote = %remote, size, "[DOWNLOAD] Artifact downloaded");
            Ok(size)
        });
    }
    let batch = pool.wait_all().await;
    let peak_active = batch.peak_active;
    let sizes = batch.into_result()?;

    // Verify
    let (report, _) = verify_artifacts(&manifest, staging, config.max_parallel).await?;
    report.into_result()?;

    publish(staging, chunk_dir, &manifest)?;

    let report = TransferReport {
        prefix: prefix.to_string(),
        artifacts: sizes.len(),
        bytes: sizes.iter().sum(),
        peak_active,
        elapsed_ms: elapsed_ms(started),
    };
    info!(
        prefix = %prefix,
        artifacts = report.artifacts,
        bytes = report.bytes,
        elapsed_ms = report.elapsed_ms,
        "[DOWNLOAD] Complete"
    );
    debug_json("download", &report);
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
#[allow(clippy::too_many_arguments)]
async fn push_tree(
    config: &EngineConfig,
    store: &Arc<dyn BlobStore>,
    source: &Path,
    prefix: &BlobRef,
    out_dir: &Path,
    staging: &Path,
    scratch: &Path,
    cancel: &CancelFlag,
) -> Result<PushReport> {
    let fingerprint = fingerprint_tree(source, config.max_parallel).await?;
    let remote = remote_fingerprint(store.as_ref(), prefix, scratch).await?;
    if compare(&fingerprint, remote.as_deref()).is_unchanged() {
        info!(prefix = %prefix, "[PUSH] Remote already holds this fingerprint; nothing to do");
        return Ok(PushReport {
            skipped: true,
            fingerprint,
            chunk: None,
            transfer: None,
        });
    }

    let chunk = chunk_tree(config, source, out_dir, staging, Some(fingerprint.clone()), cancel).await?;
    let transfer = upload_dir(config, store, out_dir, prefix).await?;
    info!(
        prefix = %prefix,
        chunks = chunk.chunks,
        bytes = transfer.bytes,
        "[PUSH] Complete"
    );
    Ok(PushReport {
        skipped: false,
        fingerprint,
        chunk: Some(chunk),
        transfer: Some(transfer),
    })
}
