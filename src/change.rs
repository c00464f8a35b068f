//! Change Detector: decides whether a sync has anything to do.
//!
//! The current Fingerprint of the source tree is compared with the last one that
//! was persisted after a successful run, either in a local chunk directory or
//! under a remote prefix. Equal means the run is a no-op.

use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::blob::BlobRef;
use crate::error::{Result, SyncError};
use crate::layout::FINGERPRINT_NAME;
use crate::manifest::{fingerprint_from_digests, member_digest, portable_rel_path, read_fingerprint};
use crate::planner::{scan_files, SizedFile};
use crate::scheduler::WorkerPool;
use crate::store::BlobStore;

/// Files per hashing job, so large trees don't turn into one job per file.
const FILES_PER_HASH_JOB: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDecision {
    Unchanged,
    Changed { previous: Option<String> },
}

impl ChangeDecision {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, ChangeDecision::Unchanged)
    }
}

/// Compare `current` against the last persisted Fingerprint.
pub fn compare(current: &str, last: Option<&str>) -> ChangeDecision {
    match last {
        Some(previous) if previous == current => {
            info!(fingerprint = current, "[CHANGE] Source unchanged since last successful sync");
            ChangeDecision::Unchanged
        }
        Some(previous) => {
            info!(previous, current, "[CHANGE] Source changed");
            ChangeDecision::Changed {
                previous: Some(previous.to_string()),
            }
        }
        None => {
            info!(current, "[CHANGE] No previous fingerprint; full sync required");
            ChangeDecision::Changed { previous: None }
        }
    }
}

/// Fingerprint of every file and symlink under `root`, hashed on up to
/// `max_parallel` blocking workers.
pub async fn fingerprint_tree(root: &Path, max_parallel: usize) -> Result<String> {
    let scan_root = root.to_path_buf();
    let files = tokio::task::spawn_blocking(move || scan_files(&scan_root))
        .await
        .map_err(|e| SyncError::Job {
            label: "scan".to_string(),
            message: e.to_string(),
        })??;
    let file_count = files.len();

    let root: Arc<Path> = Arc::from(root);
    let mut pool = WorkerPool::new("fingerprint", max_parallel);
    for (i, batch) in files.chunks(FILES_PER_HASH_JOB).enumerate() {
        let batch: Vec<SizedFile> = batch.to_vec();
        let root = Arc::clone(&root);
        pool.submit_blocking(format!("hash-batch-{i}"), move || digest_batch(&root, &batch));
    }
    let batches = pool.wait_all().await.into_result()?;
    let fingerprint = fingerprint_from_digests(batches.into_iter().flatten().collect());
    debug!(root = %root.display(), files = file_count, %fingerprint, "[CHANGE] Fingerprint computed");
    Ok(fingerprint)
}

/// `(relative path, digest)` pairs for one batch. A file deleted since the scan is
/// left out; any other read failure is fatal.
fn digest_batch(root: &Path, batch: &[SizedFile]) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::with_capacity(batch.len());
    for file in batch {
        match member_digest(&file.path) {
            Ok(digest) => pairs.push((portable_rel_path(root, &file.path), digest)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %file.path.display(), "[CHANGE] File vanished during fingerprinting, skipping");
            }
            Err(e) => return Err(SyncError::planning(&file.path, e.to_string())),
        }
    }
    Ok(pairs)
}

/// Last successful Fingerprint recorded in a local chunk directory.
pub fn local_fingerprint(chunk_dir: &Path) -> Result<Option<String>> {
    read_fingerprint(chunk_dir)
}

/// Last successful Fingerprint recorded under `prefix`. The fingerprint object is
/// uploaded last, so its presence marks a complete upload. `scratch` is a private
/// directory to download into.
pub async fn remote_fingerprint(
    store: &dyn BlobStore,
    prefix: &BlobRef,
    scratch: &Path,
) -> Result<Option<String>> {
    let marker = prefix.join(FINGERPRINT_NAME);
    let keys = store
        .list(prefix)
        .await
        .map_err(|e| SyncError::transfer(prefix.to_string(), e.to_string()))?;
    if !keys.contains(&marker) {
        debug!(prefix = %prefix, "[CHANGE] No remote fingerprint");
        return Ok(None);
    }
    store
        .get(&marker, &scratch.join(FINGERPRINT_NAME))
        .await
        .map_err(|e| SyncError::transfer(marker.to_string(), e.to_string()))?;
    read_fingerprint(scratch)
}
