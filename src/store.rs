//! # store: blob store client contract
//!
//! This module defines the [`BlobStore`] trait the pipelines transfer artifacts
//! through, plus two concrete clients:
//! - [`LocalBlobStore`]: buckets are directories under a root path. Used for tests,
//!   air-gapped hosts and network volumes mounted as a "remote".
//! - [`AwsCliBlobStore`]: shells out to the `aws s3` CLI, the same tool the
//!   deployment scripts already rely on.
//!
//! ## Contract
//! - `put(local, remote)` uploads one file, `get(remote, local)` downloads one,
//!   `list(prefix)` returns every key below a prefix.
//! - Errors are opaque boxed errors. The engine never retries; retry and backoff
//!   belong to the caller.
//!
//! ## Mocking & Testing
//! The trait is annotated for `mockall` so tests can inject transfer failures.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, error, info};

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::blob::BlobRef;

/// Error type for blob store clients (opaque to the engine).
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for moving artifacts to and from a remote blob store.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload `local_path` to `remote`, overwriting any existing object.
    async fn put(&self, local_path: &Path, remote: &BlobRef) -> Result<(), StoreError>;

    /// Download `remote` into `local_path`, overwriting any existing file.
    async fn get(&self, remote: &BlobRef, local_path: &Path) -> Result<(), StoreError>;

    /// List every object below `prefix`, sorted by key.
    async fn list(&self, prefix: &BlobRef) -> Result<Vec<BlobRef>, StoreError>;
}

/// Filesystem-backed store: `s3://bucket/key` maps to `<root>/bucket/key`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        info!(root = %root.display(), "Initialized LocalBlobStore");
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, blob: &BlobRef) -> PathBuf {
        let mut path = self.root.join(&blob.bucket);
        for segment in blob.key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    /// Copy through a sibling temp file so readers never see a half-written object.
    async fn copy_atomically(from: &Path, to: &Path) -> Result<(), StoreError> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file_name = to
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = to.with_file_name(format!(".{file_name}.{}.part", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::copy(from, &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(Box::new(e));
        }
        if let Err(e) = tokio::fs::rename(&staging, to).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(Box::new(e));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, local_path: &Path, remote: &BlobRef) -> Result<(), StoreError> {
        let target = self.object_path(remote);
        debug!(local = %local_path.display(), remote = %remote, "[STORE] put");
        Self::copy_atomically(local_path, &target).await
    }

    async fn get(&self, remote: &BlobRef, local_path: &Path) -> Result<(), StoreError> {
        let source = self.object_path(remote);
        debug!(remote = %remote, local = %local_path.display(), "[STORE] get");
        if !tokio::fs::try_exists(&source).await? {
            return Err(format!("object {remote} does not exist").into());
        }
        Self::copy_atomically(&source, local_path).await
    }

    async fn list(&self, prefix: &BlobRef) -> Result<Vec<BlobRef>, StoreError> {
        let base = self.object_path(prefix);
        let mut keys = Vec::new();
        if !tokio::fs::try_exists(&base).await? {
            return Ok(keys);
        }

        let mut pending = vec![base];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                // In-flight uploads.
                if name.starts_with('.') && name.ends_with(".part") {
                    continue;
                }
                let bucket_root = self.root.join(&prefix.bucket);
                let rel = path
                    .strip_prefix(&bucket_root)
                    .map_err(|e| format!("listing escaped bucket root: {e}"))?;
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(BlobRef {
                    bucket: prefix.bucket.clone(),
                    key,
                });
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Store client backed by the `aws` CLI (`aws s3 cp`, `aws s3 ls`).
#[derive(Debug, Clone, Default)]
pub struct AwsCliBlobStore {
    /// Custom endpoint for S3-compatible services.
    endpoint_url: Option<String>,
    program: Option<PathBuf>,
}

impl AwsCliBlobStore {
    pub fn new(endpoint_url: Option<String>) -> Self {
        info!(endpoint_url = ?endpoint_url, "Initialized AwsCliBlobStore");
        Self {
            endpoint_url,
            program: None,
        }
    }

    /// Use a specific `aws` executable instead of the one on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = match &self.program {
            Some(program) => Command::new(program),
            None => Command::new("aws"),
        };
        if let Some(endpoint) = &self.endpoint_url {
            cmd.arg("--endpoint-url").arg(endpoint);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn output(&self, mut cmd: Command, what: &str) -> Result<Output, StoreError> {
        match cmd.output().await {
            Ok(output) => Ok(output),
            Err(e) => {
                error!(error = ?e, what, "[STORE] Failed to launch aws CLI");
                Err(format!("failed to launch aws CLI for {what}: {e}").into())
            }
        }
    }

    fn check(output: Output, what: &str) -> Result<Vec<u8>, StoreError> {
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(status = %output.status, stderr = %stderr, what, "[STORE] aws CLI failed");
            return Err(format!("aws CLI {what} exited with {}: {stderr}", output.status).into());
        }
        Ok(output.stdout)
    }
}

/// Parse `aws s3 ls --recursive` output: `<date> <time> <size> <key>` per line.
pub fn parse_ls_output(bucket: &str, stdout: &str) -> Vec<BlobRef> {
    let mut keys: Vec<BlobRef> = stdout
        .lines()
        .filter_map(|line| {
            let mut rest = line.trim_start();
            for _ in 0..3 {
                let (_, tail) = rest.split_once(char::is_whitespace)?;
                rest = tail.trim_start();
            }
            (!rest.is_empty() && !rest.ends_with('/')).then(|| BlobRef {
                bucket: bucket.to_string(),
                key: rest.to_string(),
            })
        })
        .collect();
    keys.sort();
    keys
}

#[async_trait]
impl BlobStore for AwsCliBlobStore {
    async fn put(&self, local_path: &Path, remote: &BlobRef) -> Result<(), StoreError> {
        let mut cmd = self.command();
        cmd.args(["s3", "cp", "--only-show-errors"])
            .arg(local_path)
            .arg(remote.to_string());
        Self::check(self.output(cmd, "put").await?, "put").map(|_| ())
    }

    async fn get(&self, remote: &BlobRef, local_path: &Path) -> Result<(), StoreError> {
        let mut cmd = self.command();
        cmd.args(["s3", "cp", "--only-show-errors"])
            .arg(remote.to_string())
            .arg(local_path);
        Self::check(self.output(cmd, "get").await?, "get").map(|_| ())
    }

    async fn list(&self, prefix: &BlobRef) -> Result<Vec<BlobRef>, StoreError> {
        let mut cmd = self.command();
        // Trailing slash keeps `runtime` from also matching `runtime2/...`.
        cmd.args(["s3", "ls", "--recursive"]).arg(format!("{prefix}/"));
        let output = self.output(cmd, "list").await?;
        // `aws s3 ls` exits 1 with no output when nothing matches the prefix.
        if output.status.code() == Some(1) && output.stdout.is_empty() {
            debug!(prefix = %prefix, "[STORE] Empty listing");
            return Ok(Vec::new());
        }
        let stdout = Self::check(output, "list")?;
        Ok(parse_ls_output(
            &prefix.bucket,
            &String::from_utf8_lossy(&stdout),
        ))
    }
}
