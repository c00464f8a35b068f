// chunk-sync/src/config.rs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::{Result, SyncError};

pub const MIB: u64 = 1024 * 1024;

/// Engine configuration, passed explicitly into every pipeline entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on the summed file size of one chunk.
    pub chunk_size_bytes: u64,
    /// Worker pool size for build, extract and transfer phases.
    pub max_parallel: usize,
    /// zstd level for chunk archives (1..=22). The gzip bundle maps it onto 1..=9.
    pub compression_level: i32,
    pub log_sink: LogSink,
    /// Path of the large subtree, relative to the source root.
    pub large_subtree: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 512 * MIB,
            max_parallel: 4,
            compression_level: 3,
            log_sink: LogSink::Stderr,
            large_subtree: PathBuf::from("lib"),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_bytes == 0 {
            return Err(SyncError::config("chunk_size_bytes must be greater than zero"));
        }
        if self.max_parallel == 0 {
            return Err(SyncError::config("max_parallel must be at least 1"));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(SyncError::config(format!(
                "compression_level must be within 1..=22, got {}",
                self.compression_level
            )));
        }
        if self.large_subtree.is_absolute()
            || self
                .large_subtree
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(SyncError::config(format!(
                "large_subtree must be a relative path inside the source root, got {}",
                self.large_subtree.display()
            )));
        }
        Ok(())
    }

    /// Compression level for the gzip bundle.
    pub fn gzip_level(&self) -> u32 {
        (self.compression_level.clamp(1, 22) as u32 * 9).div_ceil(22)
    }

    pub fn trace_loaded(&self) {
        info!(
            chunk_size_bytes = self.chunk_size_bytes,
            max_parallel = self.max_parallel,
            compression_level = self.compression_level,
            large_subtree = %self.large_subtree.display(),
            "Loaded EngineConfig"
        );
        debug!(?self, "EngineConfig loaded (full debug)");
    }
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    #[default]
    Stderr,
    /// Append to the given file.
    File(PathBuf),
}
