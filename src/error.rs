//! Error taxonomy for the replication engine.
//!
//! Every failure the engine can surface maps onto one of five classes:
//! - **PlanningError**: the source tree is missing or unreadable
//! - **BuildError**: an archive could not be written (compression, disk, interrupted write)
//! - **TransferError**: the blob store client reported a failure
//! - **IntegrityError**: an artifact is empty, has a bad header, or fails its digest
//! - **ExtractionError**: an archive passed integrity checks but could not be decoded
//!
//! The remaining variants cover configuration, signal and worker plumbing.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for chunk-sync.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Source tree missing or unreadable.
    #[error("planning failed for {}: {reason}", path.display())]
    Planning { path: PathBuf, reason: String },

    /// Archive could not be produced. The partial output has already been removed.
    #[error("failed to build {artifact}: {source}")]
    Build {
        artifact: String,
        #[source]
        source: std::io::Error,
    },

    /// Opaque failure surfaced by the blob store client.
    #[error("transfer of {key} failed: {message}")]
    Transfer { key: String, message: String },

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// Decode failure after integrity checks passed.
    #[error("failed to extract {artifact}: {message}")]
    Extraction { artifact: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid blob reference {input:?}: {reason}")]
    InvalidBlobRef { input: String, reason: String },

    /// A worker panicked or was torn down before reporting.
    #[error("job {label} did not complete: {message}")]
    Job { label: String, message: String },

    #[error("interrupted by termination signal")]
    Interrupted,

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Integrity failures. Each variant is a distinct failure mode; truncated
/// transfers usually show up as `EmptyArtifact` or `InvalidHeader`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("artifact {name} is empty (0 bytes)")]
    EmptyArtifact { name: String },

    #[error("artifact {name} does not start with a valid {expected} header (size {size} bytes, first bytes [{header}])")]
    InvalidHeader {
        name: String,
        expected: &'static str,
        size: u64,
        header: String,
    },

    #[error("digest mismatch for {name}: manifest has {expected}, artifact hashes to {actual}")]
    DigestMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("artifact {name} is listed in the manifest but missing")]
    MissingArtifact { name: String },

    #[error("malformed manifest line {line_no}: {line:?}")]
    MalformedManifest { line_no: usize, line: String },
}

/// Result type alias for chunk-sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn planning(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Planning {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn build(artifact: impl Into<String>, source: std::io::Error) -> Self {
        Self::Build {
            artifact: artifact.into(),
            source,
        }
    }

    pub fn transfer(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn extraction(artifact: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extraction {
            artifact: artifact.into(),
            message: message.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Taxonomy name, used as the `class` field on error log lines.
    pub fn class(&self) -> &'static str {
        match self {
            SyncError::Planning { .. } => "PlanningError",
            SyncError::Build { .. } => "BuildError",
            SyncError::Transfer { .. } => "TransferError",
            SyncError::Integrity(_) => "IntegrityError",
            SyncError::Extraction { .. } => "ExtractionError",
            SyncError::Config(_) | SyncError::InvalidBlobRef { .. } => "ConfigError",
            SyncError::Job { .. } => "JobError",
            SyncError::Interrupted => "Interrupted",
            SyncError::Io { .. } => "IoError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::config("chunk size must be positive");
        assert_eq!(
            err.to_string(),
            "configuration error: chunk size must be positive"
        );

        let err = SyncError::from(IntegrityError::EmptyArtifact {
            name: "chunk_0003.tar.zst".into(),
        });
        assert_eq!(err.to_string(), "artifact chunk_0003.tar.zst is empty (0 bytes)");
    }

    #[test]
    fn test_invalid_header_carries_forensics() {
        let err = IntegrityError::InvalidHeader {
            name: "chunk_0000.tar.zst".into(),
            expected: "zstd",
            size: 17,
            header: "3c 68 74 6d".into(),
        };
        let text = err.to_string();
        assert!(text.contains("17 bytes"));
        assert!(text.contains("3c 68 74 6d"));
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(SyncError::planning("/src", "missing").class(), "PlanningError");
        assert_eq!(
            SyncError::build("chunk_0000.tar.zst", std::io::Error::other("disk full")).class(),
            "BuildError"
        );
        assert_eq!(SyncError::transfer("k", "boom").class(), "TransferError");
        assert_eq!(SyncError::extraction("a", "bad block").class(), "ExtractionError");
        assert_eq!(
            SyncError::from(IntegrityError::MissingArtifact { name: "x".into() }).class(),
            "IntegrityError"
        );
    }
}
