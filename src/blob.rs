//! Typed remote object references.
//!
//! Remote locations are parsed once, at the boundary, into a [`BlobRef`].
//! Everything downstream derives keys with [`BlobRef::join`] instead of
//! re-parsing strings.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::SyncError;

/// `s3://<bucket>/<key>` reference. `key` has no leading or trailing `/` and may
/// be empty (bucket root).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobRef {
    pub bucket: String,
    pub key: String,
}

fn bucket_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // S3 bucket naming: 3-63 chars, lowercase, digits, dots and dashes,
    // starting and ending with a letter or digit.
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9.\-]{1,61}[a-z0-9]$").expect("bucket pattern is valid")
    })
}

impl BlobRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Result<Self, SyncError> {
        let bucket = bucket.into();
        let key = key.into();
        let input = format!("s3://{bucket}/{key}");
        Self::validated(&input, bucket, &key)
    }

    /// Parse `s3://bucket[/key...]`.
    pub fn parse(input: &str) -> Result<Self, SyncError> {
        let invalid = |reason: &str| SyncError::InvalidBlobRef {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let rest = input
            .strip_prefix("s3://")
            .ok_or_else(|| invalid("expected an s3:// reference"))?;
        let (bucket, key) = match rest.split_once('/') {
            Some((bucket, key)) => (bucket, key),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(invalid("bucket name is empty"));
        }
        Self::validated(input, bucket.to_string(), key)
    }

    fn validated(input: &str, bucket: String, key: &str) -> Result<Self, SyncError> {
        let invalid = |reason: String| SyncError::InvalidBlobRef {
            input: input.to_string(),
            reason,
        };

        if !bucket_pattern().is_match(&bucket) || bucket.contains("..") {
            return Err(invalid(format!("{bucket:?} is not a valid bucket name")));
        }

        let trimmed = key.trim_matches('/');
        let mut segments = Vec::new();
        for segment in trimmed.split('/').filter(|_| !trimmed.is_empty()) {
            if segment.is_empty() {
                return Err(invalid("key contains an empty path segment".to_string()));
            }
            if segment == "." || segment == ".." {
                return Err(invalid(format!("key segment {segment:?} is not allowed")));
            }
            segments.push(segment);
        }

        Ok(BlobRef {
            bucket,
            key: segments.join("/"),
        })
    }

    /// Child reference `<self>/<name>`.
    pub fn join(&self, name: &str) -> BlobRef {
        let name = name.trim_matches('/');
        let key = if self.key.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.key, name)
        };
        BlobRef {
            bucket: self.bucket.clone(),
            key,
        }
    }

    /// Last key segment (the artifact name for keys produced by [`BlobRef::join`]).
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or("")
    }

    /// Path of `self` below `prefix`, if `self` lies under it.
    pub fn relative_to(&self, prefix: &BlobRef) -> Option<&str> {
        if self.bucket != prefix.bucket {
            return None;
        }
        if prefix.key.is_empty() {
            return Some(&self.key);
        }
        self.key
            .strip_prefix(prefix.key.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "s3://{}", self.bucket)
        } else {
            write!(f, "s3://{}/{}", self.bucket, self.key)
        }
    }
}

impl FromStr for BlobRef {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BlobRef::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bucket_and_key() {
        let r = BlobRef::parse("s3://tenant-state/users/alice/runtime/").unwrap();
        assert_eq!(r.bucket, "tenant-state");
        assert_eq!(r.key, "users/alice/runtime");
        assert_eq!(r.to_string(), "s3://tenant-state/users/alice/runtime");
    }

    #[test]
    fn bucket_only_reference_has_empty_key() {
        let r = BlobRef::parse("s3://tenant-state").unwrap();
        assert_eq!(r.key, "");
        assert_eq!(r.join("manifest.sha256").key, "manifest.sha256");
    }

    #[test]
    fn rejects_malformed_references() {
        for input in [
            "tenant-state/key",
            "gs://tenant-state/key",
            "s3:///key",
            "s3://UPPER/key",
            "s3://ab/key",
            "s3://tenant-state/a//b",
            "s3://tenant-state/a/../b",
        ] {
            assert!(
                matches!(BlobRef::parse(input), Err(SyncError::InvalidBlobRef { .. })),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn join_and_relative_to_are_consistent() {
        let prefix = BlobRef::parse("s3://tenant-state/runtime").unwrap();
        let child = prefix.join("chunk_0001.tar.zst");
        assert_eq!(child.key, "runtime/chunk_0001.tar.zst");
        assert_eq!(child.file_name(), "chunk_0001.tar.zst");
        assert_eq!(child.relative_to(&prefix), Some("chunk_0001.tar.zst"));

        let sibling = BlobRef::parse("s3://tenant-state/runtime2/x").unwrap();
        assert_eq!(sibling.relative_to(&prefix), None);
    }
}
