//! Manifest Manager: SHA-256 digests per artifact and the aggregate source
//! Fingerprint.
//!
//! On disk a manifest is two files in the chunk directory:
//! - `manifest.sha256`: `"<hex digest>  <artifact name>"` per line, the format
//!   `sha256sum -c` understands
//! - `fingerprint.sha256`: the Fingerprint of the source tree the artifacts were
//!   built from
//!
//! The Fingerprint is a SHA-256 over the sorted `(relative path, content digest)`
//! pairs of every file in the source tree, so it changes whenever any file's
//! content, name or presence does.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path};
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};

use crate::error::{IntegrityError, Result, SyncError};
use crate::layout::{BUNDLE_NAME, FINGERPRINT_NAME, MANIFEST_NAME};

/// One artifact and its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub digest: String,
}

/// Ordered artifact digests plus the source Fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
    pub fingerprint: String,
}

/// Outcome of checking one manifest entry against a local artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Verified,
    /// The auxiliary bundle is absent; accepted as empty.
    AcceptedAbsent,
    Failed(IntegrityError),
}

/// Per-entry verification results, in manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub results: Vec<(String, EntryStatus)>,
}

impl VerifyReport {
    pub fn failures(&self) -> Vec<&IntegrityError> {
        self.results
            .iter()
            .filter_map(|(_, status)| match status {
                EntryStatus::Failed(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn is_ok(&self) -> bool {
        self.failures().is_empty()
    }

    /// `Err` carrying the first failure, if any.
    pub fn into_result(self) -> Result<()> {
        match self.failures().into_iter().next() {
            Some(first) => Err(first.clone().into()),
            None => Ok(()),
        }
    }
}

fn digest_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9a-f]{64}$").expect("digest pattern is valid"))
}

/// SHA-256 of everything `reader` yields, as lowercase hex.
pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of a file's content.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    sha256_reader(BufReader::new(File::open(path)?))
}

impl Manifest {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Manifest {
            entries: Vec::new(),
            fingerprint: fingerprint.into(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, digest: impl Into<String>) {
        self.entries.push(ManifestEntry {
            name: name.into(),
            digest: digest.into(),
        });
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Manifest file body.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}  {}\n", e.digest, e.name))
            .collect()
    }

    /// Parse a manifest body. Blank lines are ignored; anything else must be
    /// `<64 hex>  <name>` with a plain file name.
    pub fn parse(body: &str, fingerprint: impl Into<String>) -> Result<Manifest> {
        let mut manifest = Manifest::new(fingerprint);
        for (i, line) in body.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let malformed = || IntegrityError::MalformedManifest {
                line_no: i + 1,
                line: line.to_string(),
            };
            let (digest, name) = line.split_once("  ").ok_or_else(malformed)?;
            let plain_name = Path::new(name)
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
                && !name.contains('/');
            if !digest_pattern().is_match(digest) || name.is_empty() || !plain_name {
                return Err(malformed().into());
            }
            if manifest.get(name).is_some() {
                return Err(malformed().into());
            }
            manifest.push(name, digest);
        }
        Ok(manifest)
    }

    /// Write `manifest.sha256` and `fingerprint.sha256` into `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        write_file_synced(&dir.join(MANIFEST_NAME), self.render().as_bytes())?;
        write_file_synced(
            &dir.join(FINGERPRINT_NAME),
            format!("{}\n", self.fingerprint).as_bytes(),
        )?;
        debug!(dir = %dir.display(), entries = self.entries.len(), "[MANIFEST] Written");
        Ok(())
    }

    /// Load the manifest and fingerprint from `dir`.
    pub fn read_from(dir: &Path) -> Result<Manifest> {
        let manifest_path = dir.join(MANIFEST_NAME);
        let body = match fs::read_to_string(&manifest_path) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                error!(dir = %dir.display(), "[MANIFEST][ERROR] No manifest in chunk directory");
                return Err(IntegrityError::MissingArtifact {
                    name: MANIFEST_NAME.to_string(),
                }
                .into());
            }
            Err(e) => return Err(SyncError::io(manifest_path, e)),
        };
        let fingerprint = read_fingerprint(dir)?.ok_or_else(|| IntegrityError::MissingArtifact {
            name: FINGERPRINT_NAME.to_string(),
        })?;
        Manifest::parse(&body, fingerprint)
    }

    /// Verify every entry against the artifacts in `dir`. Does not stop at the
    /// first failure; each entry gets its own status.
    pub fn verify(&self, dir: &Path) -> VerifyReport {
        let results = self
            .entries
            .iter()
            .map(|entry| (entry.name.clone(), verify_entry(dir, entry)))
            .collect();
        let report = VerifyReport { results };
        for failure in report.failures() {
            error!(error = %failure, dir = %dir.display(), "[VERIFY][ERROR] Manifest entry failed");
        }
        report
    }
}

/// Check one entry: present, non-empty, digest matches. A missing bundle is accepted.
pub fn verify_entry(dir: &Path, entry: &ManifestEntry) -> EntryStatus {
    let path = dir.join(&entry.name);
    let size = match fs::metadata(&path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if entry.name == BUNDLE_NAME {
                info!(artifact = %entry.name, "[VERIFY] Auxiliary bundle absent; treating as empty");
                return EntryStatus::AcceptedAbsent;
            }
            return EntryStatus::Failed(IntegrityError::MissingArtifact {
                name: entry.name.clone(),
            });
        }
        Err(e) => {
            warn!(artifact = %entry.name, error = ?e, "[VERIFY] Could not stat artifact");
            return EntryStatus::Failed(IntegrityError::MissingArtifact {
                name: entry.name.clone(),
            });
        }
    };
    if size == 0 {
        return EntryStatus::Failed(IntegrityError::EmptyArtifact {
            name: entry.name.clone(),
        });
    }
    match sha256_file(&path) {
        Ok(actual) if actual == entry.digest => EntryStatus::Verified,
        Ok(actual) => EntryStatus::Failed(IntegrityError::DigestMismatch {
            name: entry.name.clone(),
            expected: entry.digest.clone(),
            actual,
        }),
        Err(e) => {
            warn!(artifact = %entry.name, error = ?e, "[VERIFY] Could not read artifact");
            EntryStatus::Failed(IntegrityError::MissingArtifact {
                name: entry.name.clone(),
            })
        }
    }
}

/// Read `fingerprint.sha256` from `dir`; `None` if absent.
pub fn read_fingerprint(dir: &Path) -> Result<Option<String>> {
    let path = dir.join(FINGERPRINT_NAME);
    match fs::read_to_string(&path) {
        Ok(body) => {
            let value = body.trim().to_string();
            if !digest_pattern().is_match(&value) {
                return Err(IntegrityError::MalformedManifest {
                    line_no: 1,
                    line: value,
                }
                .into());
            }
            Ok(Some(value))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SyncError::io(path, e)),
    }
}

fn write_file_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| SyncError::io(path, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| SyncError::io(path, e))
}

/// Relative path with `/` separators, independent of platform.
pub fn portable_rel_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Content digest for one tree member: file bytes, or the target of a symlink.
pub fn member_digest(path: &Path) -> io::Result<String> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(path)?;
        let mut hasher = Sha256::new();
        hasher.update(b"symlink:");
        hasher.update(target.to_string_lossy().as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    } else {
        sha256_file(path)
    }
}

/// Combine `(relative path, digest)` pairs into a Fingerprint. Order of input
/// does not matter.
pub fn fingerprint_from_digests(mut pairs: Vec<(String, String)>) -> String {
    pairs.sort();
    let mut hasher = Sha256::new();
    for (rel, digest) in &pairs {
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
