//! Names of the artifacts inside a chunk directory (and under a remote prefix).
//!
//! ```text
//! chunk_0000.tar.zst      one per Chunk, tar + zstd
//! chunk_0001.tar.zst
//! other_folders.tar.gz    everything outside the large subtree, tar + gzip
//! manifest.sha256         "<digest>  <artifact>" per artifact
//! fingerprint.sha256      aggregate source fingerprint
//! ```

use regex::Regex;
use std::sync::OnceLock;

pub const BUNDLE_NAME: &str = "other_folders.tar.gz";
pub const MANIFEST_NAME: &str = "manifest.sha256";
pub const FINGERPRINT_NAME: &str = "fingerprint.sha256";

const CHUNK_PREFIX: &str = "chunk_";
const CHUNK_SUFFIX: &str = ".tar.zst";

/// Archive name for the chunk with the given sequence index.
pub fn chunk_name(index: usize) -> String {
    format!("{CHUNK_PREFIX}{index:04}{CHUNK_SUFFIX}")
}

fn chunk_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^chunk_(\d{4,})\.tar\.zst$").expect("chunk name pattern is valid")
    })
}

/// Sequence index of a chunk archive name, or `None` for anything else.
pub fn chunk_index(name: &str) -> Option<usize> {
    chunk_pattern()
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn is_chunk_name(name: &str) -> bool {
    chunk_index(name).is_some()
}

/// Archive container format, decided by artifact name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarZstd,
    TarGzip,
}

impl ArchiveFormat {
    pub fn for_name(name: &str) -> Option<Self> {
        if name.ends_with(".tar.zst") {
            Some(ArchiveFormat::TarZstd)
        } else if name.ends_with(".tar.gz") {
            Some(ArchiveFormat::TarGzip)
        } else {
            None
        }
    }

    /// Leading magic bytes of the compressed stream.
    pub fn magic(self) -> &'static [u8] {
        match self {
            ArchiveFormat::TarZstd => &[0x28, 0xb5, 0x2f, 0xfd],
            ArchiveFormat::TarGzip => &[0x1f, 0x8b],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ArchiveFormat::TarZstd => "zstd",
            ArchiveFormat::TarGzip => "gzip",
        }
    }
}
