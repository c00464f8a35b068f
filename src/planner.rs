//! Chunk Planner: partitions the large subtree into size-bounded file groups.
//!
//! Files are packed largest-first: sorted by descending size, each file goes into
//! the currently open chunk unless that would push it past the bound, in which case
//! the chunk is closed and a new one opened. A file bigger than the bound gets a
//! chunk of its own.
//!
//! Invariants of [`pack`]:
//! - every input file lands in exactly one chunk
//! - a chunk's size never exceeds the bound unless it holds a single oversized file

use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};

/// A file (or symlink) found during enumeration, with its size at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedFile {
    pub path: PathBuf,
    pub size: u64,
}

/// A size-bounded group of files destined for one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Sequence index, used in the archive name.
    pub index: usize,
    /// Absolute paths.
    pub files: Vec<PathBuf>,
    /// Summed size of `files` at planning time.
    pub size: u64,
    pub bound: u64,
}

impl Chunk {
    fn open(index: usize, bound: u64) -> Self {
        Chunk {
            index,
            files: Vec::new(),
            size: 0,
            bound,
        }
    }

    fn push(&mut self, file: SizedFile) {
        self.size += file.size;
        self.files.push(file.path);
    }

    /// True for the single-file chunk of a file larger than the bound.
    pub fn is_oversized(&self) -> bool {
        self.size > self.bound
    }
}

/// Recursively enumerate regular files and symlinks under `root`.
///
/// Directories are descended, symlinks are not followed. Symlinks count as zero
/// bytes. A missing or unreadable root is a planning error.
pub fn scan_files(root: &Path) -> Result<Vec<SizedFile>> {
    let meta = std::fs::metadata(root).map_err(|e| {
        error!(error = ?e, path = %root.display(), "[PLAN] Source subtree unreadable");
        SyncError::planning(root, e.to_string())
    })?;
    if !meta.is_dir() {
        return Err(SyncError::planning(root, "not a directory"));
    }

    fn visit_dir(dir: &Path, results: &mut Vec<SizedFile>) -> Result<()> {
        let entries =
            std::fs::read_dir(dir).map_err(|e| SyncError::planning(dir, e.to_string()))?;
        for entry_res in entries {
            let entry = entry_res.map_err(|e| SyncError::planning(dir, e.to_string()))?;
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "[PLAN] Entry vanished during scan, skipping");
                    continue;
                }
                Err(e) => return Err(SyncError::planning(&path, e.to_string())),
            };
            if file_type.is_dir() {
                visit_dir(&path, results)?;
            } else if file_type.is_symlink() {
                results.push(SizedFile { path, size: 0 });
            } else if file_type.is_file() {
                match entry.metadata() {
                    Ok(meta) => results.push(SizedFile {
                        path,
                        size: meta.len(),
                    }),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!(path = %path.display(), "[PLAN] File vanished during scan, skipping");
                    }
                    Err(e) => return Err(SyncError::planning(&path, e.to_string())),
                }
            } else {
                debug!(path = %path.display(), "[PLAN] Skipping special file");
            }
        }
        Ok(())
    }

    let mut results = Vec::new();
    visit_dir(root, &mut results)?;
    Ok(results)
}

/// Largest-first greedy packing of `files` into chunks of at most `bound` bytes.
pub fn pack(mut files: Vec<SizedFile>, bound: u64) -> Vec<Chunk> {
    // Ties broken by path so the plan is deterministic.
    files.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Option<Chunk> = None;
    let mut warned = false;

    for file in files {
        if file.size > bound {
            if !warned && file.size > bound.saturating_mul(2) {
                warn!(
                    path = %file.path.display(),
                    size = file.size,
                    bound,
                    "[PLAN] File exceeds twice the chunk bound; consider raising chunk_size_bytes"
                );
                warned = true;
            }
            if let Some(open) = current.take() {
                chunks.push(open);
            }
            let mut own = Chunk::open(chunks.len(), bound);
            own.push(file);
            chunks.push(own);
            continue;
        }

        match current.as_mut() {
            Some(open) if open.size + file.size <= bound => open.push(file),
            _ => {
                if let Some(full) = current.take() {
                    chunks.push(full);
                }
                let mut fresh = Chunk::open(chunks.len(), bound);
                fresh.push(file);
                current = Some(fresh);
            }
        }
    }
    if let Some(open) = current {
        chunks.push(open);
    }
    chunks
}

/// Enumerate `root` and pack it. An empty subtree yields zero chunks.
pub fn plan_chunks(root: &Path, bound: u64) -> Result<Vec<Chunk>> {
    if bound == 0 {
        return Err(SyncError::config("chunk bound must be greater than zero"));
    }
    let files = scan_files(root)?;
    let file_count = files.len();
    let total: u64 = files.iter().map(|f| f.size).sum();
    let chunks = pack(files, bound);
    info!(
        root = %root.display(),
        files = file_count,
        total_bytes = total,
        chunks = chunks.len(),
        oversized = chunks.iter().filter(|c| c.is_oversized()).count(),
        "[PLAN] Chunk plan ready"
    );
    Ok(chunks)
}
