//! Archive Builder / Extractor.
//!
//! Builder: writes a tar stream of files (relative to a base directory) through a
//! compressor into `<out_dir>/.<name>.partial`, then renames it into place. Any
//! failure removes the partial file, so a corrupt half-written archive is never
//! left behind.
//!
//! Extractor: before decoding, checks that the archive is non-empty and starts with
//! the magic bytes of its compression format. These are distinct integrity errors
//! and are logged with the byte size and leading bytes, since truncated transfers
//! are the usual way archives go bad. After extraction, files under `bin`-like
//! directories get their executable bits re-applied.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::{IntegrityError, Result, SyncError};
use crate::layout::{chunk_name, ArchiveFormat};
use crate::planner::Chunk;
use crate::scheduler::CancelFlag;

/// Directory names whose files are expected to be executable.
const BIN_DIRS: &[&str] = &["bin", "sbin", "libexec", "Scripts"];

/// How many leading bytes to report when a header is rejected.
const HEADER_PROBE_LEN: usize = 8;

/// A produced archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Members written.
    pub entries: usize,
    /// Members that vanished between planning and packaging.
    pub skipped: usize,
}

/// Result of extracting one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractInfo {
    pub name: String,
    pub entries: usize,
    pub executables_marked: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct MemberCounts {
    written: usize,
    skipped: usize,
}

/// Build the archive for one chunk inside `out_dir`. Paths inside the archive are
/// relative to `base`. `cancel` is checked before every member.
pub fn build_chunk_archive(
    chunk: &Chunk,
    base: &Path,
    out_dir: &Path,
    level: i32,
    cancel: &CancelFlag,
) -> Result<ArchiveInfo> {
    let name = chunk_name(chunk.index);
    debug!(
        chunk = chunk.index,
        files = chunk.files.len(),
        planned_bytes = chunk.size,
        "[BUILD] Building chunk archive"
    );
    build_archive(&name, ArchiveFormat::TarZstd, base, &chunk.files, out_dir, level, cancel)
}

/// Build `<out_dir>/<name>` from `members` (files, symlinks or directories under `base`).
pub(crate) fn build_archive(
    name: &str,
    format: ArchiveFormat,
    base: &Path,
    members: &[PathBuf],
    out_dir: &Path,
    level: i32,
    cancel: &CancelFlag,
) -> Result<ArchiveInfo> {
    let out = out_dir.join(name);
    let partial = out_dir.join(format!(".{name}.partial"));

    let written = File::create(&partial).and_then(|file| match format {
        ArchiveFormat::TarZstd => write_zstd(file, base, members, level, cancel),
        ArchiveFormat::TarGzip => write_gzip(file, base, members, level.clamp(0, 9) as u32, cancel),
    });

    let counts = match written.and_then(|counts| fs::rename(&partial, &out).map(|_| counts)) {
        Ok(counts) => counts,
        Err(e) => {
            if let Err(rm) = fs::remove_file(&partial) {
                if rm.kind() != io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = ?rm, "[BUILD] Could not remove partial archive");
                }
            }
            error!(artifact = name, error = ?e, "[BUILD][ERROR] Archive build failed, partial output removed");
            return Err(SyncError::build(name, e));
        }
    };

    let size = fs::metadata(&out).map_err(|e| SyncError::build(name, e))?.len();
    info!(
        artifact = name,
        size,
        entries = counts.written,
        skipped = counts.skipped,
        "[BUILD] Archive written"
    );
    Ok(ArchiveInfo {
        name: name.to_string(),
        path: out,
        size,
        entries: counts.written,
        skipped: counts.skipped,
    })
}

fn write_zstd(
    file: File,
    base: &Path,
    members: &[PathBuf],
    level: i32,
    cancel: &CancelFlag,
) -> io::Result<MemberCounts> {
    let encoder = zstd::Encoder::new(BufWriter::new(file), level)?;
    let (encoder, counts) = write_tar(encoder, base, members, cancel)?;
    let buffered = encoder.finish()?;
    finish_file(buffered)?;
    Ok(counts)
}

fn write_gzip(
    file: File,
    base: &Path,
    members: &[PathBuf],
    level: u32,
    cancel: &CancelFlag,
) -> io::Result<MemberCounts> {
    let encoder = flate2::write::GzEncoder::new(BufWriter::new(file), flate2::Compression::new(level));
    let (encoder, counts) = write_tar(encoder, base, members, cancel)?;
    let buffered = encoder.finish()?;
    finish_file(buffered)?;
    Ok(counts)
}

fn finish_file(buffered: BufWriter<File>) -> io::Result<()> {
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

fn write_tar<W: Write>(
    writer: W,
    base: &Path,
    members: &[PathBuf],
    cancel: &CancelFlag,
) -> io::Result<(W, MemberCounts)> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    let mut counts = MemberCounts::default();

    for path in members {
        cancel.check()?;
        let rel = path.strip_prefix(base).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not under {}", path.display(), base.display()),
            )
        })?;

        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "[BUILD] File disappeared before packaging, skipping");
                counts.skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let appended = if meta.is_dir() {
            builder.append_dir(rel, path)
        } else {
            builder.append_path_with_name(path, rel)
        };
        match appended {
            Ok(()) => counts.written += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "[BUILD] File disappeared before packaging, skipping");
                counts.skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    let writer = builder.into_inner()?;
    Ok((writer, counts))
}

fn artifact_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Integrity pre-check: the archive exists, is non-empty and carries the magic
/// bytes of the format its name implies.
pub fn validate_archive(path: &Path) -> Result<ArchiveFormat> {
    let name = artifact_name(path);
    let format = ArchiveFormat::for_name(&name).ok_or_else(|| {
        SyncError::extraction(&name, "unrecognised archive extension")
    })?;

    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            error!(artifact = %name, "[VERIFY][ERROR] Archive missing");
            return Err(IntegrityError::MissingArtifact { name }.into());
        }
        Err(e) => return Err(SyncError::io(path, e)),
    };
    let size = meta.len();
    if size == 0 {
        error!(
            artifact = %name,
            size,
            "[VERIFY][ERROR] Archive is empty; likely a truncated transfer"
        );
        return Err(IntegrityError::EmptyArtifact { name }.into());
    }

    let mut header = Vec::with_capacity(HEADER_PROBE_LEN);
    File::open(path)
        .and_then(|f| f.take(HEADER_PROBE_LEN as u64).read_to_end(&mut header))
        .map_err(|e| SyncError::io(path, e))?;

    if !header.starts_with(format.magic()) {
        let header_hex = hex_bytes(&header);
        error!(
            artifact = %name,
            size,
            header = %header_hex,
            expected = format.label(),
            "[VERIFY][ERROR] Archive header is not a valid compressed stream"
        );
        return Err(IntegrityError::InvalidHeader {
            name,
            expected: format.label(),
            size,
            header: header_hex,
        }
        .into());
    }
    Ok(format)
}

/// Validate and extract `archive` into `dest`, creating `dest` if needed.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<ExtractInfo> {
    let format = validate_archive(archive)?;
    let name = artifact_name(archive);

    fs::create_dir_all(dest).map_err(|e| SyncError::io(dest, e))?;
    let file = File::open(archive).map_err(|e| SyncError::io(archive, e))?;
    let reader = BufReader::new(file);

    let files = match format {
        ArchiveFormat::TarZstd => {
            let decoder = zstd::Decoder::new(reader)
                .map_err(|e| SyncError::extraction(&name, format!("zstd decoder: {e}")))?;
            unpack(decoder, dest, &name)?
        }
        ArchiveFormat::TarGzip => unpack(flate2::read::GzDecoder::new(reader), dest, &name)?,
    };

    let entries = files.len();
    let executables_marked = restore_exec_bits(dest, &files);
    debug!(
        artifact = %name,
        entries,
        executables_marked,
        "[EXTRACT] Archive extracted"
    );
    Ok(ExtractInfo {
        name,
        entries,
        executables_marked,
    })
}

fn unpack<R: Read>(reader: R, dest: &Path, name: &str) -> Result<Vec<PathBuf>> {
    let fail = |what: &str, e: io::Error| {
        error!(artifact = name, error = ?e, what, "[EXTRACT][ERROR] Decode failed");
        SyncError::extraction(name, format!("{what}: {e}"))
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut unpacked = Vec::new();
    for entry in archive.entries().map_err(|e| fail("read entries", e))? {
        let mut entry = entry.map_err(|e| fail("read entry", e))?;
        let rel = entry
            .path()
            .map_err(|e| fail("entry path", e))?
            .into_owned();
        let placed = entry
            .unpack_in(dest)
            .map_err(|e| fail(&format!("unpack {}", rel.display()), e))?;
        if !placed {
            warn!(artifact = name, path = %rel.display(), "[EXTRACT] Skipped entry escaping destination");
            continue;
        }
        unpacked.push(rel);
    }
    Ok(unpacked)
}

fn in_bin_dir(rel: &Path) -> bool {
    rel.parent()
        .map(|parent| {
            parent.components().any(|c| match c {
                Component::Normal(name) => BIN_DIRS.iter().any(|b| name == *b),
                _ => false,
            })
        })
        .unwrap_or(false)
}

/// Re-apply `+x` to regular files under bin-like directories. Best effort: failures
/// are logged and ignored. Returns how many files were marked.
#[cfg(unix)]
pub fn restore_exec_bits(dest: &Path, files: &[PathBuf]) -> usize {
    use std::os::unix::fs::PermissionsExt;

    let mut marked = 0;
    for rel in files.iter().filter(|rel| in_bin_dir(rel)) {
        let path = dest.join(rel);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = ?e, "[EXTRACT] Could not stat file for exec bit");
                continue;
            }
        };
        let mode = meta.permissions().mode();
        if mode & 0o111 == 0o111 {
            continue;
        }
        let updated = fs::Permissions::from_mode(mode | 0o111);
        match fs::set_permissions(&path, updated) {
            Ok(()) => marked += 1,
            Err(e) => warn!(path = %path.display(), error = ?e, "[EXTRACT] Could not restore exec bit"),
        }
    }
    marked
}

#[cfg(not(unix))]
pub fn restore_exec_bits(_dest: &Path, _files: &[PathBuf]) -> usize {
    0
}
