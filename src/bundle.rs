//! Small-Folder Bundler: everything under the source root except the large subtree
//! goes into one gzip tarball.
//!
//! The long tail of small folders would cost more in per-chunk overhead than it
//! weighs, so it travels as a single artifact. Directories are recorded too, so
//! empty ones survive a round-trip. When nothing qualifies the bundle is still
//! written (an empty tarball), giving restore a single case to handle.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::archive::{build_archive, ArchiveInfo};
use crate::error::{Result, SyncError};
use crate::layout::{ArchiveFormat, BUNDLE_NAME};
use crate::scheduler::CancelFlag;

/// Collect members (directories, files, symlinks) under `root`, excluding `large`
/// and everything below it. Sorted for a stable archive layout.
pub fn collect_other_members(root: &Path, large: &Path) -> Result<Vec<PathBuf>> {
    fn visit_dir(dir: &Path, large: &Path, results: &mut Vec<PathBuf>) -> Result<()> {
        let entries =
            std::fs::read_dir(dir).map_err(|e| SyncError::planning(dir, e.to_string()))?;
        for entry_res in entries {
            let entry = entry_res.map_err(|e| SyncError::planning(dir, e.to_string()))?;
            let path = entry.path();
            if path == large {
                debug!(path = %path.display(), "[BUNDLE] Skipping large subtree");
                continue;
            }
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "[BUNDLE] Entry vanished during scan, skipping");
                    continue;
                }
                Err(e) => return Err(SyncError::planning(&path, e.to_string())),
            };
            if file_type.is_dir() {
                results.push(path.clone());
                visit_dir(&path, large, results)?;
            } else if file_type.is_file() || file_type.is_symlink() {
                results.push(path);
            }
        }
        Ok(())
    }

    let mut members = Vec::new();
    visit_dir(root, large, &mut members)?;
    members.sort();
    Ok(members)
}

/// Write `<out_dir>/other_folders.tar.gz` for `root`, excluding `large`.
pub fn build_bundle(
    root: &Path,
    large: &Path,
    out_dir: &Path,
    gzip_level: u32,
    cancel: &CancelFlag,
) -> Result<ArchiveInfo> {
    let members = collect_other_members(root, large)?;
    if members.is_empty() {
        info!(root = %root.display(), "[BUNDLE] Nothing outside the large subtree; writing empty bundle");
    }
    build_archive(
        BUNDLE_NAME,
        ArchiveFormat::TarGzip,
        root,
        &members,
        out_dir,
        gzip_level as i32,
        cancel,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::extract_archive;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn excludes_large_subtree_and_keeps_empty_dirs() {
        let src = tempdir().unwrap();
        let root = src.path();
        fs::create_dir_all(root.join("lib/site-packages")).unwrap();
        fs::write(root.join("lib/site-packages/torch.so"), b"big").unwrap();
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("bin/python"), b"#!").unwrap();
        fs::create_dir_all(root.join("share/empty")).unwrap();
        fs::write(root.join("pyvenv.cfg"), b"home = /usr").unwrap();

        let rels: Vec<PathBuf> = collect_other_members(root, &root.join("lib"))
            .unwrap()
            .into_iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            rels,
            vec![
                PathBuf::from("bin"),
                PathBuf::from("bin/python"),
                PathBuf::from("pyvenv.cfg"),
                PathBuf::from("share"),
                PathBuf::from("share/empty"),
            ]
        );

        let out = tempdir().unwrap();
        let info = build_bundle(root, &root.join("lib"), out.path(), 6, &CancelFlag::new()).unwrap();
        assert_eq!(info.name, BUNDLE_NAME);

        let dest = tempdir().unwrap();
        extract_archive(&info.path, dest.path()).unwrap();
        assert!(dest.path().join("share/empty").is_dir());
        assert_eq!(fs::read(dest.path().join("pyvenv.cfg")).unwrap(), b"home = /usr");
        assert!(!dest.path().join("lib").exists());
    }

    #[test]
    fn empty_bundle_is_still_written_and_extracts_cleanly() {
        let src = tempdir().unwrap();
        fs::create_dir_all(src.path().join("lib")).unwrap();
        let out = tempdir().unwrap();

        let info = build_bundle(src.path(), &src.path().join("lib"), out.path(), 1, &CancelFlag::new()).unwrap();
        assert_eq!(info.entries, 0);
        assert!(info.size > 0);

        let dest = tempdir().unwrap();
        let extracted = extract_archive(&info.path, dest.path()).unwrap();
        assert_eq!(extracted.entries, 0);
    }
}
