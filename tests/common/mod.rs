#![allow(dead_code)]

use chunk_sync::config::EngineConfig;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const KIB: u64 = 1024;

/// Deterministic, poorly compressible bytes.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

pub fn write_file(root: &Path, rel: &str, bytes: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

#[cfg(unix)]
pub fn make_executable(root: &Path, rel: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = root.join(rel);
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

#[cfg(not(unix))]
pub fn make_executable(_root: &Path, _rel: &str) {}

/// A small runtime-like tree: a large `lib/` subtree with uneven file sizes,
/// executables under `bin/`, symlinks, and an empty directory outside `lib/`.
pub fn runtime_tree(root: &Path) {
    write_file(root, "lib/python3.11/site-packages/torch/_C.so", &noise(40 * KIB as usize, 1));
    write_file(root, "lib/python3.11/site-packages/numpy/core.so", &noise(12 * KIB as usize, 2));
    for i in 0..30 {
        write_file(
            root,
            &format!("lib/python3.11/site-packages/pkg{}/mod{i}.py", i % 4),
            format!("VALUE = {i}\n").repeat(i + 1).as_bytes(),
        );
    }
    write_file(root, "lib/python3.11/os.py", &noise(3 * KIB as usize, 3));
    write_file(root, "bin/python", &noise(2 * KIB as usize, 4));
    write_file(root, "bin/pip", b"#!/usr/bin/env python\nimport pip\n");
    make_executable(root, "bin/python");
    make_executable(root, "bin/pip");
    write_file(root, "include/python.h", b"#define PY 1\n");
    write_file(root, "pyvenv.cfg", b"home = /usr/bin\n");
    fs::create_dir_all(root.join("share/empty")).unwrap();

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink("python", root.join("bin/python3")).unwrap();
        std::os::unix::fs::symlink("python3.11", root.join("lib/python3")).unwrap();
    }
}

/// Small bound so the fixture spreads over several chunks.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        chunk_size_bytes: 16 * KIB,
        max_parallel: 3,
        compression_level: 3,
        ..EngineConfig::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir,
    File { bytes: Vec<u8>, executable: bool },
    Symlink(PathBuf),
}

/// Everything under `root`, keyed by relative path.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Node> {
    fn visit(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Node>) {
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap().to_path_buf();
            let meta = fs::symlink_metadata(&path).unwrap();
            if meta.file_type().is_symlink() {
                out.insert(rel, Node::Symlink(fs::read_link(&path).unwrap()));
            } else if meta.is_dir() {
                out.insert(rel, Node::Dir);
                visit(root, &path, out);
            } else {
                out.insert(
                    rel,
                    Node::File {
                        bytes: fs::read(&path).unwrap(),
                        executable: is_executable(&meta),
                    },
                );
            }
        }
    }
    let mut out = BTreeMap::new();
    visit(root, root, &mut out);
    out
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

/// Names of the files directly inside `dir`, sorted.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().unwrap().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
