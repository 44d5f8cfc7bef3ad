//! Case-insensitive lookups on a mounted Windows volume.

use std::fs;
use std::path::{Path, PathBuf};

pub const WINDOWS_DIR: &str = "Windows";
pub const SYSTEM_HIVE_PATH: [&str; 4] = ["Windows", "System32", "config", "SYSTEM"];

/// Child of `dir` whose name matches `name` ignoring ASCII case.
pub fn find_child(dir: &Path, name: &str) -> Option<PathBuf> {
    let exact = dir.join(name);
    if exact.exists() {
        return Some(exact);
    }
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .find(|entry| entry.file_name().to_string_lossy().eq_ignore_ascii_case(name))
        .map(|entry| entry.path())
}

pub fn has_windows_marker(root: &Path) -> bool {
    find_child(root, WINDOWS_DIR).is_some_and(|path| path.is_dir())
}

pub fn find_system_hive(root: &Path) -> Option<PathBuf> {
    let path = SYSTEM_HIVE_PATH
        .iter()
        .try_fold(root.to_path_buf(), |dir, name| find_child(&dir, name))?;
    path.is_file().then_some(path)
}
