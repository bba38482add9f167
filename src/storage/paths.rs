//! Path helpers shared by the cache and run directories

use std::fs;
use std::path::{Path, PathBuf};

/// Expand a leading `~/` to the invoking user's home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand a path and make sure the directory behind it exists
pub fn ensure_dir(path: &str) -> std::io::Result<PathBuf> {
    let expanded = expand_path(path);
    fs::create_dir_all(&expanded)?;
    Ok(expanded)
}

/// Check whether a path exists (broken symlinks count as existing)
pub fn path_exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// Size of a file in bytes
pub fn file_size(path: &Path) -> std::io::Result<u64> {
    Ok(fs::metadata(path)?.len())
}
