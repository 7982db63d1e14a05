//! Destination tree traversal.
//!
//! Walks never follow symbolic links and never report them: the manifest
//! only tracks regular files.

use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Path relative to the walk's base, in manifest form
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,
}

/// Walk `root` and call `callback` for every regular file, with paths made
/// relative to `base`. A missing `root` is an empty tree.
///
/// Unreadable entries are logged and skipped. Names that are not valid UTF-8
/// are decoded lossily and will never match a manifest key.
pub fn walk_files_with_callback<F>(root: &Path, base: &Path, mut callback: F) -> std::io::Result<()>
where
    F: FnMut(FileInfo),
{
    if !root.exists() {
        return Ok(());
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(base).unwrap_or(path);
        if relative.to_str().is_none() {
            warn!("Path is not valid UTF-8: {}", relative.display());
        }
        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        callback(FileInfo {
            relative_path: relative.to_string_lossy().into_owned(),
            size,
        });
    }

    Ok(())
}

/// Collect every regular file under `root`, relative to `base`.
///
/// # Example
/// ```no_run
/// use verdict_backup::fs::walker::collect_files;
/// use std::path::Path;
///
/// let files = collect_files(Path::new("/mnt/disk/photos"), Path::new("/mnt/disk")).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn collect_files(root: &Path, base: &Path) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_files_with_callback(root, base, |file| files.push(file))?;
    Ok(files)
}

/// Sum of regular file sizes under `root` (apparent size, not disk blocks).
pub fn calculate_total_size(root: &Path) -> std::io::Result<u64> {
    let mut total_size = 0u64;
    walk_files_with_callback(root, root, |file| {
        total_size += file.size;
    })?;
    Ok(total_size)
}
