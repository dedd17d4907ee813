//! Directory traversal for sizing catalog entries and collecting backup payloads.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Entry names to skip entirely (exact match on the file or directory name)
    pub exclude_names: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_names: vec![
                "cache".to_string(),
                "code_cache".to_string(),
                ".thumbnails".to_string(),
            ],
        }
    }
}

impl WalkOptions {
    pub fn with_excludes(exclude_names: Vec<String>) -> Self {
        Self {
            exclude_names,
            ..Self::default()
        }
    }
}

/// Information about a regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Modification time (seconds since Unix epoch)
    pub mtime: i64,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// Symlinks are resolved; links to directories and broken links yield None.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(_) if entry.path_is_symlink() => return Ok(None),
            Err(e) => return Err(e),
        };
        if metadata.is_dir() {
            return Ok(None);
        }

        let mut relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        if relative_path.as_os_str().is_empty() {
            // Root itself is a file
            relative_path = PathBuf::from(entry.file_name());
        }
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Ok(Some(Self {
            path,
            relative_path,
            size: metadata.len(),
            mtime,
        }))
    }
}

/// Aggregate statistics of a directory tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub total_bytes: u64,
    pub file_count: usize,
    /// Newest modification time of any file (seconds since Unix epoch)
    pub newest_mtime: i64,
}

/// Walk a directory tree with a callback for each regular file
pub fn walk_files_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(FileInfo),
{
    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let mut iter = walker.into_iter();
    while let Some(entry) = iter.next() {
        let entry = entry?;

        if entry.depth() > 0 && should_exclude(&entry, &options.exclude_names) {
            if entry.file_type().is_dir() {
                iter.skip_current_dir();
            }
            continue;
        }

        if entry.file_type().is_dir() {
            continue;
        }

        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            callback(file_info);
        }
    }

    Ok(())
}

/// Walk a directory tree and collect all regular files, sorted by relative path
pub fn walk_files(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_files_with_callback(root, options, |file| files.push(file))?;
    Ok(files)
}

/// Compute size, file count and newest mtime of a directory tree.
/// A plain file root is measured as a single file.
pub fn tree_stats(root: &Path, options: &WalkOptions) -> std::io::Result<TreeStats> {
    let mut stats = TreeStats::default();

    walk_files_with_callback(root, options, |file| {
        stats.total_bytes += file.size;
        stats.file_count += 1;
        stats.newest_mtime = stats.newest_mtime.max(file.mtime);
    })?;

    Ok(stats)
}

/// Check if a directory entry should be excluded based on its name
fn should_exclude(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|name| file_name == name.as_str())
}
