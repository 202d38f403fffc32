//! Directory-set traversal for archive captures.
//!
//! Walks every configured root and records size and mtime per regular file,
//! which is what incremental and differential change detection compares.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// File name substrings to skip
    pub exclude_patterns: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_patterns: Vec::new(),
        }
    }
}

impl WalkOptions {
    pub fn excluding(patterns: &[String]) -> Self {
        Self {
            exclude_patterns: patterns.to_vec(),
            ..Self::default()
        }
    }
}

/// A regular file discovered during walking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Absolute path to the file
    pub path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Last modification (seconds since Unix epoch)
    pub mtime: i64,
}

impl FileInfo {
    /// Index key: the absolute path as text
    pub fn key(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    /// Symlinks are kept as links by tar; their own metadata is recorded.
    fn from_entry(entry: &DirEntry) -> std::io::Result<Option<Self>> {
        let metadata = entry.metadata().map_err(std::io::Error::other)?;
        if metadata.is_dir() {
            return Ok(None);
        }

        Ok(Some(Self {
            path: entry.path().to_path_buf(),
            size: metadata.len(),
            mtime: metadata.mtime(),
        }))
    }
}

/// Walk one root and collect all non-directory entries
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let mut walker = WalkDir::new(root).follow_links(options.follow_links);

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let entries = walker
        .into_iter()
        .filter_entry(|e| !should_exclude(e, &options.exclude_patterns));

    for entry in entries {
        let entry = entry.map_err(std::io::Error::other)?;

        if entry.file_type().is_dir() {
            continue;
        }

        if let Some(file_info) = FileInfo::from_entry(&entry)? {
            files.push(file_info);
        }
    }

    Ok(files)
}

/// Walk every root of a directory set. Missing roots are skipped and
/// reported back so the caller can log them.
pub fn walk_directory_set(
    roots: &[PathBuf],
    options: &WalkOptions,
) -> std::io::Result<(Vec<FileInfo>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut missing = Vec::new();

    for root in roots {
        if !root.exists() {
            missing.push(root.clone());
            continue;
        }
        files.extend(walk_directory(root, options)?);
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    files.dedup_by(|a, b| a.path == b.path);
    Ok((files, missing))
}

/// Calculate total size of a file list
pub fn total_size(files: &[FileInfo]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.size == 8 && f.mtime > 0));

        Ok(())
    }

    #[test]
    fn test_exclude_patterns_prune_directories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("node_modules"))?;
        fs::write(temp_dir.path().join("node_modules/dep.js"), b"x")?;
        fs::write(temp_dir.path().join("file.txt"), b"keep")?;
        fs::write(temp_dir.path().join(".DS_Store"), b"exclude")?;

        let options = WalkOptions::excluding(&["node_modules".into(), ".DS_Store".into()]);
        let files = walk_directory(temp_dir.path(), &options)?;
        assert_eq!(files.len(), 1);
        assert!(files[0].path.ends_with("file.txt"));

        Ok(())
    }

    #[test]
    fn test_directory_set_reports_missing_roots() -> std::io::Result<()> {
        let a = TempDir::new()?;
        let b = TempDir::new()?;
        fs::write(a.path().join("one"), b"12345")?;
        fs::write(b.path().join("two"), b"1234567")?;

        let roots = vec![
            a.path().to_path_buf(),
            b.path().to_path_buf(),
            PathBuf::from("/nonexistent/root"),
        ];
        let (files, missing) = walk_directory_set(&roots, &WalkOptions::default())?;

        assert_eq!(files.len(), 2);
        assert_eq!(total_size(&files), 12);
        assert_eq!(missing, vec![PathBuf::from("/nonexistent/root")]);

        Ok(())
    }
}
